use crate::chat::{ChatClient, ChatConfig};
use crate::chunker::chunk_turns;
use crate::config::{Config, RagConfig};
use crate::dialogue;
use crate::embedding::embedder_from_config;
use crate::policy_index::{load_rules, PolicyIndex};
use crate::report;
use crate::scoring::{ChunkScorer, RuleRetrieval};
use crate::transcribe_backend::TranscribeBackend;
use crate::transcript::clean_transcript;
use crate::whisper_api::WhisperApiBackend;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// 文字起こし直後のテキスト
pub const RAW_TRANSCRIPT: &str = "1_raw_transcript.txt";
/// 整形済みテキスト
pub const CLEANED_TRANSCRIPT: &str = "2_cleaned_transcript.txt";
/// 話者ラベル付き対話
pub const LABELED_DIALOGUE: &str = "3_labeled_dialogue.txt";

/// 中間ファイル置き場
///
/// パイプラインの各段階はファイルを介してつながる。前段の出力
/// ファイルが残っていれば、後段だけをやり直せる。
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// ディレクトリが無ければ作る
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("データディレクトリの作成に失敗: {:?}", self.root))
    }

    pub fn raw_transcript(&self) -> PathBuf {
        self.root.join(RAW_TRANSCRIPT)
    }

    pub fn cleaned_transcript(&self) -> PathBuf {
        self.root.join(CLEANED_TRANSCRIPT)
    }

    pub fn labeled_dialogue(&self) -> PathBuf {
        self.root.join(LABELED_DIALOGUE)
    }

    pub fn audit_csv(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }
}

/// 前段の出力ファイルを読み込む
fn read_baton(path: &Path, producer: &str) -> Result<String> {
    let content = fs::read_to_string(path).with_context(|| {
        format!(
            "{:?} を読み込めません。先に {} を実行してください",
            path, producer
        )
    })?;
    if content.trim().is_empty() {
        anyhow::bail!("{:?} が空です", path);
    }
    Ok(content)
}

/// 音声ファイルを文字起こしして 1_raw_transcript.txt を書く
///
/// # Errors
///
/// バックエンドの初期化、文字起こしAPI呼び出し、またはファイル
/// 書き込みに失敗した場合にエラーを返す。
pub async fn run_transcribe(config: &Config, audio_path: &Path) -> Result<PathBuf> {
    let data_dir = DataDir::new(&config.pipeline.data_dir);
    data_dir.ensure()?;

    let backend: Box<dyn TranscribeBackend> =
        Box::new(WhisperApiBackend::from_config(&config.transcribe)?);
    log::info!("文字起こしバックエンド: {}", backend.name());

    let text = backend.transcribe_file(audio_path).await?;

    let output = data_dir.raw_transcript();
    fs::write(&output, &text)
        .with_context(|| format!("文字起こし結果の書き込みに失敗: {:?}", output))?;
    log::info!("文字起こし完了: {} 文字", text.chars().count());
    println!("Step 1 Complete: {} created.", output.display());
    Ok(output)
}

/// 1_raw_transcript.txt を整形して 2_cleaned_transcript.txt を書く
///
/// # Errors
///
/// 入力ファイルが無い・空、またはファイル書き込みに失敗した場合に
/// エラーを返す。
pub fn run_clean(config: &Config) -> Result<PathBuf> {
    let data_dir = DataDir::new(&config.pipeline.data_dir);
    let raw = read_baton(&data_dir.raw_transcript(), "transcribe")?;

    let cleaned = clean_transcript(&raw);
    log::info!(
        "整形完了: {} 文字 -> {} 文字",
        raw.chars().count(),
        cleaned.chars().count()
    );

    let output = data_dir.cleaned_transcript();
    fs::write(&output, &cleaned)
        .with_context(|| format!("整形結果の書き込みに失敗: {:?}", output))?;
    println!("Step 2 Complete: {} created.", output.display());
    Ok(output)
}

/// 2_cleaned_transcript.txt をラベル付けして 3_labeled_dialogue.txt を書く
///
/// # Errors
///
/// 入力ファイルが無い・空、LLM呼び出し、またはファイル書き込みに
/// 失敗した場合にエラーを返す。
pub async fn run_label(config: &Config) -> Result<PathBuf> {
    let data_dir = DataDir::new(&config.pipeline.data_dir);
    let cleaned = read_baton(&data_dir.cleaned_transcript(), "clean")?;

    let chat = ChatClient::new(ChatConfig::from_llm(&config.llm)?)?;
    let labeled = dialogue::label_dialogue(&chat, &config.label, &cleaned).await?;

    let output = data_dir.labeled_dialogue();
    fs::write(&output, &labeled)
        .with_context(|| format!("ラベル付け結果の書き込みに失敗: {:?}", output))?;
    println!("Step 3 Complete: {} created.", output.display());
    Ok(output)
}

/// 3_labeled_dialogue.txt を採点して監査結果CSVを書く
///
/// `shutdown` はチャンク単位でチェックされる。中断されても
/// 採点済みの分でCSVを書き出す。
///
/// # Errors
///
/// 入力ファイルが無い・空、ターンが読み取れない、採点呼び出し、
/// またはCSV書き込みに失敗した場合にエラーを返す。
pub async fn run_score(config: &Config, shutdown: &AtomicBool) -> Result<PathBuf> {
    let data_dir = DataDir::new(&config.pipeline.data_dir);
    let labeled = read_baton(&data_dir.labeled_dialogue(), "label")?;

    let turns = dialogue::parse_dialogue(
        &labeled,
        &config.label.agent_label,
        &config.label.customer_label,
    );
    if turns.is_empty() {
        anyhow::bail!(
            "ラベル付き対話からターンを読み取れませんでした: {:?}",
            data_dir.labeled_dialogue()
        );
    }
    log::info!("{} ターンを読み込みました", turns.len());

    let chunks = chunk_turns(&turns, config.scoring.chunk_turns)?;
    log::info!(
        "{} チャンクに分割 (chunk_turns={})",
        chunks.len(),
        config.scoring.chunk_turns
    );

    let chat = ChatClient::new(ChatConfig::from_llm(&config.llm)?)?;
    let retrieval = if config.rag.enabled {
        match build_retrieval(&config.rag) {
            Ok(retrieval) => Some(retrieval),
            Err(e) => {
                log::warn!("ルール検索を初期化できません。ルールなしで採点します: {}", e);
                None
            }
        }
    } else {
        log::info!("ルール検索は無効化されています");
        None
    };
    let scorer = ChunkScorer::new(chat, config.scoring.model.clone(), retrieval);

    let outcome = scorer.run_audit(&chunks, shutdown).await?;
    if outcome.interrupted {
        log::warn!(
            "監査は中断されました。採点済みの {} チャンク分でCSVを書き出します",
            outcome.chunks.len()
        );
    }

    let csv_path = data_dir.audit_csv(&config.output.csv_filename);
    report::write_audit_csv(&csv_path, &outcome.chunks, &outcome.summary)?;
    println!("\nCSV file saved: {}", csv_path.display());

    report::print_summary(&outcome.summary);
    Ok(csv_path)
}

/// 監査結果CSVを読み戻してチャンク別結果とサマリを表示する
///
/// # Errors
///
/// CSVの読み込みまたはパースに失敗した場合にエラーを返す。
pub fn run_report(config: &Config) -> Result<()> {
    let data_dir = DataDir::new(&config.pipeline.data_dir);
    let csv_path = data_dir.audit_csv(&config.output.csv_filename);
    let audit = report::read_audit_csv(&csv_path)?;
    log::info!(
        "{} チャンク行を読み込みました (FINAL行: {})",
        audit.chunks.len(),
        if audit.has_final_row { "あり" } else { "なし" }
    );

    println!("--- CHUNK RESULTS ---");
    for row in &audit.chunks {
        println!(
            "Chunk {}: empathy {:.2} / professionalism {:.2} / {}",
            row.chunk, row.empathy, row.professionalism, row.compliance
        );
        if !row.reason.is_empty() {
            println!("  reason: {}", row.reason);
        }
    }

    report::print_summary(&audit.summary);
    Ok(())
}

/// ポリシーファイルのルールをインデックスに登録する
///
/// インデックスが無ければ作成し、準備完了を待ってから登録する。
///
/// # Errors
///
/// ポリシーファイルの読み込み、インデックスの作成、または登録に
/// 失敗した場合にエラーを返す。
pub async fn run_index_policies(config: &Config, policy_path: &Path) -> Result<usize> {
    let rules = load_rules(policy_path)?;
    if rules.is_empty() {
        anyhow::bail!("ポリシーファイルにルールがありません: {:?}", policy_path);
    }
    log::info!("{} 件のルールを読み込みました", rules.len());

    let index = PolicyIndex::new(config.rag.clone())?;
    log::info!("登録先インデックス: {}", index.index_name());
    index.ensure_index().await?;

    let embedder = embedder_from_config(&config.rag)?;
    log::debug!("埋め込み次元: {}", embedder.dimension());
    let count = index.upsert_rules(&rules, embedder.as_ref()).await?;
    println!("Successfully uploaded {} policies to Pinecone", count);
    Ok(count)
}

/// 音声ファイルから監査CSVまでの全段階を順に実行する
///
/// 各段階の間で中断要求をチェックする。採点中の中断は
/// [`run_score`] が部分結果として処理する。
///
/// # Errors
///
/// いずれかの段階が失敗した場合、または段階間で中断要求を検出
/// した場合にエラーを返す。
pub async fn run_full(config: &Config, audio_path: &Path, shutdown: &AtomicBool) -> Result<()> {
    run_transcribe(config, audio_path).await?;
    ensure_not_interrupted(shutdown)?;
    run_clean(config)?;
    ensure_not_interrupted(shutdown)?;
    run_label(config).await?;
    ensure_not_interrupted(shutdown)?;
    run_score(config, shutdown).await?;
    Ok(())
}

fn ensure_not_interrupted(shutdown: &AtomicBool) -> Result<()> {
    if shutdown.load(Ordering::SeqCst) {
        anyhow::bail!("中断要求により停止しました");
    }
    Ok(())
}

fn build_retrieval(rag: &RagConfig) -> Result<RuleRetrieval> {
    let index = PolicyIndex::new(rag.clone())?;
    let embedder = embedder_from_config(rag)?;
    Ok(RuleRetrieval::new(index, embedder, rag.top_k))
}
