use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub transcribe: TranscribeConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub label: LabelConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// パイプライン全体の設定
///
/// 中間ファイルと成果物の置き場所に関する設定。
///
/// # デフォルト値
///
/// - `data_dir`: "./data"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// 文字起こしプロバイダの種類
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AsrProvider {
    /// Groq (OpenAI互換エンドポイント)
    Groq,
    /// OpenAI
    Openai,
}

impl AsrProvider {
    /// APIキーを探す環境変数名
    pub fn api_key_env(&self) -> &'static str {
        match self {
            AsrProvider::Groq => "GROQ_API_KEY",
            AsrProvider::Openai => "OPENAI_API_KEY",
        }
    }

    /// OpenAI互換エンドポイントのベースURL
    pub fn base_url(&self) -> &'static str {
        match self {
            AsrProvider::Groq => "https://api.groq.com/openai/v1",
            AsrProvider::Openai => "https://api.openai.com/v1",
        }
    }
}

/// 文字起こし設定
///
/// 音声ファイルを送信するWhisper系APIに関する設定。
///
/// # デフォルト値
///
/// - `provider`: "groq"
/// - `model`: "whisper-large-v3"
/// - `segment_seconds`: 600 秒 (アップロード上限を超えるWAVの分割単位)
/// - `max_upload_bytes`: 26214400 (25 MiB)
/// - `timeout_seconds`: 120 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscribeConfig {
    #[serde(default = "default_asr_provider")]
    pub provider: AsrProvider,
    #[serde(default = "default_transcribe_model")]
    pub model: String,
    /// 言語コード（"ja", "en" など）。省略時はAPI側の自動判定
    pub language: Option<String>,
    /// APIキー。省略時はプロバイダに対応する環境変数から読む
    pub api_key: Option<String>,
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_transcribe_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl TranscribeConfig {
    /// 文字起こしAPIキーを解決
    ///
    /// 設定ファイルの `api_key` を優先し、未設定ならプロバイダに
    /// 対応する環境変数（GROQ_API_KEY / OPENAI_API_KEY）を読む。
    ///
    /// # Errors
    ///
    /// どちらにもキーが無い場合にエラーを返す。
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        let var = self.provider.api_key_env();
        env::var(var).with_context(|| {
            format!(
                "文字起こしAPIキーが見つかりません（transcribe.api_key または環境変数 {}）",
                var
            )
        })
    }
}

/// LLM共通設定
///
/// ラベル付けと採点の両方で使うチャット補完APIに関する設定。
///
/// # デフォルト値
///
/// - `base_url`: "https://api.groq.com/openai/v1"
/// - `api_key_env`: "GROQ_API_KEY"
/// - `max_retries`: 3 回
/// - `retry_backoff_ms`: 2000 ms
/// - `timeout_seconds`: 60 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// APIキー。省略時は `api_key_env` の環境変数から読む
    pub api_key: Option<String>,
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl LlmConfig {
    /// チャット補完APIキーを解決
    ///
    /// 設定ファイルの `api_key` を優先し、未設定なら `api_key_env` で
    /// 指定された環境変数を読む。
    ///
    /// # Errors
    ///
    /// どちらにもキーが無い場合にエラーを返す。
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        env::var(&self.api_key_env).with_context(|| {
            format!(
                "LLM APIキーが見つかりません（llm.api_key または環境変数 {}）",
                self.api_key_env
            )
        })
    }
}

/// 話者ラベル付け設定
///
/// 生の文字起こしを `Agent:` / `Customer:` 形式の対話に整形する
/// LLM呼び出しに関する設定。
///
/// # デフォルト値
///
/// - `model`: "llama-3.3-70b-versatile"
/// - `agent_label`: "Agent"
/// - `customer_label`: "Customer"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabelConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_agent_label")]
    pub agent_label: String,
    #[serde(default = "default_customer_label")]
    pub customer_label: String,
}

/// 採点設定
///
/// チャンク分割とチャンク単位の採点LLM呼び出しに関する設定。
///
/// # デフォルト値
///
/// - `model`: "llama-3.3-70b-versatile"
/// - `chunk_turns`: 5 ターン
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_chunk_turns")]
    pub chunk_turns: usize,
}

/// 埋め込みバックエンドの種類
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendType {
    /// APIキー不要の決定的ハッシュ埋め込み
    Hash,
    /// OpenAI embeddings API
    Openai,
}

/// ルール検索 (RAG) 設定
///
/// コンプライアンスルールを保持するベクトルインデックスと
/// クエリ埋め込みに関する設定。
///
/// # デフォルト値
///
/// - `enabled`: true
/// - `index_name`: "compliance-rules"
/// - `dimension`: 384
/// - `metric`: "cosine"
/// - `cloud`: "aws"
/// - `region`: "us-east-1"
/// - `top_k`: 2 件
/// - `embedding`: "hash"
/// - `embedding_model`: "text-embedding-3-small"
/// - `timeout_seconds`: 30 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RagConfig {
    #[serde(default = "default_rag_enabled")]
    pub enabled: bool,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_cloud")]
    pub cloud: String,
    #[serde(default = "default_rag_region")]
    pub region: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Pinecone APIキー。省略時は環境変数 PINECONE_API_KEY から読む
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_backend")]
    pub embedding: EmbeddingBackendType,
    /// 埋め込みAPIキー。省略時は環境変数 OPENAI_API_KEY から読む
    pub embedding_api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_rag_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl RagConfig {
    /// Pinecone APIキーを解決
    ///
    /// # Errors
    ///
    /// 設定と環境変数 PINECONE_API_KEY のどちらにもキーが無い場合に
    /// エラーを返す。
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        env::var("PINECONE_API_KEY").with_context(|| {
            "Pinecone APIキーが見つかりません（rag.api_key または環境変数 PINECONE_API_KEY）"
        })
    }

    /// 埋め込みAPIキーを解決
    ///
    /// `embedding = "openai"` のときのみ必要。
    ///
    /// # Errors
    ///
    /// 設定と環境変数 OPENAI_API_KEY のどちらにもキーが無い場合に
    /// エラーを返す。
    pub fn resolve_embedding_api_key(&self) -> Result<String> {
        if let Some(key) = &self.embedding_api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        env::var("OPENAI_API_KEY").with_context(|| {
            "埋め込みAPIキーが見つかりません（rag.embedding_api_key または環境変数 OPENAI_API_KEY）"
        })
    }
}

/// 出力設定
///
/// 監査結果CSVに関する設定。
///
/// # デフォルト値
///
/// - `csv_filename`: "audit_results.csv"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_csv_filename")]
    pub csv_filename: String,
}

// Default functions
fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_asr_provider() -> AsrProvider {
    AsrProvider::Groq
}

fn default_transcribe_model() -> String {
    "whisper-large-v3".to_string()
}

fn default_segment_seconds() -> u64 {
    600 // 10分ごとに分割してアップロード
}

fn default_max_upload_bytes() -> u64 {
    26_214_400 // 25 MiB
}

fn default_transcribe_timeout_seconds() -> u64 {
    120
}

fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llm_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_llm_timeout_seconds() -> u64 {
    60
}

fn default_chat_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_agent_label() -> String {
    "Agent".to_string()
}

fn default_customer_label() -> String {
    "Customer".to_string()
}

fn default_chunk_turns() -> usize {
    5
}

fn default_rag_enabled() -> bool {
    true
}

fn default_index_name() -> String {
    "compliance-rules".to_string()
}

fn default_dimension() -> usize {
    384
}

fn default_metric() -> String {
    "cosine".to_string()
}

fn default_cloud() -> String {
    "aws".to_string()
}

fn default_rag_region() -> String {
    "us-east-1".to_string()
}

fn default_top_k() -> usize {
    2
}

fn default_embedding_backend() -> EmbeddingBackendType {
    EmbeddingBackendType::Hash
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_rag_timeout_seconds() -> u64 {
    30
}

fn default_csv_filename() -> String {
    "audit_results.csv".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            transcribe: TranscribeConfig::default(),
            llm: LlmConfig::default(),
            label: LabelConfig::default(),
            scoring: ScoringConfig::default(),
            rag: RagConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            provider: default_asr_provider(),
            model: default_transcribe_model(),
            language: None,
            api_key: None,
            segment_seconds: default_segment_seconds(),
            max_upload_bytes: default_max_upload_bytes(),
            timeout_seconds: default_transcribe_timeout_seconds(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            api_key_env: default_llm_api_key_env(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_seconds: default_llm_timeout_seconds(),
        }
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            agent_label: default_agent_label(),
            customer_label: default_customer_label(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            chunk_turns: default_chunk_turns(),
        }
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: default_rag_enabled(),
            index_name: default_index_name(),
            dimension: default_dimension(),
            metric: default_metric(),
            cloud: default_cloud(),
            region: default_rag_region(),
            top_k: default_top_k(),
            api_key: None,
            embedding: default_embedding_backend(),
            embedding_api_key: None,
            embedding_model: default_embedding_model(),
            timeout_seconds: default_rag_timeout_seconds(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv_filename: default_csv_filename(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Arguments
    ///
    /// * `path` - 設定ファイルのパス
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use call_audit::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// デフォルト値を持つ設定ファイルを生成する。
    /// 既存のファイルは上書きされる。
    ///
    /// # Arguments
    ///
    /// * `path` - 出力先のパス
    ///
    /// # Errors
    ///
    /// ファイルの書き込みに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use call_audit::config::Config;
    /// Config::write_default("config.toml").unwrap();
    /// ```
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// 設定ファイルの存在を確認し、存在する場合は読み込み、
    /// 存在しない場合はデフォルト設定を返す。
    ///
    /// # Arguments
    ///
    /// * `path` - 設定ファイルのパス
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    /// ファイルが存在しない場合はエラーにならず、デフォルト設定を返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use call_audit::config::Config;
    /// let config = Config::load_or_default("config.toml").unwrap();
    /// ```
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pipeline.data_dir, "./data");
        assert_eq!(config.transcribe.provider, AsrProvider::Groq);
        assert_eq!(config.transcribe.model, "whisper-large-v3");
        assert_eq!(config.transcribe.max_upload_bytes, 26_214_400);
        assert_eq!(config.llm.base_url, "https://api.groq.com/openai/v1");
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.label.agent_label, "Agent");
        assert_eq!(config.scoring.chunk_turns, 5);
        assert_eq!(config.rag.index_name, "compliance-rules");
        assert_eq!(config.rag.dimension, 384);
        assert_eq!(config.rag.top_k, 2);
        assert_eq!(config.output.csv_filename, "audit_results.csv");
    }

    #[test]
    fn test_write_and_read_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        // デフォルト設定を書き込み
        Config::write_default(path).unwrap();

        // 読み込み
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.transcribe.model, "whisper-large-v3");
        assert_eq!(config.rag.metric, "cosine");
    }

    #[test]
    fn test_custom_config() {
        let toml_content = r#"
[pipeline]
data_dir = "/tmp/audit"

[transcribe]
provider = "openai"
model = "whisper-1"
language = "en"
segment_seconds = 300
timeout_seconds = 90

[llm]
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"
max_retries = 5
retry_backoff_ms = 500

[label]
model = "gpt-4o-mini"
agent_label = "Operator"
customer_label = "Caller"

[scoring]
model = "gpt-4o-mini"
chunk_turns = 8

[rag]
enabled = false
index_name = "policies"
dimension = 1536
top_k = 3
embedding = "openai"

[output]
csv_filename = "scores.csv"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(config.pipeline.data_dir, "/tmp/audit");
        assert_eq!(config.transcribe.provider, AsrProvider::Openai);
        assert_eq!(config.transcribe.language.as_deref(), Some("en"));
        assert_eq!(config.transcribe.segment_seconds, 300);
        assert_eq!(config.llm.max_retries, 5);
        assert_eq!(config.label.agent_label, "Operator");
        assert_eq!(config.scoring.chunk_turns, 8);
        assert!(!config.rag.enabled);
        assert_eq!(config.rag.dimension, 1536);
        assert_eq!(config.rag.embedding, EmbeddingBackendType::Openai);
        assert_eq!(config.output.csv_filename, "scores.csv");
        // 省略したキーはデフォルトのまま
        assert_eq!(config.transcribe.max_upload_bytes, 26_214_400);
        assert_eq!(config.rag.region, "us-east-1");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/config.toml").unwrap();
        assert_eq!(config.pipeline.data_dir, "./data");
    }

    #[test]
    fn test_resolve_api_key_prefers_config_value() {
        let config = TranscribeConfig {
            api_key: Some("sk-from-config".to_string()),
            ..TranscribeConfig::default()
        };
        assert_eq!(config.resolve_api_key().unwrap(), "sk-from-config");
    }

    #[test]
    fn test_resolve_llm_key_from_env() {
        let config = LlmConfig {
            api_key_env: "CALL_AUDIT_TEST_LLM_KEY".to_string(),
            ..LlmConfig::default()
        };
        env::set_var("CALL_AUDIT_TEST_LLM_KEY", "sk-from-env");
        assert_eq!(config.resolve_api_key().unwrap(), "sk-from-env");
        env::remove_var("CALL_AUDIT_TEST_LLM_KEY");
    }

    #[test]
    fn test_provider_defaults() {
        assert_eq!(AsrProvider::Groq.api_key_env(), "GROQ_API_KEY");
        assert_eq!(
            AsrProvider::Groq.base_url(),
            "https://api.groq.com/openai/v1"
        );
        assert_eq!(AsrProvider::Openai.api_key_env(), "OPENAI_API_KEY");
        assert_eq!(AsrProvider::Openai.base_url(), "https://api.openai.com/v1");
    }
}
