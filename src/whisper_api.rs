use crate::config::{AsrProvider, TranscribeConfig};
use crate::transcribe_backend::TranscribeBackend;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

/// 16bit PCM WAVのヘッダサイズ（RIFF + fmt + dataチャンクヘッダ）
const WAV_HEADER_BYTES: u64 = 44;

/// Whisper系文字起こしAPI設定
#[derive(Debug, Clone)]
pub struct WhisperApiConfig {
    pub provider: AsrProvider,
    pub api_key: String,
    pub model: String,
    pub language: Option<String>,
    /// アップロード上限を超えるWAVの分割単位（秒）
    pub segment_seconds: u64,
    /// 1リクエストで送れる最大バイト数
    pub max_upload_bytes: u64,
    pub timeout_seconds: u64,
}

impl WhisperApiConfig {
    /// 設定ファイルの文字起こしセクションからAPI設定を組み立てる
    ///
    /// # Errors
    ///
    /// APIキーが解決できない場合にエラーを返す。
    pub fn from_transcribe(cfg: &TranscribeConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.provider,
            api_key: cfg.resolve_api_key()?,
            model: cfg.model.clone(),
            language: cfg.language.clone(),
            segment_seconds: cfg.segment_seconds,
            max_upload_bytes: cfg.max_upload_bytes,
            timeout_seconds: cfg.timeout_seconds,
        })
    }
}

/// 文字起こしAPIレスポンス
#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Whisper系文字起こしAPIバックエンド
///
/// Groq / OpenAI の `/audio/transcriptions` エンドポイントに
/// 音声ファイルをmultipartで送信する。アップロード上限を超える
/// 16bit PCM WAVは、秒数と上限バイト数の両方に収まるセグメントに
/// 分割して順に送信し、結果を連結する。
pub struct WhisperApiBackend {
    config: WhisperApiConfig,
    client: reqwest::Client,
}

impl WhisperApiBackend {
    /// バックエンドを生成
    ///
    /// # Errors
    ///
    /// HTTPクライアントの構築に失敗した場合にエラーを返す。
    pub fn new(config: WhisperApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("文字起こしHTTPクライアント作成失敗")?;

        Ok(Self { config, client })
    }

    /// 設定ファイルのセクションから直接生成
    ///
    /// # Errors
    ///
    /// APIキーの解決またはHTTPクライアントの構築に失敗した場合に
    /// エラーを返す。
    pub fn from_config(cfg: &TranscribeConfig) -> Result<Self> {
        Self::new(WhisperApiConfig::from_transcribe(cfg)?)
    }

    /// 音声バイト列を1リクエストで文字起こし
    async fn transcribe_bytes(&self, data: Vec<u8>, file_name: &str, mime: &str) -> Result<String> {
        let part = multipart::Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(mime)?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());

        if let Some(ref language) = self.config.language {
            form = form.text("language", language.clone());
        }

        let url = format!("{}/audio/transcriptions", self.config.provider.base_url());
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .multipart(form)
            .send()
            .await
            .context("文字起こしAPIリクエスト失敗")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("文字起こしAPIエラー: {} - {}", status, error_text);
        }

        let whisper_response: WhisperResponse = response
            .json::<WhisperResponse>()
            .await
            .context("文字起こしAPIレスポンスのパース失敗")?;

        Ok(whisper_response.text)
    }

    /// 上限超過WAVをセグメント（WAVバイト列）に分割
    ///
    /// セグメント長は `segment_seconds` と、セグメント自体が
    /// `max_upload_bytes` に収まるバイト数の短い方で決める。
    fn segment_wav(&self, path: &Path) -> Result<Vec<Vec<u8>>> {
        let mut reader = hound::WavReader::open(path)
            .with_context(|| format!("WAVファイルのオープンに失敗: {:?}", path))?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            anyhow::bail!("分割に対応していないWAV形式です（16bit PCMのみ）: {:?}", path);
        }

        let channels = u64::from(spec.channels).max(1);
        let by_duration = u64::from(spec.sample_rate) * self.config.segment_seconds * channels;
        // 16bitサンプルは2バイト。フレーム境界で割り切れる数に丸める
        let cap_samples = self.config.max_upload_bytes.saturating_sub(WAV_HEADER_BYTES) / 2;
        let by_size = cap_samples - cap_samples % channels;
        let samples_per_segment = by_duration.min(by_size) as usize;
        if samples_per_segment == 0 {
            anyhow::bail!(
                "segment_seconds={} / max_upload_bytes={} では分割できません",
                self.config.segment_seconds,
                self.config.max_upload_bytes
            );
        }

        let mut segments = Vec::new();
        let mut buffer: Vec<i16> = Vec::with_capacity(samples_per_segment);
        for sample in reader.samples::<i16>() {
            buffer.push(sample.context("WAVサンプルの読み取りに失敗")?);
            if buffer.len() >= samples_per_segment {
                segments.push(pcm_to_wav(&buffer, spec.sample_rate, spec.channels)?);
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            segments.push(pcm_to_wav(&buffer, spec.sample_rate, spec.channels)?);
        }

        Ok(segments)
    }
}

#[async_trait]
impl TranscribeBackend for WhisperApiBackend {
    async fn transcribe_file(&self, path: &Path) -> Result<String> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("音声ファイルが見つかりません: {:?}", path))?;
        let size = metadata.len();
        log::info!("文字起こし開始: {:?} ({} バイト)", path, size);
        log_wav_info(path);

        if size <= self.config.max_upload_bytes {
            let data =
                fs::read(path).with_context(|| format!("音声ファイルの読み込みに失敗: {:?}", path))?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("audio.wav")
                .to_string();
            return self.transcribe_bytes(data, &file_name, mime_for_path(path)).await;
        }

        // 上限超過。16bit PCM WAVなら分割して順に送る
        let is_wav = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if !is_wav {
            anyhow::bail!(
                "ファイルサイズ {} バイトが上限 {} バイトを超えています（自動分割はWAVのみ対応）: {:?}",
                size,
                self.config.max_upload_bytes,
                path
            );
        }

        let segments = self.segment_wav(path)?;
        let total = segments.len();
        log::info!(
            "アップロード上限を超えるため {} 個のセグメントに分割して送信します",
            total
        );

        let mut texts = Vec::with_capacity(total);
        for (i, wav_data) in segments.into_iter().enumerate() {
            log::debug!("セグメント {}/{} を送信中 ({} バイト)", i + 1, total, wav_data.len());
            let text = self
                .transcribe_bytes(wav_data, "segment.wav", "audio/wav")
                .await
                .with_context(|| format!("セグメント {}/{} の文字起こしに失敗", i + 1, total))?;
            texts.push(text);
        }

        Ok(texts.join(" "))
    }

    fn name(&self) -> &str {
        match self.config.provider {
            AsrProvider::Groq => "groq-whisper",
            AsrProvider::Openai => "openai-whisper",
        }
    }
}

/// PCMサンプル列をWAVバイト列に変換
pub fn pcm_to_wav(pcm_data: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("WAVライター作成失敗")?;

        for &sample in pcm_data {
            writer.write_sample(sample).context("WAV書き込み失敗")?;
        }

        writer.finalize().context("WAV finalize失敗")?;
    }

    Ok(cursor.into_inner())
}

/// WAVファイルのフォーマット情報をログに出す。WAV以外や読めないファイルは黙って無視する
fn log_wav_info(path: &Path) {
    if mime_for_path(path) != "audio/wav" {
        return;
    }
    if let Ok(reader) = hound::WavReader::open(path) {
        let spec = reader.spec();
        let seconds = reader.duration() as f64 / spec.sample_rate as f64;
        log::info!(
            "WAV情報: {} Hz / {} ch / {:.1} 秒",
            spec.sample_rate,
            spec.channels,
            seconds
        );
    }
}

/// 拡張子からMIMEタイプを推定
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}
