use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// 文字起こしバックエンドの共通トレイト
#[async_trait]
pub trait TranscribeBackend: Send + Sync {
    /// 音声ファイル全体を文字起こしする
    ///
    /// # Arguments
    ///
    /// * `path` - 入力音声ファイル（WAV / MP3 / FLAC など）
    ///
    /// # Returns
    /// 文字起こしされた生テキスト
    async fn transcribe_file(&self, path: &Path) -> Result<String>;

    /// バックエンド名（ログ表示用）
    fn name(&self) -> &str;
}
