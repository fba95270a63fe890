use crate::config::LlmConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// チャット補完クライアント設定
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: String,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub timeout_seconds: u64,
}

impl ChatConfig {
    /// 設定ファイルのLLMセクションからクライアント設定を組み立てる
    ///
    /// # Errors
    ///
    /// APIキーが解決できない場合にエラーを返す。
    pub fn from_llm(llm: &LlmConfig) -> Result<Self> {
        Ok(Self {
            base_url: llm.base_url.clone(),
            api_key: llm.resolve_api_key()?,
            max_retries: llm.max_retries,
            retry_backoff_ms: llm.retry_backoff_ms,
            timeout_seconds: llm.timeout_seconds,
        })
    }
}

/// チャット補完APIのメッセージ
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// チャット補完APIレスポンス
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// 1回分の送信エラー。リトライ可否を持ち回る
struct SendError {
    error: anyhow::Error,
    retryable: bool,
}

/// OpenAI互換チャット補完APIクライアント
///
/// Groq / OpenAI のどちらでも同じリクエスト形式で使える。
/// 一時的な失敗（接続エラー、429、5xx）は設定された回数まで
/// 線形バックオフでリトライする。
pub struct ChatClient {
    config: ChatConfig,
    client: reqwest::Client,
}

impl ChatClient {
    /// クライアントを生成
    ///
    /// # Errors
    ///
    /// HTTPクライアントの構築に失敗した場合にエラーを返す。
    pub fn new(config: ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("チャット補完HTTPクライアント作成失敗")?;

        Ok(Self { config, client })
    }

    /// チャット補完を呼び出して応答テキストを返す
    ///
    /// # Arguments
    ///
    /// * `model` - モデル名（"llama-3.3-70b-versatile" など）
    /// * `messages` - 送信するメッセージ列
    ///
    /// # Errors
    ///
    /// リトライ上限まで失敗した場合、またはリトライ不能なエラー
    /// （認証エラーなど）の場合にエラーを返す。
    pub async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        self.request(model, messages, false).await
    }

    /// JSONオブジェクト応答を要求してチャット補完を呼び出す
    ///
    /// `response_format: {"type": "json_object"}` を付けて送信する。
    /// 応答テキストがJSONとしてパース可能であることまでは保証しない。
    ///
    /// # Errors
    ///
    /// [`ChatClient::complete`] と同じ条件でエラーを返す。
    pub async fn complete_json(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        self.request(model, messages, true).await
    }

    async fn request(&self, model: &str, messages: &[ChatMessage], json_mode: bool) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        if json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let mut attempt: u32 = 0;
        loop {
            match self.send_once(&url, &body).await {
                Ok(content) => return Ok(content),
                Err(send_error) => {
                    if !send_error.retryable || attempt >= self.config.max_retries {
                        return Err(send_error.error);
                    }
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(self.config.retry_backoff_ms * u64::from(attempt));
                    log::warn!(
                        "チャット補完API呼び出しに失敗。{}ms後にリトライ ({}/{}): {}",
                        backoff.as_millis(),
                        attempt,
                        self.config.max_retries,
                        send_error.error
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn send_once(&self, url: &str, body: &Value) -> std::result::Result<String, SendError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| SendError {
                error: anyhow::Error::new(e).context("チャット補完APIリクエスト失敗"),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            // 429と5xxは一時的な失敗として扱う
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err(SendError {
                error: anyhow::anyhow!("チャット補完APIエラー: {} - {}", status, error_text),
                retryable,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| SendError {
            error: anyhow::Error::new(e).context("チャット補完APIレスポンスのパース失敗"),
            retryable: false,
        })?;

        match parsed.choices.into_iter().next() {
            Some(choice) => Ok(choice.message.content),
            None => Err(SendError {
                error: anyhow::anyhow!("チャット補完APIの応答にchoicesがありません"),
                retryable: false,
            }),
        }
    }
}

/// LLM応答からJSONオブジェクト部分を切り出す
///
/// モデルがJSONの前後に説明文を付けてくることがあるため、
/// 最初の `{` から最後の `}` までを取り出す。
///
/// # Examples
///
/// ```
/// # use call_audit::chat::extract_json_object;
/// let raw = "Here is the result:\n{\"empathy\": 80}\nLet me know!";
/// assert_eq!(extract_json_object(raw), Some("{\"empathy\": 80}"));
/// assert_eq!(extract_json_object("no json here"), None);
/// ```
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start < end {
        Some(&text[start..=end])
    } else {
        None
    }
}
