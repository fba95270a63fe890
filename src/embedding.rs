use crate::config::{EmbeddingBackendType, RagConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// テキスト埋め込みの共通トレイト
#[async_trait]
pub trait Embedder: Send + Sync {
    /// テキストを固定次元のベクトルに変換する
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 出力ベクトルの次元数
    fn dimension(&self) -> usize;
}

/// APIキー不要の決定的ハッシュ埋め込み
///
/// 文字のコードポイントからベクトルを作る。意味的な類似度は
/// 粗いが、同じ入力からは常に同じベクトルになるため、オフライン
/// での動作確認やテストに使える。次元を超える文字は無視し、
/// 足りない分は0.0で埋める。
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector: Vec<f32> = text
            .chars()
            .take(self.dimension)
            .map(|c| (c as u32 % 256) as f32 / 256.0)
            .collect();
        vector.resize(self.dimension, 0.0);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// OpenAI embeddings APIレスポンス
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI embeddings APIバックエンド
pub struct OpenAiEmbedder {
    api_key: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    /// バックエンドを生成
    ///
    /// # Errors
    ///
    /// HTTPクライアントの構築に失敗した場合にエラーを返す。
    pub fn new(
        api_key: String,
        model: String,
        dimension: usize,
        timeout_seconds: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("埋め込みHTTPクライアント作成失敗")?;

        Ok(Self {
            api_key,
            model,
            dimension,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimension,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("埋め込みAPIリクエスト失敗")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("埋め込みAPIエラー: {} - {}", status, error_text);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("埋め込みAPIレスポンスのパース失敗")?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("埋め込みAPIの応答にdataがありません"))?;

        if embedding.len() != self.dimension {
            anyhow::bail!(
                "埋め込み次元が設定と一致しません: 期待 {} 実際 {}",
                self.dimension,
                embedding.len()
            );
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// 設定に応じた埋め込みバックエンドを生成する
///
/// # Errors
///
/// OpenAIバックエンドでAPIキーが解決できない場合、または
/// HTTPクライアントの構築に失敗した場合にエラーを返す。
pub fn embedder_from_config(cfg: &RagConfig) -> Result<Box<dyn Embedder>> {
    match cfg.embedding {
        EmbeddingBackendType::Hash => Ok(Box::new(HashEmbedder::new(cfg.dimension))),
        EmbeddingBackendType::Openai => {
            let api_key = cfg.resolve_embedding_api_key()?;
            let embedder = OpenAiEmbedder::new(
                api_key,
                cfg.embedding_model.clone(),
                cfg.dimension,
                cfg.timeout_seconds,
            )?;
            Ok(Box::new(embedder))
        }
    }
}
