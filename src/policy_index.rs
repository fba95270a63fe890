use crate::config::RagConfig;
use crate::embedding::Embedder;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

/// コントロールプレーンのベースURL
const CONTROL_PLANE: &str = "https://api.pinecone.io";
/// APIバージョンヘッダの値
const PINECONE_API_VERSION: &str = "2025-01";
/// 1回のupsertで送るベクトル数の上限
const UPSERT_BATCH_SIZE: usize = 100;
/// インデックス準備完了を待つ最大ポーリング回数（1秒間隔）
const READY_POLL_ATTEMPTS: u32 = 60;

/// インデックス情報（describeレスポンス）
#[derive(Debug, Deserialize)]
struct IndexDescription {
    host: String,
    #[serde(default)]
    status: IndexStatus,
}

#[derive(Debug, Default, Deserialize)]
struct IndexStatus {
    #[serde(default)]
    ready: bool,
}

/// ルール1件のメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleMetadata {
    text: String,
}

#[derive(Debug, Serialize)]
struct UpsertRequest {
    vectors: Vec<VectorRecord>,
}

#[derive(Debug, Clone, Serialize)]
struct VectorRecord {
    id: String,
    values: Vec<f32>,
    metadata: RuleMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    vector: Vec<f32>,
    top_k: usize,
    include_metadata: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    #[serde(default)]
    metadata: Option<RuleMetadata>,
}

/// コンプライアンスルールを保持するPineconeインデックスへの
/// 薄いRESTクライアント
///
/// コントロールプレーン（インデックスの作成・参照）とデータ
/// プレーン（upsert / query）の両方を扱う。データプレーンの
/// ホスト名は初回解決後にキャッシュする。
pub struct PolicyIndex {
    config: RagConfig,
    api_key: String,
    client: reqwest::Client,
    host: Mutex<Option<String>>,
}

impl PolicyIndex {
    /// クライアントを生成
    ///
    /// # Errors
    ///
    /// APIキーが解決できない場合、またはHTTPクライアントの構築に
    /// 失敗した場合にエラーを返す。
    pub fn new(config: RagConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Pinecone HTTPクライアント作成失敗")?;

        Ok(Self {
            config,
            api_key,
            client,
            host: Mutex::new(None),
        })
    }

    /// インデックス名
    pub fn index_name(&self) -> &str {
        &self.config.index_name
    }

    /// インデックスが存在し準備完了であることを保証する
    ///
    /// 存在しなければサーバーレスインデックスを作成し、準備完了に
    /// なるまで1秒間隔でポーリングする。
    ///
    /// # Errors
    ///
    /// API呼び出しに失敗した場合、またはポーリング上限までに
    /// 準備完了にならなかった場合にエラーを返す。
    pub async fn ensure_index(&self) -> Result<()> {
        match self.describe_index().await? {
            Some(description) if description.status.ready => {
                log::debug!("インデックスは作成済み: {}", self.config.index_name);
                return Ok(());
            }
            Some(_) => {}
            None => self.create_index().await?,
        }

        for _ in 0..READY_POLL_ATTEMPTS {
            if let Some(description) = self.describe_index().await? {
                if description.status.ready {
                    log::info!("インデックス準備完了: {}", self.config.index_name);
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        anyhow::bail!(
            "インデックスが時間内に準備完了になりませんでした: {}",
            self.config.index_name
        )
    }

    /// ルールを埋め込んでインデックスに登録する
    ///
    /// ベクトルIDは `rule-0`, `rule-1`, ... の連番。同じIDへの
    /// 再登録は上書きになるため、何度実行しても安全。
    ///
    /// # Returns
    /// 登録したルール数
    ///
    /// # Errors
    ///
    /// 埋め込みまたはupsert APIの呼び出しに失敗した場合に
    /// エラーを返す。
    pub async fn upsert_rules(&self, rules: &[String], embedder: &dyn Embedder) -> Result<usize> {
        let host = self.resolve_host().await?;
        let url = format!("https://{}/vectors/upsert", host);

        let mut vectors = Vec::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            let values = embedder
                .embed(rule)
                .await
                .with_context(|| format!("ルール {} の埋め込みに失敗", i + 1))?;
            vectors.push(VectorRecord {
                id: format!("rule-{}", i),
                values,
                metadata: RuleMetadata { text: rule.clone() },
            });
        }

        for batch in vectors.chunks(UPSERT_BATCH_SIZE) {
            let body = UpsertRequest {
                vectors: batch.to_vec(),
            };
            let response = self
                .client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
                .json(&body)
                .send()
                .await
                .context("Pinecone upsert リクエスト失敗")?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response.text().await.unwrap_or_default();
                anyhow::bail!("Pinecone upsert エラー: {} - {}", status, error_text);
            }
        }

        log::info!(
            "{} 件のルールをインデックスに登録しました: {}",
            vectors.len(),
            self.config.index_name
        );
        Ok(vectors.len())
    }

    /// クエリベクトルに近いルールのテキストを返す
    ///
    /// # Arguments
    ///
    /// * `vector` - クエリ埋め込み
    /// * `top_k` - 取得する件数
    ///
    /// # Errors
    ///
    /// query APIの呼び出しに失敗した場合にエラーを返す。
    pub async fn query_rules(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<String>> {
        let host = self.resolve_host().await?;
        let url = format!("https://{}/query", host);
        let body = QueryRequest {
            vector,
            top_k,
            include_metadata: true,
        };

        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
            .json(&body)
            .send()
            .await
            .context("Pinecone query リクエスト失敗")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Pinecone query エラー: {} - {}", status, error_text);
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .context("Pinecone query レスポンスのパース失敗")?;

        Ok(parsed
            .matches
            .into_iter()
            .filter_map(|m| m.metadata.map(|md| md.text))
            .collect())
    }

    async fn describe_index(&self) -> Result<Option<IndexDescription>> {
        let url = format!("{}/indexes/{}", CONTROL_PLANE, self.config.index_name);
        let response = self
            .client
            .get(&url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
            .send()
            .await
            .context("Pinecone describe リクエスト失敗")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Pinecone describe エラー: {} - {}", status, error_text);
        }

        let description: IndexDescription = response
            .json()
            .await
            .context("Pinecone describe レスポンスのパース失敗")?;
        Ok(Some(description))
    }

    async fn create_index(&self) -> Result<()> {
        log::info!(
            "インデックスを作成中: {} (dimension={}, metric={})",
            self.config.index_name,
            self.config.dimension,
            self.config.metric
        );
        let url = format!("{}/indexes", CONTROL_PLANE);
        let body = serde_json::json!({
            "name": self.config.index_name,
            "dimension": self.config.dimension,
            "metric": self.config.metric,
            "spec": {
                "serverless": {
                    "cloud": self.config.cloud,
                    "region": self.config.region,
                }
            }
        });

        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
            .json(&body)
            .send()
            .await
            .context("Pinecone create リクエスト失敗")?;

        let status = response.status();
        // 並行作成などによる409は作成済みとして扱う
        if status == reqwest::StatusCode::CONFLICT {
            log::debug!("インデックスは既に存在: {}", self.config.index_name);
            return Ok(());
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Pinecone create エラー: {} - {}", status, error_text);
        }
        Ok(())
    }

    async fn resolve_host(&self) -> Result<String> {
        let mut cached = self.host.lock().await;
        if let Some(host) = cached.as_ref() {
            return Ok(host.clone());
        }

        let description = self.describe_index().await?.ok_or_else(|| {
            anyhow::anyhow!("インデックスが存在しません: {}", self.config.index_name)
        })?;
        *cached = Some(description.host.clone());
        Ok(description.host)
    }
}

/// ポリシーファイルからルールを読み込む
///
/// 1行1ルール。前後の空白は取り除き、空行は無視する。
///
/// # Errors
///
/// ファイルの読み込みに失敗した場合にエラーを返す。
pub fn load_rules<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("ポリシーファイルの読み込みに失敗: {:?}", path.as_ref()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_rules() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "Never share customer account numbers aloud.").unwrap();
        writeln!(temp_file).unwrap();
        writeln!(temp_file, "  Always verify identity before account changes.  ").unwrap();
        writeln!(temp_file, "Do not promise refunds without approval.").unwrap();
        temp_file.flush().unwrap();

        let rules = load_rules(temp_file.path()).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0], "Never share customer account numbers aloud.");
        assert_eq!(rules[1], "Always verify identity before account changes.");
    }

    #[test]
    fn test_load_rules_missing_file() {
        assert!(load_rules("/nonexistent/policy.txt").is_err());
    }

    #[test]
    fn test_new_with_config_key() {
        let config = RagConfig {
            api_key: Some("test-key".to_string()),
            ..RagConfig::default()
        };
        let index = PolicyIndex::new(config).unwrap();
        assert_eq!(index.index_name(), "compliance-rules");
    }

    #[test]
    fn test_query_request_serialization() {
        let request = QueryRequest {
            vector: vec![0.1, 0.2],
            top_k: 2,
            include_metadata: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["topK"], 2);
        assert_eq!(json["includeMetadata"], true);
        assert!(json["vector"].is_array());
    }

    #[test]
    fn test_upsert_request_serialization() {
        let request = UpsertRequest {
            vectors: vec![VectorRecord {
                id: "rule-0".to_string(),
                values: vec![0.5],
                metadata: RuleMetadata {
                    text: "No refunds after 30 days.".to_string(),
                },
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["vectors"][0]["id"], "rule-0");
        assert_eq!(json["vectors"][0]["metadata"]["text"], "No refunds after 30 days.");
    }

    #[test]
    fn test_query_response_parse() {
        let json = r#"{
            "matches": [
                {"id": "rule-0", "score": 0.92, "metadata": {"text": "Rule A"}},
                {"id": "rule-1", "score": 0.81}
            ]
        }"#;
        let parsed: QueryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.matches.len(), 2);
        assert_eq!(parsed.matches[0].metadata.as_ref().unwrap().text, "Rule A");
        assert!(parsed.matches[1].metadata.is_none());
    }

    #[test]
    fn test_index_description_parse() {
        let json = r#"{"name": "compliance-rules", "host": "idx.svc.pinecone.io", "status": {"ready": true, "state": "Ready"}}"#;
        let description: IndexDescription = serde_json::from_str(json).unwrap();
        assert_eq!(description.host, "idx.svc.pinecone.io");
        assert!(description.status.ready);

        // statusが無くてもパースできる（ready = false扱い）
        let json = r#"{"name": "compliance-rules", "host": "idx.svc.pinecone.io"}"#;
        let description: IndexDescription = serde_json::from_str(json).unwrap();
        assert!(!description.status.ready);
    }
}
