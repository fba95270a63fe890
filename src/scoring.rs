use crate::chat::{extract_json_object, ChatClient, ChatMessage};
use crate::embedding::Embedder;
use crate::policy_index::PolicyIndex;
use crate::types::{AuditSummary, ChunkScore, DialogueChunk, ScoredChunk, Verdict};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// ルールが取得できなかったときにプロンプトへ入れる代替テキスト
const NO_RULES_PLACEHOLDER: &str = "No rules available";

/// チャンク単位のルール検索
///
/// チャンク本文を埋め込み、インデックスから近いルールを取得する。
/// 検索に失敗しても監査自体は止めず、ルールなしとして続行する。
pub struct RuleRetrieval {
    index: PolicyIndex,
    embedder: Box<dyn Embedder>,
    top_k: usize,
}

impl RuleRetrieval {
    pub fn new(index: PolicyIndex, embedder: Box<dyn Embedder>, top_k: usize) -> Self {
        Self {
            index,
            embedder,
            top_k,
        }
    }

    /// チャンク本文に関連するルールを取得する
    ///
    /// 埋め込みまたは検索に失敗した場合は警告を出して空リストを
    /// 返す。
    pub async fn rules_for(&self, chunk_text: &str) -> Vec<String> {
        let vector = match self.embedder.embed(chunk_text).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("クエリ埋め込みに失敗。ルールなしで採点します: {}", e);
                return Vec::new();
            }
        };

        match self.index.query_rules(vector, self.top_k).await {
            Ok(rules) => rules,
            Err(e) => {
                log::warn!("ルール検索に失敗。ルールなしで採点します: {}", e);
                Vec::new()
            }
        }
    }
}

/// 監査の実行結果
pub struct AuditOutcome {
    /// チャンクごとの採点結果
    pub chunks: Vec<ScoredChunk>,
    /// 集計結果
    pub summary: AuditSummary,
    /// 中断要求により途中で打ち切られたか
    pub interrupted: bool,
}

/// チャンク採点エンジン
///
/// チャンクごとに関連ルールを検索し、採点LLMにJSONで評価させる。
pub struct ChunkScorer {
    chat: ChatClient,
    model: String,
    retrieval: Option<RuleRetrieval>,
}

impl ChunkScorer {
    pub fn new(chat: ChatClient, model: impl Into<String>, retrieval: Option<RuleRetrieval>) -> Self {
        Self {
            chat,
            model: model.into(),
            retrieval,
        }
    }

    /// 1チャンクを採点する
    ///
    /// # Errors
    ///
    /// LLM呼び出しまたは採点JSONのパースに失敗した場合にエラーを
    /// 返す。ルール検索の失敗はエラーにならない。
    pub async fn score_chunk(&self, chunk: &DialogueChunk) -> Result<ChunkScore> {
        if chunk.is_empty() {
            anyhow::bail!("チャンク {} にターンがありません", chunk.index);
        }
        let chunk_text = chunk.prompt_text();

        let rules = match &self.retrieval {
            Some(retrieval) => retrieval.rules_for(&chunk_text).await,
            None => Vec::new(),
        };
        let rules_text = if rules.is_empty() {
            NO_RULES_PLACEHOLDER.to_string()
        } else {
            rules.join("\n")
        };

        let prompt = build_score_prompt(&chunk_text, &rules_text);
        let raw = self
            .chat
            .complete_json(&self.model, &[ChatMessage::user(prompt)])
            .await
            .with_context(|| format!("チャンク {} の採点LLM呼び出しに失敗", chunk.index))?;

        parse_score(&raw).with_context(|| format!("チャンク {} の採点結果のパースに失敗", chunk.index))
    }

    /// 全チャンクを順に採点して集計する
    ///
    /// `shutdown` フラグが立ったら残りのチャンクを打ち切り、
    /// それまでの採点結果だけで集計する。
    ///
    /// # Errors
    ///
    /// チャンクが空の場合、1チャンクも採点できずに中断された場合、
    /// または採点呼び出しに失敗した場合にエラーを返す。
    pub async fn run_audit(
        &self,
        chunks: &[DialogueChunk],
        shutdown: &AtomicBool,
    ) -> Result<AuditOutcome> {
        if chunks.is_empty() {
            anyhow::bail!("採点対象のチャンクがありません");
        }

        let mut scored = Vec::with_capacity(chunks.len());
        let mut interrupted = false;
        for chunk in chunks {
            if shutdown.load(Ordering::SeqCst) {
                log::warn!(
                    "中断要求を受け付けました。チャンク {}/{} まで採点済み",
                    scored.len(),
                    chunks.len()
                );
                interrupted = true;
                break;
            }

            log::info!(
                "チャンク {}/{} を採点中 ({} ターン)",
                chunk.index,
                chunks.len(),
                chunk.len()
            );
            let score = self.score_chunk(chunk).await?;
            log::debug!(
                "チャンク {}: empathy={} professionalism={} compliance={}",
                chunk.index,
                score.empathy,
                score.professionalism,
                score.compliance.chunk_label()
            );
            scored.push(ScoredChunk {
                index: chunk.index,
                score,
            });
        }

        if scored.is_empty() {
            anyhow::bail!("1チャンクも採点される前に中断されました");
        }

        let summary = aggregate(&scored);
        Ok(AuditOutcome {
            chunks: scored,
            summary,
            interrupted,
        })
    }
}

/// 採点プロンプトを組み立てる
pub fn build_score_prompt(chunk_text: &str, rules_text: &str) -> String {
    format!(
        "Evaluate this chunk based on these specific rules:\n{rules}\n\n\
         Conversation:\n{chunk}\n\n\
         Return JSON ONLY:\n\
         {{\n\
         \x20 \"empathy\": 1-100,\n\
         \x20 \"professionalism\": 1-100,\n\
         \x20 \"compliance\": \"Pass/Fail/Warn\",\n\
         \x20 \"reason\": \"Explain violation if any\",\n\
         \x20 \"violations\": [\"List specific policy violations\"],\n\
         \x20 \"suggestions\": [\"List specific improvement suggestions\"]\n\
         }}",
        rules = rules_text,
        chunk = chunk_text
    )
}

/// LLM応答から採点JSONを取り出してパースする
///
/// JSONの前後に説明文が付いていても読み取れる。0〜100を外れた
/// スコアは警告を出して範囲内に丸める。
///
/// # Errors
///
/// JSONオブジェクトが見つからない、または必須フィールドが欠けて
/// いる場合にエラーを返す。
pub fn parse_score(raw: &str) -> Result<ChunkScore> {
    let json_text = extract_json_object(raw)
        .ok_or_else(|| anyhow::anyhow!("応答にJSONオブジェクトが見つかりません: {}", raw))?;
    let mut score: ChunkScore = serde_json::from_str(json_text)
        .with_context(|| format!("採点JSONのパースに失敗: {}", json_text))?;
    score.empathy = clamp_score(score.empathy, "empathy");
    score.professionalism = clamp_score(score.professionalism, "professionalism");
    Ok(score)
}

fn clamp_score(value: f64, field: &str) -> f64 {
    if (0.0..=100.0).contains(&value) {
        return value;
    }
    let clamped = value.clamp(0.0, 100.0);
    log::warn!("{} が範囲外のため丸めました: {} -> {}", field, value, clamped);
    clamped
}

/// チャンク採点結果を監査全体の集計に畳み込む
///
/// スコアは算術平均。判定はFailが1つでもあればFAIL、無ければ
/// Warnの有無でWARN/PASSになる。違反と改善提案は全チャンクから
/// 集め、空白を整えたうえで初出順に重複を除く。
pub fn aggregate(scored: &[ScoredChunk]) -> AuditSummary {
    let n = scored.len().max(1) as f64;
    let mean_empathy = scored.iter().map(|s| s.score.empathy).sum::<f64>() / n;
    let mean_professionalism = scored.iter().map(|s| s.score.professionalism).sum::<f64>() / n;

    let overall = if scored.iter().any(|s| s.score.compliance == Verdict::Fail) {
        Verdict::Fail
    } else if scored.iter().any(|s| s.score.compliance == Verdict::Warn) {
        Verdict::Warn
    } else {
        Verdict::Pass
    };

    let violations = dedup_trimmed(scored.iter().flat_map(|s| s.score.violations.iter()));
    let suggestions = dedup_trimmed(scored.iter().flat_map(|s| s.score.suggestions.iter()));

    AuditSummary {
        mean_empathy,
        mean_professionalism,
        overall,
        violations,
        suggestions,
        chunks_scored: scored.len(),
    }
}

/// 前後の空白を落とし、空要素と重複を除いて初出順に集める
fn dedup_trimmed<'a, I>(items: I) -> Vec<String>
where
    I: Iterator<Item = &'a String>,
{
    let mut seen: Vec<String> = Vec::new();
    for item in items {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !seen.iter().any(|s| s == trimmed) {
            seen.push(trimmed.to_string());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_scored(
        index: usize,
        empathy: f64,
        professionalism: f64,
        compliance: Verdict,
        violations: Vec<&str>,
        suggestions: Vec<&str>,
    ) -> ScoredChunk {
        ScoredChunk {
            index,
            score: ChunkScore {
                empathy,
                professionalism,
                compliance,
                reason: String::new(),
                violations: violations.into_iter().map(String::from).collect(),
                suggestions: suggestions.into_iter().map(String::from).collect(),
            },
        }
    }

    #[test]
    fn test_build_score_prompt() {
        let prompt = build_score_prompt("Agent: Hello", "Rule A\nRule B");
        assert!(prompt.starts_with("Evaluate this chunk based on these specific rules:\nRule A\nRule B"));
        assert!(prompt.contains("Conversation:\nAgent: Hello"));
        assert!(prompt.contains("Return JSON ONLY:"));
        assert!(prompt.contains("\"compliance\": \"Pass/Fail/Warn\""));
    }

    #[test]
    fn test_parse_score_plain_json() {
        let raw = r#"{"empathy": 85, "professionalism": 90, "compliance": "Pass", "reason": "ok", "violations": [], "suggestions": []}"#;
        let score = parse_score(raw).unwrap();
        assert_eq!(score.empathy, 85.0);
        assert_eq!(score.compliance, Verdict::Pass);
    }

    #[test]
    fn test_parse_score_with_surrounding_prose() {
        let raw = "Here is my evaluation:\n{\"empathy\": 40, \"professionalism\": 55, \"compliance\": \"Fail\", \"reason\": \"Shared account details\"}\nThanks!";
        let score = parse_score(raw).unwrap();
        assert_eq!(score.compliance, Verdict::Fail);
        assert_eq!(score.reason, "Shared account details");
        assert!(score.violations.is_empty());
    }

    #[test]
    fn test_parse_score_rejects_non_json() {
        assert!(parse_score("I cannot score this.").is_err());
        assert!(parse_score(r#"{"empathy": "high"}"#).is_err());
    }

    #[test]
    fn test_parse_score_clamps_out_of_range() {
        let raw = r#"{"empathy": 150, "professionalism": -5, "compliance": "Warn"}"#;
        let score = parse_score(raw).unwrap();
        assert_eq!(score.empathy, 100.0);
        assert_eq!(score.professionalism, 0.0);
    }

    #[test]
    fn test_aggregate_means() {
        let scored = vec![
            make_scored(1, 80.0, 70.0, Verdict::Pass, vec![], vec![]),
            make_scored(2, 90.0, 80.0, Verdict::Pass, vec![], vec![]),
        ];
        let summary = aggregate(&scored);
        assert_eq!(summary.mean_empathy, 85.0);
        assert_eq!(summary.mean_professionalism, 75.0);
        assert_eq!(summary.chunks_scored, 2);
    }

    #[test]
    fn test_aggregate_fail_dominates() {
        let scored = vec![
            make_scored(1, 80.0, 80.0, Verdict::Pass, vec![], vec![]),
            make_scored(2, 80.0, 80.0, Verdict::Warn, vec![], vec![]),
            make_scored(3, 80.0, 80.0, Verdict::Fail, vec![], vec![]),
        ];
        assert_eq!(aggregate(&scored).overall, Verdict::Fail);
    }

    #[test]
    fn test_aggregate_warn_without_fail() {
        let scored = vec![
            make_scored(1, 80.0, 80.0, Verdict::Pass, vec![], vec![]),
            make_scored(2, 80.0, 80.0, Verdict::Warn, vec![], vec![]),
        ];
        assert_eq!(aggregate(&scored).overall, Verdict::Warn);
    }

    #[test]
    fn test_aggregate_all_pass() {
        let scored = vec![make_scored(1, 80.0, 80.0, Verdict::Pass, vec![], vec![])];
        assert_eq!(aggregate(&scored).overall, Verdict::Pass);
    }

    #[test]
    fn test_aggregate_dedups_in_first_seen_order() {
        let scored = vec![
            make_scored(
                1,
                80.0,
                80.0,
                Verdict::Warn,
                vec!["Shared account number", "Interrupted customer"],
                vec!["Use the customer's name"],
            ),
            make_scored(
                2,
                80.0,
                80.0,
                Verdict::Warn,
                vec!["  Shared account number  ", "No closing statement"],
                vec!["Use the customer's name", ""],
            ),
        ];
        let summary = aggregate(&scored);
        assert_eq!(
            summary.violations,
            vec![
                "Shared account number",
                "Interrupted customer",
                "No closing statement"
            ]
        );
        assert_eq!(summary.suggestions, vec!["Use the customer's name"]);
    }

    #[test]
    fn test_aggregate_empty_slice() {
        let summary = aggregate(&[]);
        assert_eq!(summary.mean_empathy, 0.0);
        assert_eq!(summary.chunks_scored, 0);
        assert_eq!(summary.overall, Verdict::Pass);
    }
}
