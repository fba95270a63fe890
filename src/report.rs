use crate::types::{AuditSummary, ScoredChunk, Verdict};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// CSVのヘッダー行
const CSV_HEADERS: [&str; 7] = [
    "Chunk",
    "empathy",
    "professionalism",
    "compliance",
    "reason",
    "violations",
    "suggestions",
];

/// 監査結果をCSVに書き出す
///
/// チャンクごとの行の後に集計の `FINAL` 行を付ける。リスト項目は
/// " | " で連結し、空の場合はチャンク行では空セル、FINAL行では
/// "None" になる。判定はチャンク行が `Pass`/`Warn`/`Fail`、FINAL
/// 行が `PASS`/`WARN`/`FAIL` 表記。FINAL行の平均スコアは整数値で
/// も小数点付きになる。
///
/// # Errors
///
/// ファイルの作成または書き込みに失敗した場合にエラーを返す。
pub fn write_audit_csv<P: AsRef<Path>>(
    path: P,
    chunks: &[ScoredChunk],
    summary: &AuditSummary,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())
        .with_context(|| format!("CSVファイルの作成に失敗: {:?}", path.as_ref()))?;

    writer
        .write_record(CSV_HEADERS)
        .context("CSVヘッダーの書き込みに失敗")?;

    for chunk in chunks {
        writer
            .write_record([
                chunk.index.to_string(),
                format_score(chunk.score.empathy),
                format_score(chunk.score.professionalism),
                chunk.score.compliance.chunk_label().to_string(),
                chunk.score.reason.clone(),
                join_list(&chunk.score.violations, ""),
                join_list(&chunk.score.suggestions, ""),
            ])
            .with_context(|| format!("チャンク {} のCSV行の書き込みに失敗", chunk.index))?;
    }

    writer
        .write_record([
            "FINAL".to_string(),
            format_mean(summary.mean_empathy),
            format_mean(summary.mean_professionalism),
            summary.overall.overall_label().to_string(),
            "Final average scores".to_string(),
            join_list(&summary.violations, "None"),
            join_list(&summary.suggestions, "None"),
        ])
        .context("CSVのFINAL行の書き込みに失敗")?;

    writer.flush().context("CSVのフラッシュに失敗")?;
    Ok(())
}

/// CSVから読み戻した監査結果
pub struct AuditReport {
    /// チャンク行
    pub chunks: Vec<ReportRow>,
    /// 集計結果（FINAL行が無い場合はチャンク行から再計算）
    pub summary: AuditSummary,
    /// FINAL行がCSVに存在したか
    pub has_final_row: bool,
}

/// 監査結果CSVの1行
#[derive(Debug, Clone, Deserialize)]
pub struct ReportRow {
    #[serde(rename = "Chunk")]
    pub chunk: String,
    pub empathy: f64,
    pub professionalism: f64,
    pub compliance: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub violations: String,
    #[serde(default)]
    pub suggestions: String,
}

/// 監査結果CSVを読み戻す
///
/// `Chunk` 列が `FINAL` の行を集計として扱い、それ以外をチャンク
/// 行として返す。FINAL行が無いCSV（途中で止まった実行など）は
/// チャンク行から集計し直す。
///
/// # Errors
///
/// ファイルの読み込み、行のパース、または判定表記の解釈に失敗
/// した場合にエラーを返す。
pub fn read_audit_csv<P: AsRef<Path>>(path: P) -> Result<AuditReport> {
    let mut reader = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("CSVファイルの読み込みに失敗: {:?}", path.as_ref()))?;

    let mut chunks = Vec::new();
    let mut final_row: Option<ReportRow> = None;
    for record in reader.deserialize() {
        let row: ReportRow = record.context("CSV行のパースに失敗")?;
        if row.chunk == "FINAL" {
            final_row = Some(row);
        } else {
            chunks.push(row);
        }
    }

    let has_final_row = final_row.is_some();
    let summary = match final_row {
        Some(row) => AuditSummary {
            mean_empathy: row.empathy,
            mean_professionalism: row.professionalism,
            overall: Verdict::parse(&row.compliance)
                .ok_or_else(|| anyhow::anyhow!("FINAL行の判定が不正: {}", row.compliance))?,
            violations: split_list(&row.violations),
            suggestions: split_list(&row.suggestions),
            chunks_scored: chunks.len(),
        },
        None => {
            log::warn!("FINAL行が見つかりません。チャンク行から集計し直します");
            summarize_rows(&chunks)?
        }
    };

    Ok(AuditReport {
        chunks,
        summary,
        has_final_row,
    })
}

/// 集計結果をコンソールに出力する
///
/// 違反は上位3件、改善提案は上位5件まで表示する。
pub fn print_summary(summary: &AuditSummary) {
    println!("\n--- FINAL AUDIT RESULTS ---");
    println!("Final Empathy Score: {:.2}", summary.mean_empathy);
    println!(
        "Final Professionalism Score: {:.2}",
        summary.mean_professionalism
    );
    println!("Overall Compliance: {}", summary.overall.overall_label());
    println!("Chunks Scored: {}", summary.chunks_scored);

    if summary.violations.is_empty() {
        println!("\nNo violations detected");
    } else {
        println!("\nTop Violations:");
        for (i, violation) in summary.violations.iter().take(3).enumerate() {
            println!("  {}. {}", i + 1, violation);
        }
    }

    if !summary.suggestions.is_empty() {
        println!("\nTop Improvement Suggestions:");
        for (i, suggestion) in summary.suggestions.iter().take(5).enumerate() {
            println!("  {}. {}", i + 1, suggestion);
        }
    }
}

/// " | " 連結のセルをリストに戻す
///
/// 空セルと "None" は空リストになる。
pub fn split_list(cell: &str) -> Vec<String> {
    cell.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "None")
        .map(str::to_string)
        .collect()
}

/// チャンク行のスコアをCSVセル用の文字列にする
///
/// 整数値は小数点なし、それ以外はそのままの精度で出力する。
fn format_score(value: f64) -> String {
    format!("{}", value)
}

/// FINAL行の平均スコアをCSVセル用の文字列にする
///
/// 平均は整数値でも小数点付き（"85.0"）で出力する。
fn format_mean(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

fn join_list(items: &[String], empty_value: &str) -> String {
    if items.is_empty() {
        empty_value.to_string()
    } else {
        items.join(" | ")
    }
}

/// チャンク行だけのCSVから集計を再計算する
fn summarize_rows(rows: &[ReportRow]) -> Result<AuditSummary> {
    if rows.is_empty() {
        anyhow::bail!("CSVにチャンク行がありません");
    }

    let n = rows.len() as f64;
    let mean_empathy = rows.iter().map(|r| r.empathy).sum::<f64>() / n;
    let mean_professionalism = rows.iter().map(|r| r.professionalism).sum::<f64>() / n;

    let mut verdicts = Vec::with_capacity(rows.len());
    for row in rows {
        let verdict = Verdict::parse(&row.compliance).ok_or_else(|| {
            anyhow::anyhow!("チャンク {} の判定が不正: {}", row.chunk, row.compliance)
        })?;
        verdicts.push(verdict);
    }
    let overall = if verdicts.contains(&Verdict::Fail) {
        Verdict::Fail
    } else if verdicts.contains(&Verdict::Warn) {
        Verdict::Warn
    } else {
        Verdict::Pass
    };

    let violations = merge_lists(rows.iter().map(|r| r.violations.as_str()));
    let suggestions = merge_lists(rows.iter().map(|r| r.suggestions.as_str()));

    Ok(AuditSummary {
        mean_empathy,
        mean_professionalism,
        overall,
        violations,
        suggestions,
        chunks_scored: rows.len(),
    })
}

fn merge_lists<'a, I>(cells: I) -> Vec<String>
where
    I: Iterator<Item = &'a str>,
{
    let mut seen: Vec<String> = Vec::new();
    for cell in cells {
        for item in split_list(cell) {
            if !seen.iter().any(|s| *s == item) {
                seen.push(item);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkScore;
    use std::fs;

    fn sample_chunk(index: usize, verdict: Verdict) -> ScoredChunk {
        ScoredChunk {
            index,
            score: ChunkScore {
                empathy: 80.0 + index as f64,
                professionalism: 70.0 + index as f64,
                compliance: verdict,
                reason: format!("reason {}", index),
                violations: vec![],
                suggestions: vec![],
            },
        }
    }

    fn sample_summary() -> AuditSummary {
        AuditSummary {
            mean_empathy: 81.5,
            mean_professionalism: 71.5,
            overall: Verdict::Warn,
            violations: vec!["Shared account number".to_string()],
            suggestions: vec![
                "Use the customer's name".to_string(),
                "Confirm resolution".to_string(),
            ],
            chunks_scored: 2,
        }
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("audit_results.csv");

        let chunks = vec![
            sample_chunk(1, Verdict::Pass),
            sample_chunk(2, Verdict::Warn),
        ];
        write_audit_csv(&csv_path, &chunks, &sample_summary()).unwrap();

        let report = read_audit_csv(&csv_path).unwrap();
        assert!(report.has_final_row);
        assert_eq!(report.chunks.len(), 2);
        assert_eq!(report.chunks[0].chunk, "1");
        assert_eq!(report.chunks[0].empathy, 81.0);
        assert_eq!(report.summary.mean_empathy, 81.5);
        assert_eq!(report.summary.overall, Verdict::Warn);
        assert_eq!(report.summary.violations, vec!["Shared account number"]);
        assert_eq!(report.summary.suggestions.len(), 2);
        assert_eq!(report.summary.chunks_scored, 2);
    }

    #[test]
    fn test_csv_exact_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("audit_results.csv");

        let chunks = vec![ScoredChunk {
            index: 1,
            score: ChunkScore {
                empathy: 85.0,
                professionalism: 90.0,
                compliance: Verdict::Pass,
                reason: "ok".to_string(),
                violations: vec![],
                suggestions: vec![],
            },
        }];
        let summary = AuditSummary {
            mean_empathy: 85.0,
            mean_professionalism: 90.0,
            overall: Verdict::Pass,
            violations: vec![],
            suggestions: vec![],
            chunks_scored: 1,
        };
        write_audit_csv(&csv_path, &chunks, &summary).unwrap();

        let content = fs::read_to_string(&csv_path).unwrap();
        let expected = "Chunk,empathy,professionalism,compliance,reason,violations,suggestions\n\
                        1,85,90,Pass,ok,,\n\
                        FINAL,85.0,90.0,PASS,Final average scores,None,None\n";
        assert_eq!(content, expected);
    }

    #[test]
    fn test_read_without_final_row() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("partial.csv");
        fs::write(
            &csv_path,
            "Chunk,empathy,professionalism,compliance,reason,violations,suggestions\n\
             1,80,70,Pass,ok,,\n\
             2,90,80,Fail,bad,Shared account number | Rude tone,Apologize\n",
        )
        .unwrap();

        let report = read_audit_csv(&csv_path).unwrap();
        assert!(!report.has_final_row);
        assert_eq!(report.summary.mean_empathy, 85.0);
        assert_eq!(report.summary.mean_professionalism, 75.0);
        assert_eq!(report.summary.overall, Verdict::Fail);
        assert_eq!(
            report.summary.violations,
            vec!["Shared account number", "Rude tone"]
        );
        assert_eq!(report.summary.suggestions, vec!["Apologize"]);
    }

    #[test]
    fn test_read_empty_csv_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("empty.csv");
        fs::write(
            &csv_path,
            "Chunk,empathy,professionalism,compliance,reason,violations,suggestions\n",
        )
        .unwrap();
        assert!(read_audit_csv(&csv_path).is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("A | B"), vec!["A", "B"]);
        assert_eq!(split_list("A"), vec!["A"]);
        assert!(split_list("").is_empty());
        assert!(split_list("None").is_empty());
        assert_eq!(split_list(" A |  | B "), vec!["A", "B"]);
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(85.0), "85");
        assert_eq!(format_score(83.5), "83.5");
        assert!(format_score(250.0 / 3.0).starts_with("83.33"));
    }

    #[test]
    fn test_format_mean_integral_gets_decimal_point() {
        assert_eq!(format_mean(85.0), "85.0");
        assert_eq!(format_mean(0.0), "0.0");
        assert_eq!(format_mean(83.5), "83.5");
        assert!(format_mean(250.0 / 3.0).starts_with("83.33"));
    }

    #[test]
    fn test_join_list() {
        assert_eq!(join_list(&[], "None"), "None");
        assert_eq!(join_list(&[], ""), "");
        assert_eq!(
            join_list(&["A".to_string(), "B".to_string()], "None"),
            "A | B"
        );
    }
}
