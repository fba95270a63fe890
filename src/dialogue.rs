use crate::chat::{ChatClient, ChatMessage};
use crate::config::LabelConfig;
use crate::types::{DialogueTurn, Speaker};
use anyhow::{Context, Result};
use regex_lite::Regex;

/// 話者ラベル付け用のプロンプトを組み立てる
pub fn build_label_prompt(cleaned: &str, cfg: &LabelConfig) -> String {
    format!(
        "Format this into a dialogue with '{}:' and '{}:':\n\n{}",
        cfg.agent_label, cfg.customer_label, cleaned
    )
}

/// 整形済み文字起こしをLLMで話者ラベル付き対話に変換する
///
/// 出力は `Agent: ...` / `Customer: ...` 形式の複数行テキスト。
/// パースは [`parse_dialogue`] で行う。
///
/// # Errors
///
/// LLM呼び出しに失敗した場合にエラーを返す。
pub async fn label_dialogue(chat: &ChatClient, cfg: &LabelConfig, cleaned: &str) -> Result<String> {
    log::info!("話者ラベル付けを実行中 (モデル: {})", cfg.model);
    let prompt = build_label_prompt(cleaned, cfg);
    let labeled = chat
        .complete(&cfg.model, &[ChatMessage::user(prompt)])
        .await
        .context("話者ラベル付けのLLM呼び出しに失敗")?;
    Ok(labeled.trim().to_string())
}

/// ラベル付き対話テキストをターン列にパースする
///
/// `話者名: 発話` 形式の行を1ターンとして読み取る。設定した話者
/// ラベルは文字種を問わずリテラルに一致させ、それ以外は英字の
/// 話者名のみ受け付ける。話者名にコロンは含められないため、発話
/// 中のコロンはそのまま残る。ラベルの無い行は直前のターンの続き
/// として連結する。最初のターンより前にある前置き行（"Here is
/// the dialogue:" など）は読み飛ばす。
///
/// # Examples
///
/// ```
/// # use call_audit::dialogue::parse_dialogue;
/// let turns = parse_dialogue("Agent: Hello\nCustomer: Hi", "Agent", "Customer");
/// assert_eq!(turns.len(), 2);
/// ```
pub fn parse_dialogue(labeled: &str, agent_label: &str, customer_label: &str) -> Vec<DialogueTurn> {
    let pattern = format!(
        r"^\s*({}|{}|[A-Za-z][A-Za-z0-9 .'_-]{{0,40}})\s*:\s*(.*)$",
        regex_lite::escape(agent_label),
        regex_lite::escape(customer_label),
    );
    let speaker_line = Regex::new(&pattern).unwrap();

    let mut turns: Vec<DialogueTurn> = Vec::new();
    for line in labeled.lines() {
        if let Some(caps) = speaker_line.captures(line) {
            let speaker = Speaker::from_label(&caps[1], agent_label, customer_label);
            let text = caps[2].trim().to_string();
            turns.push(DialogueTurn::new(speaker, text));
        } else {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match turns.last_mut() {
                Some(turn) => {
                    // 前のターンの続き
                    if turn.text.is_empty() {
                        turn.text = trimmed.to_string();
                    } else {
                        turn.text.push(' ');
                        turn.text.push_str(trimmed);
                    }
                }
                None => {
                    log::debug!("話者ラベルの無い前置き行を読み飛ばし: {}", trimmed);
                }
            }
        }
    }

    // 発話が空のままのターンは落とす
    turns.retain(|turn| !turn.text.is_empty());
    turns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_cfg() -> LabelConfig {
        LabelConfig {
            model: "llama-3.3-70b-versatile".to_string(),
            agent_label: "Agent".to_string(),
            customer_label: "Customer".to_string(),
        }
    }

    #[test]
    fn test_build_label_prompt() {
        let prompt = build_label_prompt("hello world", &default_cfg());
        assert_eq!(
            prompt,
            "Format this into a dialogue with 'Agent:' and 'Customer:':\n\nhello world"
        );
    }

    #[test]
    fn test_build_label_prompt_custom_labels() {
        let cfg = LabelConfig {
            agent_label: "Operator".to_string(),
            customer_label: "Caller".to_string(),
            ..default_cfg()
        };
        let prompt = build_label_prompt("x", &cfg);
        assert!(prompt.starts_with("Format this into a dialogue with 'Operator:' and 'Caller:':"));
    }

    #[test]
    fn test_parse_dialogue_basic() {
        let labeled = "Agent: Thank you for calling.\nCustomer: Hi, I have a billing question.";
        let turns = parse_dialogue(labeled, "Agent", "Customer");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::Agent);
        assert_eq!(turns[0].text, "Thank you for calling.");
        assert_eq!(turns[1].speaker, Speaker::Customer);
    }

    #[test]
    fn test_parse_continuation_lines() {
        let labeled = "Agent: Hello\nand welcome to support.\n\nCustomer: Thanks.";
        let turns = parse_dialogue(labeled, "Agent", "Customer");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "Hello and welcome to support.");
    }

    #[test]
    fn test_parse_skips_preamble() {
        let labeled = "Here is the dialogue:\n\nAgent: Hello.\nCustomer: Hi.";
        let turns = parse_dialogue(labeled, "Agent", "Customer");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::Agent);
    }

    #[test]
    fn test_parse_unknown_speaker() {
        let labeled = "Supervisor: Taking over this call.";
        let turns = parse_dialogue(labeled, "Agent", "Customer");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].speaker, Speaker::Other("Supervisor".to_string()));
    }

    #[test]
    fn test_parse_non_ascii_labels() {
        let labeled = "担当者: お電話ありがとうございます。\n顧客: 料金について聞きたいのですが。";
        let turns = parse_dialogue(labeled, "担当者", "顧客");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::Agent);
        assert_eq!(turns[0].text, "お電話ありがとうございます。");
        assert_eq!(turns[1].speaker, Speaker::Customer);
    }

    #[test]
    fn test_parse_case_insensitive_labels() {
        let labeled = "AGENT: Hello.\ncustomer: Hi.";
        let turns = parse_dialogue(labeled, "Agent", "Customer");
        assert_eq!(turns[0].speaker, Speaker::Agent);
        assert_eq!(turns[1].speaker, Speaker::Customer);
    }

    #[test]
    fn test_parse_keeps_colons_in_speech() {
        let labeled = "Customer: I called twice: nobody answered.";
        let turns = parse_dialogue(labeled, "Agent", "Customer");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "I called twice: nobody answered.");
    }

    #[test]
    fn test_parse_drops_empty_turns() {
        let labeled = "Agent:\nCustomer: Hi.";
        let turns = parse_dialogue(labeled, "Agent", "Customer");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].speaker, Speaker::Customer);
    }

    #[test]
    fn test_parse_empty_input() {
        assert!(parse_dialogue("", "Agent", "Customer").is_empty());
    }
}
