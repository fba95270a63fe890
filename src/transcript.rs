use regex_lite::Regex;

/// 生の文字起こしテキストを整形する
///
/// ASRが混ぜてくるノイズ表記を取り除き、空白を正規化する。
/// 処理内容:
///
/// 1. 角括弧の注記を削除（"[inaudible]", "[music]" など）
/// 2. 短い丸括弧の注記を削除（"(laughs)" など。文が入るような
///    長い括弧は残す）
/// 3. 連続する空白・改行を1つのスペースに統合
/// 4. 句読点の直前のスペースを削除
///
/// 決定的な処理なので同じ入力からは常に同じ出力になる。
///
/// # Examples
///
/// ```
/// # use call_audit::transcript::clean_transcript;
/// let raw = "Hello [inaudible] ,  thank you for calling (coughs) .";
/// assert_eq!(clean_transcript(raw), "Hello, thank you for calling.");
/// ```
pub fn clean_transcript(raw: &str) -> String {
    let brackets = Regex::new(r"\[[^\]]*\]").unwrap();
    let short_parens = Regex::new(r"\([^().!?]{1,24}\)").unwrap();
    let whitespace = Regex::new(r"\s+").unwrap();
    let space_before_punct = Regex::new(r" ([,.!?;:])").unwrap();

    let text = brackets.replace_all(raw, "");
    let text = short_parens.replace_all(&text, "");
    let text = whitespace.replace_all(&text, " ");
    let text = space_before_punct.replace_all(&text, "$1");
    text.trim().to_string()
}
