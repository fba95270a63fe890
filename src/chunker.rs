use crate::types::{DialogueChunk, DialogueTurn};
use anyhow::Result;

/// ターン列を固定サイズの採点チャンクに分割する
///
/// 端数が出た場合、最後のチャンクは指定サイズより小さくなる。
/// チャンク番号は1始まりで、CSVの `Chunk` 列にそのまま使われる。
///
/// # Arguments
///
/// * `turns` - ラベル付け済みのターン列
/// * `turns_per_chunk` - 1チャンクあたりのターン数
///
/// # Errors
///
/// `turns_per_chunk` が0の場合にエラーを返す。
///
/// # Examples
///
/// ```
/// # use call_audit::chunker::chunk_turns;
/// # use call_audit::types::{DialogueTurn, Speaker};
/// let turns: Vec<DialogueTurn> = (0..7)
///     .map(|i| DialogueTurn::new(Speaker::Agent, format!("turn {}", i)))
///     .collect();
/// let chunks = chunk_turns(&turns, 5).unwrap();
/// assert_eq!(chunks.len(), 2);
/// assert_eq!(chunks[0].index, 1);
/// assert_eq!(chunks[1].len(), 2);
/// ```
pub fn chunk_turns(turns: &[DialogueTurn], turns_per_chunk: usize) -> Result<Vec<DialogueChunk>> {
    if turns_per_chunk == 0 {
        anyhow::bail!("scoring.chunk_turnsは1以上を指定してください");
    }

    Ok(turns
        .chunks(turns_per_chunk)
        .enumerate()
        .map(|(i, window)| DialogueChunk {
            index: i + 1,
            turns: window.to_vec(),
        })
        .collect())
}
