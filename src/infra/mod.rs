//! Backends that run the model somewhere else and speak to it over HTTP.

pub mod lmtp;
pub mod openai;

pub use lmtp::RemoteBackend;
pub use openai::OpenAiBackend;

use crate::core::{GenerationResult, StreamEvent, TokenId, TokenStreamer};

/// Unpadded tokens of every row.
pub(crate) fn unpadded(input_ids: &[Vec<TokenId>], attention_mask: &[Vec<u32>]) -> Vec<Vec<TokenId>> {
    input_ids
        .iter()
        .zip(attention_mask)
        .map(|(ids, mask)| {
            ids.iter()
                .zip(mask)
                .filter(|(_, m)| **m != 0)
                .map(|(id, _)| *id)
                .collect()
        })
        .collect()
}

/// Right-pads rows with `pad` to the width of the longest row.
pub(crate) fn pad_right(rows: &mut [Vec<TokenId>], pad: TokenId) {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in rows.iter_mut() {
        row.resize(width, pad);
    }
}

/// Feeds a finished remote result to the streamer, one event per row per step,
/// in the order a local decoding loop would have produced them.
pub(crate) fn replay_steps(
    result: &GenerationResult,
    prompt_width: usize,
    streamer: &mut dyn TokenStreamer,
) -> crate::core::Result<()> {
    for (step, scores) in result.scores.iter().enumerate() {
        for (batch_index, sequence) in result.sequences.iter().enumerate() {
            let end = (prompt_width + step + 1).min(sequence.len());
            streamer.on_step(&StreamEvent {
                step,
                batch_index,
                sequence: &sequence[..end],
                scores: scores.get(batch_index)?,
            });
        }
    }
    Ok(())
}
