use super::decode::StoppingCriterion;
use super::{StreamEvent, TokenStreamer};
use crate::core::TokenId;
use candle_core::Tensor;

/// Presents a [`TokenStreamer`] as a stopping criterion so the decoding loop
/// reports every step. It never asks the loop to stop: the number of generated
/// tokens is the same with or without an observer attached.
pub struct StreamAdapter<'a> {
    streamer: &'a mut dyn TokenStreamer,
}

impl<'a> StreamAdapter<'a> {
    pub fn new(streamer: &'a mut dyn TokenStreamer) -> Self {
        Self { streamer }
    }
}

impl StoppingCriterion for StreamAdapter<'_> {
    fn should_stop(&mut self, step: usize, sequences: &[Vec<TokenId>], scores: &Tensor) -> bool {
        for (batch_index, sequence) in sequences.iter().enumerate() {
            match scores.get(batch_index) {
                Ok(row) => self.streamer.on_step(&StreamEvent {
                    step,
                    batch_index,
                    sequence,
                    scores: row,
                }),
                Err(e) => tracing::warn!(step, batch_index, "could not slice step scores: {e}"),
            }
        }
        false
    }
}
