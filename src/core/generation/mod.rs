//! Constrained decoding: bias injection and per-step streaming on top of an
//! opaque decoding loop.

pub mod bias;
pub mod decode;
pub mod local;
pub mod stream;

pub use bias::{BiasProcessor, BiasSet, BiasTensorBuilder, DenseBiasBuilder};
pub use decode::{CausalLm, DecodeConfig, DecodeOutput, DecodingLoop, ScoreProcessor, StoppingCriterion};
pub use local::LocalBackend;
pub use stream::StreamAdapter;

use crate::core::{ModelError, Result, TokenId};
use candle_core::{Device, Tensor};

/// A batch of fixed-shape token sequences plus decoding parameters.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub input_ids: Vec<Vec<TokenId>>,
    pub attention_mask: Vec<Vec<u32>>,
    pub temperature: f64,
    pub max_new_tokens: usize,
    pub bias: BiasSet,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Left-pads `sequences` with `pad` so new tokens line up at the end of every row.
    pub fn left_padded(sequences: Vec<Vec<TokenId>>, pad: TokenId) -> Self {
        let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let mut input_ids = Vec::with_capacity(sequences.len());
        let mut attention_mask = Vec::with_capacity(sequences.len());
        for seq in sequences {
            let padding = width - seq.len();
            let mut ids = vec![pad; padding];
            ids.extend(seq.iter().copied());
            let mut mask = vec![0u32; padding];
            mask.extend(std::iter::repeat(1u32).take(seq.len()));
            input_ids.push(ids);
            attention_mask.push(mask);
        }
        Self {
            input_ids,
            attention_mask,
            temperature: 0.0,
            max_new_tokens: 32,
            bias: BiasSet::new(),
            seed: None,
        }
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_new_tokens(mut self, max: usize) -> Self {
        self.max_new_tokens = max;
        self
    }

    pub fn bias(mut self, bias: BiasSet) -> Self {
        self.bias = bias;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map(Vec::len).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        check_shape(&self.input_ids, &self.attention_mask)?;
        if self.batch_size() > 0 && self.seq_len() == 0 {
            return Err(ModelError::InvalidRequest(
                "prompt is empty: at least one input token is needed to start decoding".to_string(),
            ));
        }
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(ModelError::InvalidRequest(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Output sequences (prompt included) and the processed score distribution of
/// every decoding step, each of shape `[batch, vocab]`.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub sequences: Vec<Vec<TokenId>>,
    pub scores: Vec<Tensor>,
}

impl GenerationResult {
    pub fn steps(&self) -> usize {
        self.scores.len()
    }

    /// Tokens appended after a prompt of width `prompt_len`, per batch row.
    pub fn new_tokens(&self, prompt_len: usize) -> Vec<&[TokenId]> {
        self.sequences
            .iter()
            .map(|s| s.get(prompt_len..).unwrap_or(&[]))
            .collect()
    }

    pub fn step_scores(&self, step: usize, row: usize) -> Result<Vec<f32>> {
        let scores = self
            .scores
            .get(step)
            .ok_or_else(|| ModelError::InvalidRequest(format!("no step {step}")))?;
        Ok(scores.get(row)?.to_vec1::<f32>()?)
    }
}

/// State of one batch row after one decoding step.
#[derive(Debug, Clone)]
pub struct StreamEvent<'a> {
    pub step: usize,
    pub batch_index: usize,
    pub sequence: &'a [TokenId],
    pub scores: Tensor,
}

pub trait TokenStreamer: Send {
    fn on_step(&mut self, event: &StreamEvent<'_>);
}

impl<F> TokenStreamer for F
where
    F: FnMut(&StreamEvent<'_>) + Send,
{
    fn on_step(&mut self, event: &StreamEvent<'_>) {
        self(event)
    }
}

pub trait GenerationBackend: Send + Sync {
    fn eos_token_id(&self) -> TokenId;
    fn vocab_size(&self) -> usize;

    /// Per-token log-probabilities of `input_ids`. Position 0 of every row is
    /// `0.0`; position `i` holds the log-probability of token `i` given the
    /// tokens before it.
    fn score(&self, input_ids: &[Vec<TokenId>], attention_mask: &[Vec<u32>]) -> Result<Vec<Vec<f32>>>;

    fn generate(
        &self,
        request: &GenerationRequest,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<GenerationResult>;
}

pub(crate) fn check_shape(input_ids: &[Vec<TokenId>], attention_mask: &[Vec<u32>]) -> Result<()> {
    if input_ids.len() != attention_mask.len() {
        return Err(ModelError::InvalidRequest(format!(
            "{} sequences but {} attention masks",
            input_ids.len(),
            attention_mask.len()
        )));
    }
    let width = input_ids.first().map(Vec::len).unwrap_or(0);
    for (ids, mask) in input_ids.iter().zip(attention_mask) {
        if ids.len() != width || mask.len() != width {
            return Err(ModelError::InvalidRequest(
                "input_ids and attention_mask must be rectangular and of identical shape".to_string(),
            ));
        }
    }
    Ok(())
}

/// Copies a rectangular host batch onto `device` as a `[rows, width]` u32 tensor.
pub(crate) fn batch_tensor(rows: &[Vec<u32>], device: &Device) -> candle_core::Result<Tensor> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_vec(flat, (rows.len(), width), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_padded() {
        let request = GenerationRequest::left_padded(vec![vec![1, 2, 3], vec![4]], 9);
        assert_eq!(request.input_ids, vec![vec![1, 2, 3], vec![9, 9, 4]]);
        assert_eq!(request.attention_mask, vec![vec![1, 1, 1], vec![0, 0, 1]]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_ragged() {
        let mut request = GenerationRequest::left_padded(vec![vec![1, 2]], 0);
        request.attention_mask = vec![vec![1]];
        assert!(matches!(request.validate(), Err(ModelError::InvalidRequest(_))));

        let request = GenerationRequest::left_padded(vec![vec![1]], 0).temperature(-1.0);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_prompt() {
        let request = GenerationRequest::left_padded(vec![vec![]], 0);
        assert!(matches!(request.validate(), Err(ModelError::InvalidRequest(_))));

        let empty_batch = GenerationRequest::left_padded(Vec::new(), 0);
        assert!(empty_batch.validate().is_ok());
    }
}
