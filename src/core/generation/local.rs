use super::bias::{BiasProcessor, BiasTensorBuilder, DenseBiasBuilder};
use super::decode::{CausalLm, DecodeConfig, DecodingLoop, ScoreProcessor, StoppingCriterion};
use super::stream::StreamAdapter;
use super::{batch_tensor, check_shape, GenerationBackend, GenerationRequest, GenerationResult, TokenStreamer};
use crate::core::{Result, TokenId};
use candle_core::{DType, D};
use parking_lot::Mutex;
use std::sync::Arc;

/// [`GenerationBackend`] over an in-process [`CausalLm`].
///
/// Calls are serialized on the model. Bias tensors are rebuilt for every
/// generate call and never shared between calls.
pub struct LocalBackend<M: CausalLm> {
    name: String,
    model: Mutex<M>,
    eos_token_id: TokenId,
    vocab_size: usize,
    bias_builder: Arc<dyn BiasTensorBuilder>,
    seed: u64,
    max_batch_size: Option<usize>,
}

impl<M: CausalLm> LocalBackend<M> {
    pub fn new(name: impl Into<String>, model: M) -> Self {
        let eos_token_id = model.eos_token_id();
        let vocab_size = model.vocab_size();
        Self {
            name: name.into(),
            model: Mutex::new(model),
            eos_token_id,
            vocab_size,
            bias_builder: Arc::new(DenseBiasBuilder),
            seed: 299792458,
            max_batch_size: None,
        }
    }

    pub fn with_bias_builder(mut self, builder: Arc<dyn BiasTensorBuilder>) -> Self {
        self.bias_builder = builder;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Upper bound on rows per scoring forward pass; larger batches are split.
    pub fn with_max_batch_size(mut self, rows: usize) -> Self {
        self.max_batch_size = (rows > 0).then_some(rows);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn score_batch(&self, input_ids: &[Vec<TokenId>], attention_mask: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        let seq_len = input_ids.first().map(Vec::len).unwrap_or(0);
        if seq_len <= 1 {
            return Ok(vec![vec![0.0; seq_len]; input_ids.len()]);
        }

        let mut model = self.model.lock();
        let device = model.device().clone();
        let ids = batch_tensor(input_ids, &device)?;
        let mask = batch_tensor(attention_mask, &device)?;

        let logits = model.forward(&ids, &mask)?.to_dtype(DType::F32)?;
        drop(model);

        let logprobs = candle_nn::ops::log_softmax(&logits.narrow(1, 0, seq_len - 1)?, D::Minus1)?;
        let targets = ids.narrow(1, 1, seq_len - 1)?.contiguous()?.unsqueeze(D::Minus1)?;
        let picked = logprobs
            .contiguous()?
            .gather(&targets, D::Minus1)?
            .squeeze(D::Minus1)?
            .to_vec2::<f32>()?;

        Ok(picked
            .into_iter()
            .map(|row| std::iter::once(0.0).chain(row).collect())
            .collect())
    }
}

impl<M: CausalLm> GenerationBackend for LocalBackend<M> {
    fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn score(&self, input_ids: &[Vec<TokenId>], attention_mask: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        check_shape(input_ids, attention_mask)?;
        match self.max_batch_size {
            Some(limit) if input_ids.len() > limit => {
                let mut scores = Vec::with_capacity(input_ids.len());
                for (ids, mask) in input_ids.chunks(limit).zip(attention_mask.chunks(limit)) {
                    scores.extend(self.score_batch(ids, mask)?);
                }
                Ok(scores)
            }
            _ => self.score_batch(input_ids, attention_mask),
        }
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<GenerationResult> {
        request.validate()?;
        tracing::debug!(
            backend = %self.name,
            batch = request.batch_size(),
            max_new_tokens = request.max_new_tokens,
            temperature = request.temperature,
            biased = request.bias.len(),
            "generate"
        );

        let mut processors: Vec<Box<dyn ScoreProcessor + '_>> = Vec::new();
        if !request.bias.is_empty() {
            processors.push(Box::new(BiasProcessor::new(&request.bias, self.bias_builder.as_ref())));
        }
        let mut criteria: Vec<Box<dyn StoppingCriterion + '_>> = Vec::new();
        if let Some(streamer) = streamer {
            criteria.push(Box::new(StreamAdapter::new(streamer)));
        }

        let config = DecodeConfig {
            max_new_tokens: request.max_new_tokens,
            temperature: request.temperature,
            eos_token_id: self.eos_token_id,
            pad_token_id: self.eos_token_id,
            seed: request.seed.unwrap_or(self.seed),
        };

        let mut model = self.model.lock();
        let output = DecodingLoop::new(&mut *model).run(
            &request.input_ids,
            &request.attention_mask,
            &config,
            &mut processors,
            &mut criteria,
        )?;

        Ok(GenerationResult {
            sequences: output.sequences,
            scores: output.scores,
        })
    }
}
