use super::decode::ScoreProcessor;
use crate::core::TokenId;
use candle_core::{Tensor, D};
use once_cell::unsync::OnceCell;
use std::collections::BTreeMap;

/// Sparse additive log-probability adjustments, keyed by token id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BiasSet {
    entries: BTreeMap<TokenId, f32>,
}

impl BiasSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: TokenId, bias: f32) -> Self {
        self.insert(token, bias);
        self
    }

    pub fn insert(&mut self, token: TokenId, bias: f32) {
        self.entries.insert(token, bias);
    }

    pub fn get(&self, token: TokenId) -> Option<f32> {
        self.entries.get(&token).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TokenId, f32)> + '_ {
        self.entries.iter().map(|(&t, &b)| (t, b))
    }
}

impl FromIterator<(TokenId, f32)> for BiasSet {
    fn from_iter<I: IntoIterator<Item = (TokenId, f32)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

pub trait BiasTensorBuilder: Send + Sync {
    fn build(&self, bias: &BiasSet, vocab_size: usize) -> Vec<f32>;
}

/// Zero everywhere except at biased ids. Ids outside the vocabulary are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseBiasBuilder;

impl BiasTensorBuilder for DenseBiasBuilder {
    fn build(&self, bias: &BiasSet, vocab_size: usize) -> Vec<f32> {
        let mut dense = vec![0.0f32; vocab_size];
        for (token, value) in bias.iter() {
            match dense.get_mut(token as usize) {
                Some(slot) => *slot = value,
                None => tracing::debug!(token, vocab_size, "bias for out-of-vocabulary token ignored"),
            }
        }
        dense
    }
}

/// Adds the dense bias to the raw scores and log-normalizes.
///
/// The dense tensor is built on the first step and reused for every later step
/// and batch row. One processor serves exactly one generate call.
pub struct BiasProcessor<'a> {
    bias: &'a BiasSet,
    builder: &'a dyn BiasTensorBuilder,
    tensor: OnceCell<Tensor>,
}

impl<'a> BiasProcessor<'a> {
    pub fn new(bias: &'a BiasSet, builder: &'a dyn BiasTensorBuilder) -> Self {
        Self {
            bias,
            builder,
            tensor: OnceCell::new(),
        }
    }
}

impl ScoreProcessor for BiasProcessor<'_> {
    fn process(&mut self, _sequences: &[Vec<TokenId>], scores: &Tensor) -> candle_core::Result<Tensor> {
        let vocab_size = scores.dim(D::Minus1)?;
        let bias = self.tensor.get_or_try_init(|| {
            let dense = self.builder.build(self.bias, vocab_size);
            Tensor::from_vec(dense, vocab_size, scores.device())?.to_dtype(scores.dtype())
        })?;
        candle_nn::ops::log_softmax(&scores.broadcast_add(bias)?, D::Minus1)
    }
}
