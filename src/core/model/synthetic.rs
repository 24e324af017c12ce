//! Synthetic model producing seeded pseudo-random logits. Needs no weights,
//! so the full resolution and decoding path can run in tests.

use super::registry::{BackendRegistry, BackendSpec, RANDOM_KIND};
use crate::core::generation::{CausalLm, GenerationBackend, LocalBackend};
use crate::core::TokenId;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

pub struct RandomLm {
    device: Device,
    vocab_size: usize,
    eos_token_id: TokenId,
    seed: u64,
}

impl RandomLm {
    pub fn new(vocab_size: usize, eos_token_id: TokenId, seed: u64) -> Self {
        Self {
            device: Device::Cpu,
            vocab_size,
            eos_token_id,
            seed,
        }
    }

    /// Logits at a position depend only on the seed and the unmasked tokens up
    /// to and including it, so padding never changes the outcome.
    fn position_logits(&self, prefix_hash: u64, out: &mut [f32]) {
        let mut rng = StdRng::seed_from_u64(prefix_hash);
        for v in out.iter_mut() {
            *v = rng.gen_range(-4.0f32..4.0);
        }
    }
}

fn mix(hash: u64, token: TokenId) -> u64 {
    hash.wrapping_mul(33).wrapping_add(token as u64 + 1)
}

impl CausalLm for RandomLm {
    fn device(&self) -> &Device {
        &self.device
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    fn forward(&mut self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let ids = input_ids.to_vec2::<u32>()?;
        let mask = attention_mask.to_vec2::<u32>()?;
        let (batch, seq) = input_ids.dims2()?;

        let mut data = vec![0.0f32; batch * seq * self.vocab_size];
        for (b, (row, row_mask)) in ids.iter().zip(&mask).enumerate() {
            let mut hash = self.seed ^ 5381;
            for (s, (&token, &m)) in row.iter().zip(row_mask).enumerate() {
                if m != 0 {
                    hash = mix(hash, token);
                }
                let offset = (b * seq + s) * self.vocab_size;
                self.position_logits(hash, &mut data[offset..offset + self.vocab_size]);
            }
        }
        Tensor::from_vec(data, (batch, seq, self.vocab_size), &self.device)
    }
}

pub(crate) fn register(registry: &BackendRegistry) {
    registry.register(RANDOM_KIND, |spec: &BackendSpec| {
        let vocab_size = spec
            .options
            .get_u64("vocab_size")
            .map(|v| v as usize)
            .unwrap_or_else(|| spec.tokenizer.vocab_size());
        let eos = spec.tokenizer.eos_token();
        if (eos as usize) >= vocab_size {
            anyhow::bail!("eos token {eos} outside of vocabulary of size {vocab_size}");
        }
        let seed = spec.options.get_u64("seed").unwrap_or_else(rand::random);
        if spec.options.is_truthy("silent") {
            tracing::debug!(vocab_size, seed, "random model ready");
        } else {
            tracing::info!(vocab_size, seed, "random model ready");
        }

        let model = RandomLm::new(vocab_size, eos, seed);
        let mut backend = LocalBackend::new(RANDOM_KIND, model).with_seed(seed);
        if let Some(rows) = spec.options.get_u64("batch_size") {
            backend = backend.with_max_batch_size(rows as usize);
        }
        Ok(Arc::new(backend) as Arc<dyn GenerationBackend>)
    });
}
