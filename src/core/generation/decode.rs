use super::batch_tensor;
use crate::core::TokenId;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;

/// Forward pass of an autoregressive model.
pub trait CausalLm: Send {
    fn device(&self) -> &Device;
    fn vocab_size(&self) -> usize;
    fn eos_token_id(&self) -> TokenId;

    /// `input_ids` and `attention_mask` are `[batch, seq]`; returns raw logits
    /// of shape `[batch, seq, vocab]`.
    fn forward(&mut self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor>;
}

/// Rewrites the `[batch, vocab]` scores of one step before sampling.
pub trait ScoreProcessor {
    fn process(&mut self, sequences: &[Vec<TokenId>], scores: &Tensor) -> candle_core::Result<Tensor>;
}

/// Called once per step after the sampled tokens are appended; returning
/// `true` ends decoding for the whole batch.
pub trait StoppingCriterion {
    fn should_stop(&mut self, step: usize, sequences: &[Vec<TokenId>], scores: &Tensor) -> bool;
}

#[derive(Debug, Clone)]
pub struct DecodeConfig {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub eos_token_id: TokenId,
    pub pad_token_id: TokenId,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct DecodeOutput {
    pub sequences: Vec<Vec<TokenId>>,
    pub scores: Vec<Tensor>,
}

/// Generic sample-append loop. Callers only get the two extension points
/// above; termination is `max_new_tokens`, end-of-sequence on every row, or a
/// stopping criterion.
pub struct DecodingLoop<'m, M: CausalLm + ?Sized> {
    model: &'m mut M,
}

impl<'m, M: CausalLm + ?Sized> DecodingLoop<'m, M> {
    pub fn new(model: &'m mut M) -> Self {
        Self { model }
    }

    pub fn run(
        self,
        input_ids: &[Vec<TokenId>],
        attention_mask: &[Vec<u32>],
        config: &DecodeConfig,
        processors: &mut [Box<dyn ScoreProcessor + '_>],
        criteria: &mut [Box<dyn StoppingCriterion + '_>],
    ) -> candle_core::Result<DecodeOutput> {
        let device = self.model.device().clone();
        let batch = input_ids.len();

        let mut sequences = input_ids.to_vec();
        let mut mask = attention_mask.to_vec();
        let mut finished = vec![false; batch];
        let mut all_scores = Vec::with_capacity(config.max_new_tokens);

        let temperature = (config.temperature > 0.0).then_some(config.temperature);
        let mut sampler = LogitsProcessor::new(config.seed, temperature, None);

        if batch == 0 {
            return Ok(DecodeOutput { sequences, scores: all_scores });
        }
        if sequences.iter().any(Vec::is_empty) {
            candle_core::bail!("cannot decode from an empty prompt");
        }

        for step in 0..config.max_new_tokens {
            let ids = batch_tensor(&sequences, &device)?;
            let mask_tensor = batch_tensor(&mask, &device)?;

            let logits = self.model.forward(&ids, &mask_tensor)?;
            let seq_len = logits.dim(1)?;
            let mut scores = logits
                .narrow(1, seq_len - 1, 1)?
                .squeeze(1)?
                .to_dtype(DType::F32)?;

            for processor in processors.iter_mut() {
                scores = processor.process(&sequences, &scores)?;
            }

            for (row, seq) in sequences.iter_mut().enumerate() {
                let token = if finished[row] {
                    config.pad_token_id
                } else {
                    sampler.sample(&scores.get(row)?)?
                };
                seq.push(token);
                mask[row].push(1);
                if token == config.eos_token_id {
                    finished[row] = true;
                }
            }
            all_scores.push(scores.clone());

            let mut stop = false;
            for criterion in criteria.iter_mut() {
                stop |= criterion.should_stop(step, &sequences, &scores);
            }
            if stop || finished.iter().all(|&f| f) {
                tracing::trace!(step, stop, "decoding finished");
                break;
            }
        }

        Ok(DecodeOutput {
            sequences,
            scores: all_scores,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Emits `script[step]` as the arg-max token at every step, then `eos`.
    pub(crate) struct ScriptedLm {
        pub device: Device,
        pub vocab: usize,
        pub eos: TokenId,
        pub script: Vec<TokenId>,
        pub prompt_len: usize,
        pub forward_calls: usize,
    }

    impl ScriptedLm {
        pub(crate) fn new(vocab: usize, eos: TokenId, script: Vec<TokenId>, prompt_len: usize) -> Self {
            Self {
                device: Device::Cpu,
                vocab,
                eos,
                script,
                prompt_len,
                forward_calls: 0,
            }
        }
    }

    impl CausalLm for ScriptedLm {
        fn device(&self) -> &Device {
            &self.device
        }

        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn eos_token_id(&self) -> TokenId {
            self.eos
        }

        fn forward(&mut self, input_ids: &Tensor, _attention_mask: &Tensor) -> candle_core::Result<Tensor> {
            self.forward_calls += 1;
            let (batch, seq) = input_ids.dims2()?;
            let step = seq.saturating_sub(self.prompt_len);
            let target = self.script.get(step).copied().unwrap_or(self.eos) as usize;
            let mut data = vec![0.0f32; batch * seq * self.vocab];
            for b in 0..batch {
                for s in 0..seq {
                    data[(b * seq + s) * self.vocab + target] = 10.0;
                }
            }
            Tensor::from_vec(data, (batch, seq, self.vocab), &self.device)
        }
    }

    fn config(max_new_tokens: usize, eos: TokenId) -> DecodeConfig {
        DecodeConfig {
            max_new_tokens,
            temperature: 0.0,
            eos_token_id: eos,
            pad_token_id: eos,
            seed: 0,
        }
    }

    #[test]
    fn test_stops_at_eos() {
        let mut model = ScriptedLm::new(8, 7, vec![3, 4, 7, 5, 5], 2);
        let out = DecodingLoop::new(&mut model)
            .run(&[vec![1, 2]], &[vec![1, 1]], &config(5, 7), &mut [], &mut [])
            .unwrap();
        assert_eq!(out.sequences, vec![vec![1, 2, 3, 4, 7]]);
        assert_eq!(out.scores.len(), 3);
        assert_eq!(model.forward_calls, 3);
    }

    #[test]
    fn test_stops_at_max_new_tokens() {
        let mut model = ScriptedLm::new(8, 7, vec![3, 3, 3, 3], 1);
        let out = DecodingLoop::new(&mut model)
            .run(&[vec![1]], &[vec![1]], &config(2, 7), &mut [], &mut [])
            .unwrap();
        assert_eq!(out.sequences, vec![vec![1, 3, 3]]);
        assert_eq!(out.scores[0].dims(), &[1, 8]);
    }

    struct StopAfter(usize);

    impl StoppingCriterion for StopAfter {
        fn should_stop(&mut self, step: usize, _sequences: &[Vec<TokenId>], _scores: &Tensor) -> bool {
            step + 1 >= self.0
        }
    }

    #[test]
    fn test_criterion_can_stop() {
        let mut model = ScriptedLm::new(8, 7, vec![3, 3, 3, 3], 1);
        let mut criteria: Vec<Box<dyn StoppingCriterion>> = vec![Box::new(StopAfter(1))];
        let out = DecodingLoop::new(&mut model)
            .run(&[vec![1]], &[vec![1]], &config(4, 7), &mut [], &mut criteria)
            .unwrap();
        assert_eq!(out.sequences, vec![vec![1, 3]]);
    }

    #[test]
    fn test_empty_prompt_is_an_error() {
        let mut model = ScriptedLm::new(8, 7, vec![3], 0);
        let result = DecodingLoop::new(&mut model).run(&[vec![]], &[vec![]], &config(2, 7), &mut [], &mut []);
        assert!(result.is_err());
        assert_eq!(model.forward_calls, 0);
    }
}
