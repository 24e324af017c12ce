//! Real local models run in this process through candle.
//!
//! `llama.cpp` loads quantized GGUF weights; `candle` loads plain safetensors
//! Llama checkpoints from a directory or a hub repository. Both expose a
//! single-token, KV-cached forward that [`IncrementalLm`] turns into the
//! full-sequence [`CausalLm`] the decoding loop expects.

use super::registry::{BackendRegistry, BackendSpec, DEFAULT_LOCAL_KIND, LLAMA_CPP_KIND};
use crate::core::generation::CausalLm;
use crate::core::{ModelOptions, TokenId};
use anyhow::{bail, Context};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig};
use candle_transformers::models::quantized_llama::ModelWeights;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A model that consumes one token at a time and keeps its own KV cache.
pub trait StepModel: Send {
    /// `input` is `[1, 1]`; returns the next-token logits as `[1, vocab]`.
    fn step(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor>;

    /// Drops the KV cache so the next step starts a fresh sequence.
    fn reset(&mut self) -> candle_core::Result<()>;
}

/// Full-sequence logits from a [`StepModel`].
///
/// The tokens fed so far are remembered together with their logits; a row
/// that extends them only pays for its new tokens. Any other row restarts the
/// cache from position zero.
pub struct IncrementalLm<S: StepModel> {
    inner: S,
    device: Device,
    vocab_size: usize,
    eos_token_id: TokenId,
    fed: Vec<TokenId>,
    logits: Vec<Tensor>,
}

impl<S: StepModel> IncrementalLm<S> {
    pub fn new(inner: S, device: Device, vocab_size: usize, eos_token_id: TokenId) -> Self {
        Self {
            inner,
            device,
            vocab_size,
            eos_token_id,
            fed: Vec::new(),
            logits: Vec::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Logits after each of `tokens`, one `[vocab]` tensor per token.
    fn prefix_logits(&mut self, tokens: &[TokenId]) -> candle_core::Result<Vec<Tensor>> {
        if tokens.len() <= self.fed.len() && self.fed.starts_with(tokens) {
            return Ok(self.logits[..tokens.len()].to_vec());
        }
        let reusable = !self.fed.is_empty() && tokens.starts_with(&self.fed);
        if !reusable {
            self.inner.reset()?;
            self.fed.clear();
            self.logits.clear();
        }
        for &token in &tokens[self.fed.len()..] {
            let input = Tensor::new(&[token], &self.device)?.unsqueeze(0)?;
            let next = self.inner.step(&input, self.fed.len())?;
            self.logits.push(next.squeeze(0)?.to_dtype(DType::F32)?);
            self.fed.push(token);
        }
        Ok(self.logits[..tokens.len()].to_vec())
    }
}

impl<S: StepModel> CausalLm for IncrementalLm<S> {
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
        let padding = Tensor::zeros(self.vocab_size, DType::F32, &self.device)?;

        let mut rows = Vec::with_capacity(ids.len());
        for (row_ids, row_mask) in ids.iter().zip(&mask) {
            let tokens: Vec<TokenId> = row_ids
                .iter()
                .zip(row_mask)
                .filter(|(_, m)| **m != 0)
                .map(|(id, _)| *id)
                .collect();
            let mut logits = self.prefix_logits(&tokens)?.into_iter();

            let mut positions = Vec::with_capacity(row_ids.len());
            for m in row_mask {
                if *m == 0 {
                    positions.push(padding.clone());
                } else {
                    match logits.next() {
                        Some(t) => positions.push(t),
                        None => candle_core::bail!("fewer logits than unmasked tokens"),
                    }
                }
            }
            rows.push(Tensor::stack(&positions, 0)?);
        }
        Tensor::stack(&rows, 0)
    }
}

/// Quantized Llama-family weights from a GGUF file.
pub struct GgufLlama {
    weights: ModelWeights,
}

impl StepModel for GgufLlama {
    fn step(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        self.weights.forward(input, index_pos)
    }

    fn reset(&mut self) -> candle_core::Result<()> {
        // the cache is overwritten whenever a step starts at position zero
        Ok(())
    }
}

impl GgufLlama {
    /// Returns the model plus the vocabulary size and EOS id recorded in the
    /// file, when present.
    pub fn load(path: &Path, device: &Device) -> anyhow::Result<(Self, Option<usize>, Option<TokenId>)> {
        let mut file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let content = gguf_file::Content::read(&mut file).with_context(|| format!("reading GGUF header of {}", path.display()))?;

        let vocab_size = content
            .metadata
            .get("tokenizer.ggml.tokens")
            .and_then(|v| v.to_vec().ok())
            .map(Vec::len)
            .or_else(|| {
                content
                    .metadata
                    .get("llama.vocab_size")
                    .and_then(|v| v.to_u32().ok())
                    .map(|v| v as usize)
            });
        let eos = content
            .metadata
            .get("tokenizer.ggml.eos_token_id")
            .and_then(|v| v.to_u32().ok());

        let weights = ModelWeights::from_gguf(content, &mut file, device)?;
        Ok((Self { weights }, vocab_size, eos))
    }
}

/// Plain (unquantized) Llama checkpoint in safetensors format.
pub struct SafetensorsLlama {
    model: Llama,
    config: Config,
    cache: Cache,
    dtype: DType,
    device: Device,
}

impl StepModel for SafetensorsLlama {
    fn step(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        let logits = self.model.forward(input, index_pos, &mut self.cache)?;
        match logits.rank() {
            3 => logits.i((.., logits.dim(1)? - 1, ..)),
            _ => Ok(logits),
        }
    }

    fn reset(&mut self) -> candle_core::Result<()> {
        self.cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        Ok(())
    }
}

impl SafetensorsLlama {
    pub fn load(files: &CheckpointFiles, dtype: DType, device: &Device) -> anyhow::Result<Self> {
        let raw = std::fs::read(&files.config).with_context(|| format!("reading {}", files.config.display()))?;
        let llama_config: LlamaConfig = serde_json::from_slice(&raw)?;
        let config = llama_config.into_config(false);

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
        let model = Llama::load(vb, &config)?;
        let cache = Cache::new(true, dtype, &config, device)?;
        Ok(Self {
            model,
            config,
            cache,
            dtype,
            device: device.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}

/// `config.json` plus the safetensors shards of a checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl CheckpointFiles {
    pub fn from_dir(dir: &Path) -> anyhow::Result<Self> {
        let config = dir.join("config.json");
        if !config.exists() {
            bail!("no config.json in {}", dir.display());
        }
        let single = dir.join("model.safetensors");
        if single.exists() {
            return Ok(Self { config, weights: vec![single] });
        }
        let index = dir.join("model.safetensors.index.json");
        if index.exists() {
            let weights = shard_names(&std::fs::read(&index)?)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect();
            return Ok(Self { config, weights });
        }
        bail!("no safetensors weights in {}", dir.display())
    }

    pub fn from_hub(repo: &str) -> anyhow::Result<Self> {
        let api = hf_hub::api::sync::Api::new()?.model(repo.to_string());
        let config = api.get("config.json")?;
        let weights = match api.get("model.safetensors") {
            Ok(single) => vec![single],
            Err(_) => {
                let index = api.get("model.safetensors.index.json")?;
                shard_names(&std::fs::read(index)?)?
                    .into_iter()
                    .map(|name| api.get(&name))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(Self { config, weights })
    }
}

fn shard_names(index: &[u8]) -> anyhow::Result<BTreeSet<String>> {
    let index: serde_json::Value = serde_json::from_slice(index)?;
    let map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .context("safetensors index has no weight_map")?;
    Ok(map.values().filter_map(|v| v.as_str().map(String::from)).collect())
}

/// `device` option: `cpu`, `cuda`, `metal`, or `auto` (default, best available).
pub fn select_device(options: &ModelOptions) -> anyhow::Result<Device> {
    let device = match options.get_str("device").unwrap_or("auto") {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        "auto" if candle_core::utils::cuda_is_available() => Device::new_cuda(0)?,
        "auto" if candle_core::utils::metal_is_available() => Device::new_metal(0)?,
        "auto" => Device::Cpu,
        other => bail!("unknown device '{other}'"),
    };
    Ok(device)
}

/// `dtype` option; defaults to f32 on CPU and f16 elsewhere.
pub fn select_dtype(options: &ModelOptions, device: &Device) -> anyhow::Result<DType> {
    let dtype = match options.get_str("dtype") {
        Some("f32") => DType::F32,
        Some("f16") => DType::F16,
        Some("bf16") => DType::BF16,
        Some(other) => bail!("unsupported dtype '{other}'"),
        None if device.is_cpu() => DType::F32,
        None => DType::F16,
    };
    Ok(dtype)
}

fn announce(spec: &BackendSpec, what: &str) {
    if spec.options.is_truthy("silent") {
        tracing::debug!(kind = %spec.kind, model = %spec.model, "loading {what}");
    } else {
        tracing::info!(kind = %spec.kind, model = %spec.model, "loading {what}");
    }
}

pub(crate) fn register(registry: &BackendRegistry) {
    registry.register_causal_lm(LLAMA_CPP_KIND, |spec: &BackendSpec| {
        announce(spec, "quantized GGUF weights");
        let device = select_device(&spec.options)?;
        let (model, vocab, eos) = GgufLlama::load(Path::new(&spec.model), &device)?;
        let vocab = vocab.unwrap_or_else(|| spec.tokenizer.vocab_size());
        let eos = eos.unwrap_or_else(|| spec.tokenizer.eos_token());
        Ok(IncrementalLm::new(model, device, vocab, eos))
    });

    registry.register_causal_lm(DEFAULT_LOCAL_KIND, |spec: &BackendSpec| {
        announce(spec, "safetensors checkpoint");
        let device = select_device(&spec.options)?;
        let dtype = select_dtype(&spec.options, &device)?;
        let path = Path::new(&spec.model);
        let files = if path.is_dir() {
            CheckpointFiles::from_dir(path)?
        } else {
            CheckpointFiles::from_hub(&spec.model)?
        };
        let model = SafetensorsLlama::load(&files, dtype, &device)?;
        let vocab = model.vocab_size();
        Ok(IncrementalLm::new(model, device, vocab, spec.tokenizer.eos_token()))
    });
}
