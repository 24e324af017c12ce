use crate::core::generation::{CausalLm, GenerationBackend, LocalBackend};
use crate::core::{ModelError, ModelOptions, Result, Tokenizer};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub const RANDOM_KIND: &str = "random";
pub const LLAMA_CPP_KIND: &str = "llama.cpp";
pub const DEFAULT_LOCAL_KIND: &str = "candle";

/// Everything a backend constructor gets to see.
#[derive(Clone)]
pub struct BackendSpec {
    pub kind: String,
    pub model: String,
    pub options: ModelOptions,
    pub tokenizer: Arc<dyn Tokenizer>,
}

pub type BackendCreator =
    Arc<dyn Fn(&BackendSpec) -> anyhow::Result<Arc<dyn GenerationBackend>> + Send + Sync>;

/// Maps a backend kind name to its constructor. Registering a kind again
/// replaces the previous constructor.
pub struct BackendRegistry {
    creators: RwLock<HashMap<String, BackendCreator>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            creators: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        super::synthetic::register(&registry);
        super::weights::register(&registry);
        registry
    }

    pub fn register<N, F>(&self, kind: N, creator: F)
    where
        N: Into<String>,
        F: Fn(&BackendSpec) -> anyhow::Result<Arc<dyn GenerationBackend>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "registering backend");
        self.creators.write().insert(kind, Arc::new(creator));
    }

    /// Registers a kind backed by a [`CausalLm`] loader; decoding, bias and
    /// streaming come from [`LocalBackend`].
    pub fn register_causal_lm<N, M, F>(&self, kind: N, loader: F)
    where
        N: Into<String>,
        M: CausalLm + 'static,
        F: Fn(&BackendSpec) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        self.register(kind, move |spec: &BackendSpec| {
            let model = loader(spec)?;
            let mut backend = LocalBackend::new(spec.model.clone(), model);
            if let Some(seed) = spec.options.get_u64("seed") {
                backend = backend.with_seed(seed);
            }
            if let Some(rows) = spec.options.get_u64("batch_size") {
                backend = backend.with_max_batch_size(rows as usize);
            }
            Ok(Arc::new(backend) as Arc<dyn GenerationBackend>)
        });
    }

    pub fn get(&self, kind: &str) -> Option<BackendCreator> {
        self.creators.read().get(kind).map(Arc::clone)
    }

    pub fn create(&self, spec: &BackendSpec) -> Result<Arc<dyn GenerationBackend>> {
        let creator = self.get(&spec.kind).ok_or_else(|| {
            ModelError::construction(
                spec.kind.clone(),
                anyhow::anyhow!(
                    "no backend registered for kind '{}' (available: {})",
                    spec.kind,
                    self.kinds().join(", ")
                ),
            )
        })?;

        tracing::info!(kind = %spec.kind, model = %spec.model, "constructing generation backend");
        creator(spec).map_err(|e| ModelError::construction(spec.kind.clone(), e))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.creators.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub static REGISTRY: once_cell::sync::Lazy<Arc<BackendRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(BackendRegistry::with_builtins()));

pub fn register<N, F>(kind: N, creator: F)
where
    N: Into<String>,
    F: Fn(&BackendSpec) -> anyhow::Result<Arc<dyn GenerationBackend>> + Send + Sync + 'static,
{
    REGISTRY.register(kind, creator);
}

/// Backend kind implied by an in-process model identifier, and the model name
/// handed to that kind's constructor.
///
/// An explicit `backend` option wins. Otherwise the `loader` option picks
/// between quantized (`llama.cpp`) and plain (`candle`) weights, and a bare
/// `.gguf` path implies the quantized loader.
pub fn backend_kind(identifier: &str, options: &ModelOptions) -> (String, String) {
    if identifier == RANDOM_KIND {
        return (RANDOM_KIND.to_string(), identifier.to_string());
    }
    if let Some(path) = identifier.strip_prefix("llama.cpp:") {
        return (LLAMA_CPP_KIND.to_string(), path.to_string());
    }
    if let Some(kind) = options.get_str("backend") {
        return (kind.to_string(), identifier.to_string());
    }
    let kind = match options.get_str("loader") {
        Some("gguf" | "quantized" | "llama.cpp" | "auto-gptq") => LLAMA_CPP_KIND,
        Some("safetensors" | "transformers" | "candle") => DEFAULT_LOCAL_KIND,
        Some(other) => other,
        None if identifier.ends_with(".gguf") => LLAMA_CPP_KIND,
        None => DEFAULT_LOCAL_KIND,
    };
    (kind.to_string(), identifier.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generation::{GenerationRequest, GenerationResult, TokenStreamer};
    use crate::core::tokenizer::ByteTokenizer;
    use crate::core::TokenId;

    struct NamedBackend(&'static str);

    impl GenerationBackend for NamedBackend {
        fn eos_token_id(&self) -> TokenId {
            0
        }

        fn vocab_size(&self) -> usize {
            self.0.len()
        }

        fn score(&self, input_ids: &[Vec<TokenId>], _attention_mask: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
            Ok(input_ids.iter().map(|r| vec![0.0; r.len()]).collect())
        }

        fn generate(
            &self,
            request: &GenerationRequest,
            _streamer: Option<&mut dyn TokenStreamer>,
        ) -> Result<GenerationResult> {
            Ok(GenerationResult {
                sequences: request.input_ids.clone(),
                scores: vec![],
            })
        }
    }

    fn spec(kind: &str) -> BackendSpec {
        BackendSpec {
            kind: kind.to_string(),
            model: "m".to_string(),
            options: ModelOptions::new(),
            tokenizer: Arc::new(ByteTokenizer::new()),
        }
    }

    #[test]
    fn test_registry() {
        let registry = BackendRegistry::new();
        registry.register("test", |_spec: &BackendSpec| {
            Ok(Arc::new(NamedBackend("first")) as Arc<dyn GenerationBackend>)
        });

        assert!(registry.get("test").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.create(&spec("test")).unwrap().vocab_size(), 5);
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = BackendRegistry::new();
        registry.register("test", |_spec: &BackendSpec| {
            Ok(Arc::new(NamedBackend("first")) as Arc<dyn GenerationBackend>)
        });
        registry.register("test", |_spec: &BackendSpec| {
            Ok(Arc::new(NamedBackend("second!")) as Arc<dyn GenerationBackend>)
        });
        assert_eq!(registry.kinds(), vec!["test".to_string()]);
        assert_eq!(registry.create(&spec("test")).unwrap().vocab_size(), 7);
    }

    #[test]
    fn test_unknown_kind_is_construction_error() {
        let registry = BackendRegistry::with_builtins();
        let err = registry.create(&spec("onnx")).err().unwrap();
        assert!(matches!(err, ModelError::BackendConstruction { ref kind, .. } if kind == "onnx"));
    }

    #[test]
    fn test_builtin_kinds() {
        let kinds = BackendRegistry::with_builtins().kinds();
        assert_eq!(kinds, vec!["candle".to_string(), "llama.cpp".to_string(), "random".to_string()]);
    }

    #[test]
    fn test_batch_size_option_reaches_backend() {
        use crate::core::model::RandomLm;

        let registry = BackendRegistry::new();
        registry.register_causal_lm("rows", |_spec: &BackendSpec| Ok(RandomLm::new(16, 0, 1)));
        let mut limited = spec("rows");
        limited.options = ModelOptions::new().with("batch_size", 1);
        let limited = registry.create(&limited).unwrap();
        let whole = registry.create(&spec("rows")).unwrap();

        let ids = vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]];
        let mask = vec![vec![1, 1, 1]; 3];
        assert_eq!(limited.score(&ids, &mask).unwrap(), whole.score(&ids, &mask).unwrap());
    }

    #[test]
    fn test_failing_creator_is_wrapped() {
        let registry = BackendRegistry::new();
        registry.register("broken", |_spec: &BackendSpec| -> anyhow::Result<Arc<dyn GenerationBackend>> {
            anyhow::bail!("weights missing")
        });
        let err = registry.create(&spec("broken")).err().unwrap();
        assert!(matches!(err, ModelError::BackendConstruction { .. }));
    }

    #[test]
    fn test_backend_kind() {
        let options = ModelOptions::new();
        assert_eq!(backend_kind("random", &options), ("random".into(), "random".into()));
        assert_eq!(
            backend_kind("llama.cpp:/m/w.bin", &options),
            ("llama.cpp".into(), "/m/w.bin".into())
        );
        assert_eq!(backend_kind("gpt2", &options), ("candle".into(), "gpt2".into()));
        let options = ModelOptions::new().with("backend", "onnx");
        assert_eq!(backend_kind("gpt2", &options), ("onnx".into(), "gpt2".into()));
    }

    #[test]
    fn test_backend_kind_from_loader() {
        let quantized = ModelOptions::new().with("loader", "gguf");
        assert_eq!(backend_kind("/m/w.bin", &quantized), ("llama.cpp".into(), "/m/w.bin".into()));
        let gptq = ModelOptions::new().with("loader", "auto-gptq");
        assert_eq!(backend_kind("m", &gptq).0, "llama.cpp");
        let plain = ModelOptions::new().with("loader", "safetensors");
        assert_eq!(backend_kind("/m/w.gguf", &plain).0, "candle");
        let custom = ModelOptions::new().with("loader", "onnx");
        assert_eq!(backend_kind("m", &custom).0, "onnx");

        let options = ModelOptions::new();
        assert_eq!(backend_kind("/m/w.gguf", &options), ("llama.cpp".into(), "/m/w.gguf".into()));

        let both = ModelOptions::new().with("backend", "random").with("loader", "gguf");
        assert_eq!(backend_kind("m", &both).0, "random");
    }
}
