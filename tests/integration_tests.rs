use candle_core::{Device, Tensor};
use modelkit::core::model::BackendSpec;
use modelkit::core::{BackendRegistry, CausalLm, ModelError, ModelOptions, TokenId};
use modelkit::app::{AliasTable, DefaultModelCell, Resolver};
use modelkit::{AdapterKind, EnvConfig, GenerateOptions, StreamEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn resolver() -> Resolver {
    let mut env = EnvConfig::from_env();
    env.remote_endpoint = "localhost:8080".to_string();
    Resolver::new(
        Arc::new(DefaultModelCell::new("openai/gpt-3.5-turbo-instruct")),
        AliasTable::builtin(),
        Arc::new(BackendRegistry::with_builtins()),
        env,
    )
}

/// Emits `script[step]` after a prompt of `prompt_len` tokens, then end-of-text.
struct ScriptLm {
    device: Device,
    script: Vec<TokenId>,
    prompt_len: usize,
}

impl CausalLm for ScriptLm {
    fn device(&self) -> &Device {
        &self.device
    }

    fn vocab_size(&self) -> usize {
        257
    }

    fn eos_token_id(&self) -> TokenId {
        256
    }

    fn forward(&mut self, input_ids: &Tensor, _attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let step = seq.saturating_sub(self.prompt_len);
        let target = self.script.get(step).copied().unwrap_or(256) as usize;
        let mut data = vec![0.0f32; batch * seq * 257];
        for row in 0..batch * seq {
            data[row * 257 + target] = 10.0;
        }
        Tensor::from_vec(data, (batch, seq, 257), &self.device)
    }
}

mod test_resolution {
    use super::*;

    #[test]
    fn test_handle_is_returned_unchanged() {
        let resolver = resolver();
        let handle = resolver.resolve("local:gpt2", ModelOptions::new()).unwrap();
        let again = resolver.resolve(&handle, ModelOptions::new().with("cuda", true)).unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
    }

    #[test]
    fn test_openai_prefix_skips_local_rules() {
        let options = ModelOptions::new()
            .with("vocab", "bytes")
            .with("inprocess", true)
            .with("tokenizer", "bytes");
        let handle = resolver().resolve("openai/random", options).unwrap();
        assert_eq!(handle.adapter().kind(), AdapterKind::HostedApi);
        assert_eq!(handle.adapter().model_name(), "random");
        assert!(!handle.adapter().options().contains_key("async_transport"));
    }

    #[test]
    fn test_local_prefix_forces_inprocess() {
        let handle = resolver()
            .resolve("local:foo", ModelOptions::new().with("inprocess", false))
            .unwrap();
        assert_eq!(handle.adapter().model_name(), "foo");
        assert_eq!(handle.adapter().kind(), AdapterKind::InProcess);
        assert!(handle.adapter().options().is_truthy("inprocess"));
        assert_eq!(handle.configuration_string(), "inprocess=false");

        let bare = resolver().resolve("local:foo", ModelOptions::new()).unwrap();
        assert_eq!(bare.configuration_string(), "");
    }

    #[test]
    fn test_hosted_model_without_endpoint() {
        let options = ModelOptions::new().with("endpoint", serde_json::Value::Null);
        let handle = resolver().resolve("openai/gpt-3.5-turbo-instruct", options).unwrap();
        assert_eq!(handle.adapter().kind(), AdapterKind::HostedApi);
        assert_eq!(handle.adapter().model_name(), "gpt-3.5-turbo-instruct");
        assert_eq!(handle.adapter().endpoint(), None);
        assert_eq!(handle.configuration_string(), "");
        assert_eq!(handle.to_string(), "Llm(openai/gpt-3.5-turbo-instruct, )");
    }

    #[test]
    fn test_llama_cpp_tokenizer_fallback() {
        let weights = format!("/nonexistent-{}/x/weights.bin", uuid::Uuid::new_v4());
        let handle = resolver()
            .resolve(format!("llama.cpp:{weights}"), ModelOptions::new())
            .unwrap();
        assert_eq!(handle.warnings().len(), 1);
        assert_eq!(handle.adapter().options().get_str("tokenizer"), Some("huggyllama/llama-7b"));
        assert_eq!(handle.adapter().kind(), AdapterKind::Remote);
        assert_eq!(handle.adapter().endpoint(), Some("localhost:8080"));
    }

    #[test]
    fn test_llama_cpp_tokenizer_next_to_weights() {
        let dir = std::env::temp_dir().join(format!("modelkit-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tokenizer.model"), b"").unwrap();

        let weights = dir.join("weights.bin");
        let handle = resolver()
            .resolve(format!("llama.cpp:{}", weights.display()), ModelOptions::new().with("inprocess", true))
            .unwrap();
        assert!(handle.warnings().is_empty());
        let expected = dir.join("tokenizer.model").to_string_lossy().into_owned();
        assert_eq!(handle.adapter().options().get_str("tokenizer"), Some(expected.as_str()));
        assert_eq!(handle.adapter().kind(), AdapterKind::InProcess);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_explicit_tokenizer_skips_heuristic() {
        let handle = resolver()
            .resolve("llama.cpp:/models/x/weights.bin", ModelOptions::new().with("tokenizer", "bytes"))
            .unwrap();
        assert!(handle.warnings().is_empty());
        assert_eq!(handle.adapter().options().get_str("tokenizer"), Some("bytes"));
    }

    #[test]
    fn test_process_wide_model_function() {
        let handle = modelkit::model("random", ModelOptions::new().with("vocab", "bytes")).unwrap();
        assert_eq!(handle.adapter().kind(), AdapterKind::Synthetic);
        assert_eq!(handle.to_string(), "Llm(random, vocab=bytes)");
    }
}

mod test_generation {
    use super::*;

    fn random_options(seed: u64) -> ModelOptions {
        ModelOptions::new().with("vocab", "bytes").with("seed", seed)
    }

    #[tokio::test]
    async fn test_random_model_generate_and_score() {
        let llm = resolver().resolve("random", random_options(11)).unwrap();
        let text = llm
            .generate("Hello", GenerateOptions::default().max_tokens(8))
            .await
            .unwrap();
        let again = llm
            .generate("Hello", GenerateOptions::default().max_tokens(8))
            .await
            .unwrap();
        assert_eq!(text, again);

        let scored = llm.score("Hello", &[" world", " there"]).await.unwrap();
        assert_eq!(scored.len(), 2);
        assert!(scored.logprobs().iter().all(|lp| lp.is_finite() && *lp < 0.0));
    }

    #[tokio::test]
    async fn test_empty_prompt_is_invalid_request() {
        let llm = resolver().resolve("random", random_options(3)).unwrap();
        let err = llm
            .generate("", GenerateOptions::default().max_tokens(4))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_streaming_does_not_change_output() {
        let llm = resolver().resolve("random", random_options(5)).unwrap();
        let plain = llm
            .generate("abc", GenerateOptions::default().max_tokens(6))
            .await
            .unwrap();

        let steps = Arc::new(Mutex::new(Vec::new()));
        let seen = steps.clone();
        let streamer = move |event: &StreamEvent<'_>| {
            seen.lock().unwrap().push(event.step);
        };
        let streamed = llm
            .generate_streaming("abc", GenerateOptions::default().max_tokens(6), Box::new(streamer))
            .await
            .unwrap();

        assert_eq!(plain, streamed);
        let steps = steps.lock().unwrap();
        assert!(!steps.is_empty() && steps.len() <= 6);
        assert!(steps.windows(2).all(|w| w[0] + 1 == w[1]));
    }

    #[tokio::test]
    async fn test_early_end_of_text() {
        let registry = Arc::new(BackendRegistry::with_builtins());
        registry.register_causal_lm("scripted", |_spec: &BackendSpec| {
            Ok(ScriptLm {
                device: Device::Cpu,
                script: vec![b'o' as TokenId, b'k' as TokenId, 256, b'x' as TokenId, b'x' as TokenId],
                prompt_len: 3,
            })
        });
        let resolver = Resolver::new(
            Arc::new(DefaultModelCell::new("random")),
            AliasTable::builtin(),
            registry,
            EnvConfig::from_env(),
        );
        let llm = resolver
            .resolve(
                "local:scripted-model",
                ModelOptions::new().with("backend", "scripted").with("tokenizer", "bytes"),
            )
            .unwrap();

        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let streamer = move |_: &StreamEvent<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        let text = llm
            .generate_streaming("xyz", GenerateOptions::default().max_tokens(5), Box::new(streamer))
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sync_entry_points_reject_nesting() {
        let llm = resolver().resolve("random", random_options(1)).unwrap();
        assert!(matches!(
            llm.generate_sync("hi", GenerateOptions::default()),
            Err(ModelError::NestedRuntime)
        ));
        assert!(matches!(llm.score_sync("hi", &["a"]), Err(ModelError::NestedRuntime)));
    }

    #[tokio::test]
    async fn test_construction_failure_is_retried() {
        let registry = Arc::new(BackendRegistry::with_builtins());
        let resolver = Resolver::new(
            Arc::new(DefaultModelCell::new("random")),
            AliasTable::builtin(),
            registry.clone(),
            EnvConfig::from_env(),
        );
        let llm = resolver
            .resolve("local:late", ModelOptions::new().with("backend", "late").with("tokenizer", "bytes"))
            .unwrap();

        let err = llm
            .generate("a", GenerateOptions::default().max_tokens(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::BackendConstruction { ref kind, .. } if kind == "late"));

        registry.register_causal_lm("late", |_spec: &BackendSpec| {
            Ok(ScriptLm {
                device: Device::Cpu,
                script: vec![b'!' as TokenId],
                prompt_len: 1,
            })
        });
        let text = llm
            .generate("a", GenerateOptions::default().max_tokens(2))
            .await
            .unwrap();
        assert_eq!(text, "!");
    }
}
