//! Adapters own a model's tokenizer and generation backend and build both on
//! first use.

use crate::core::model::{backend_kind, RANDOM_KIND};
use crate::core::{
    load_tokenizer, BackendRegistry, BackendSpec, GenerationBackend, ModelError, ModelOptions, Result, TokenId,
    Tokenizer,
};
use crate::envconfig::EnvConfig;
use crate::infra::{OpenAiBackend, RemoteBackend};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    HostedApi,
    InProcess,
    Remote,
    Synthetic,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AdapterKind::HostedApi => "hosted",
            AdapterKind::InProcess => "inprocess",
            AdapterKind::Remote => "remote",
            AdapterKind::Synthetic => "synthetic",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;
    fn model_name(&self) -> &str;
    fn options(&self) -> &ModelOptions;

    fn endpoint(&self) -> Option<&str> {
        None
    }

    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>>;

    /// Builds the backend on first call; later calls share it. A failed build
    /// is reported to the caller and attempted again next time.
    fn generation_backend(&self) -> Result<Arc<dyn GenerationBackend>>;

    async fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        self.tokenizer()?.encode(text)
    }

    async fn detokenize(&self, ids: &[TokenId]) -> Result<String> {
        self.tokenizer()?.decode(ids)
    }
}

/// A backend slot filled at most once. Concurrent first callers wait for a
/// single construction; a failure leaves the slot empty.
#[derive(Default)]
pub struct LazyBackend {
    cell: OnceCell<Arc<dyn GenerationBackend>>,
}

impl LazyBackend {
    pub fn new() -> Self {
        Self { cell: OnceCell::new() }
    }

    pub fn get_or_try_init<F>(&self, kind: &str, init: F) -> Result<Arc<dyn GenerationBackend>>
    where
        F: FnOnce() -> Result<Arc<dyn GenerationBackend>>,
    {
        self.cell
            .get_or_try_init(|| {
                init().map_err(|e| match e {
                    err @ ModelError::BackendConstruction { .. } => err,
                    other => ModelError::construction(kind, other),
                })
            })
            .map(Arc::clone)
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

fn lazy_tokenizer(cell: &OnceCell<Arc<dyn Tokenizer>>, name: &str) -> Result<Arc<dyn Tokenizer>> {
    cell.get_or_try_init(|| load_tokenizer(name)).map(Arc::clone)
}

fn timeout(options: &ModelOptions, env: &EnvConfig) -> Duration {
    Duration::from_secs(options.get_u64("timeout").unwrap_or(env.timeout))
}

/// Runs a model inside this process through a registered backend kind.
pub struct InProcessAdapter {
    model: String,
    options: ModelOptions,
    registry: Arc<BackendRegistry>,
    tokenizer: OnceCell<Arc<dyn Tokenizer>>,
    backend: LazyBackend,
}

impl InProcessAdapter {
    pub fn new(model: impl Into<String>, options: ModelOptions, registry: Arc<BackendRegistry>) -> Self {
        Self {
            model: model.into(),
            options,
            registry,
            tokenizer: OnceCell::new(),
            backend: LazyBackend::new(),
        }
    }

    pub fn backend_kind(&self) -> String {
        backend_kind(&self.model, &self.options).0
    }

    fn tokenizer_name(&self) -> &str {
        self.options.get_str("tokenizer").unwrap_or(&self.model)
    }
}

#[async_trait]
impl ModelAdapter for InProcessAdapter {
    fn kind(&self) -> AdapterKind {
        if self.model == RANDOM_KIND {
            AdapterKind::Synthetic
        } else {
            AdapterKind::InProcess
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn options(&self) -> &ModelOptions {
        &self.options
    }

    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        lazy_tokenizer(&self.tokenizer, self.tokenizer_name())
    }

    fn generation_backend(&self) -> Result<Arc<dyn GenerationBackend>> {
        let (kind, model) = backend_kind(&self.model, &self.options);
        self.backend.get_or_try_init(&kind, || {
            let spec = BackendSpec {
                kind: kind.clone(),
                model,
                options: self.options.clone(),
                tokenizer: self.tokenizer()?,
            };
            self.registry.create(&spec)
        })
    }
}

/// Talks to a model served by a separate process at `endpoint`.
pub struct RemoteAdapter {
    model: String,
    endpoint: String,
    options: ModelOptions,
    env: EnvConfig,
    tokenizer: OnceCell<Arc<dyn Tokenizer>>,
    backend: LazyBackend,
}

impl RemoteAdapter {
    pub fn new(model: impl Into<String>, endpoint: impl Into<String>, options: ModelOptions, env: EnvConfig) -> Self {
        Self {
            model: model.into(),
            endpoint: endpoint.into(),
            options,
            env,
            tokenizer: OnceCell::new(),
            backend: LazyBackend::new(),
        }
    }
}

#[async_trait]
impl ModelAdapter for RemoteAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Remote
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn options(&self) -> &ModelOptions {
        &self.options
    }

    fn endpoint(&self) -> Option<&str> {
        Some(&self.endpoint)
    }

    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        lazy_tokenizer(&self.tokenizer, self.options.get_str("tokenizer").unwrap_or(&self.model))
    }

    fn generation_backend(&self) -> Result<Arc<dyn GenerationBackend>> {
        self.backend.get_or_try_init("remote", || {
            tracing::info!(model = %self.model, endpoint = %self.endpoint, "connecting to model service");
            let backend = RemoteBackend::new(
                self.model.clone(),
                &self.endpoint,
                self.options.clone(),
                self.tokenizer()?,
                timeout(&self.options, &self.env),
            )
            .map_err(|e| ModelError::construction("remote", e))?;
            Ok(Arc::new(backend) as Arc<dyn GenerationBackend>)
        })
    }
}

/// Hosted completion models addressed as `openai/<name>`.
pub struct OpenAiAdapter {
    model: String,
    endpoint: Option<String>,
    options: ModelOptions,
    env: EnvConfig,
    tokenizer: OnceCell<Arc<dyn Tokenizer>>,
    backend: LazyBackend,
}

impl OpenAiAdapter {
    pub fn new(model: impl Into<String>, endpoint: Option<String>, options: ModelOptions, env: EnvConfig) -> Self {
        Self {
            model: model.into(),
            endpoint,
            options,
            env,
            tokenizer: OnceCell::new(),
            backend: LazyBackend::new(),
        }
    }

    /// Hub repository carrying the vocabulary the hosted model was trained with.
    pub fn default_tokenizer(model: &str) -> &'static str {
        if model.starts_with("gpt-4") || model.starts_with("gpt-3.5") {
            "Xenova/gpt-4"
        } else if model.starts_with("text-davinci") || model.starts_with("code-") {
            "Xenova/text-davinci-003"
        } else {
            "gpt2"
        }
    }

    fn base_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) if endpoint.contains("://") => endpoint.clone(),
            Some(endpoint) => format!("https://{endpoint}"),
            None => self.env.openai_api_base.clone(),
        }
    }
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::HostedApi
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn options(&self) -> &ModelOptions {
        &self.options
    }

    fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        let name = self
            .options
            .get_str("tokenizer")
            .unwrap_or_else(|| Self::default_tokenizer(&self.model));
        lazy_tokenizer(&self.tokenizer, name)
    }

    fn generation_backend(&self) -> Result<Arc<dyn GenerationBackend>> {
        self.backend.get_or_try_init("openai", || {
            let api_key = self
                .options
                .get_str("api_key")
                .map(String::from)
                .or_else(|| self.env.openai_api_key.clone())
                .ok_or_else(|| {
                    ModelError::construction("openai", anyhow::anyhow!("no API key: set OPENAI_API_KEY or the 'api_key' option"))
                })?;

            tracing::info!(model = %self.model, base_url = %self.base_url(), "using hosted completion model");
            let mut backend = OpenAiBackend::new(
                self.model.clone(),
                self.base_url(),
                api_key,
                self.tokenizer()?,
                timeout(&self.options, &self.env),
            )
            .map_err(|e| ModelError::construction("openai", e))?;
            if let Some(n) = self.options.get_u64("logprobs") {
                backend = backend.with_top_logprobs(n as u32);
            }
            Ok(Arc::new(backend) as Arc<dyn GenerationBackend>)
        })
    }
}
