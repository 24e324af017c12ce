//! Turns a model descriptor (a name, an existing handle, or the dynamic
//! default) into a shared [`Llm`] handle.

use super::adapter::{InProcessAdapter, ModelAdapter, OpenAiAdapter, RemoteAdapter};
use super::llm::Llm;
use crate::core::model::REGISTRY;
use crate::core::{BackendRegistry, ModelError, ModelOptions, ResolutionWarning, Result};
use crate::envconfig::EnvConfig;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const DYNAMIC: &str = "<dynamic>";
pub const FALLBACK_LLAMA_TOKENIZER: &str = "huggyllama/llama-7b";
pub const RANDOM_DEFAULT_TOKENIZER: &str = "gpt2";

#[derive(Clone)]
pub enum ModelDescriptor {
    Dynamic,
    Name(String),
    Handle(Arc<Llm>),
}

impl From<&str> for ModelDescriptor {
    fn from(name: &str) -> Self {
        ModelDescriptor::Name(name.to_string())
    }
}

impl From<String> for ModelDescriptor {
    fn from(name: String) -> Self {
        ModelDescriptor::Name(name)
    }
}

impl From<Arc<Llm>> for ModelDescriptor {
    fn from(handle: Arc<Llm>) -> Self {
        ModelDescriptor::Handle(handle)
    }
}

impl From<&Arc<Llm>> for ModelDescriptor {
    fn from(handle: &Arc<Llm>) -> Self {
        ModelDescriptor::Handle(Arc::clone(handle))
    }
}

/// What the dynamic default currently points at.
#[derive(Clone)]
pub enum DefaultModel {
    Name(String),
    Handle(Arc<Llm>),
}

impl From<&str> for DefaultModel {
    fn from(name: &str) -> Self {
        DefaultModel::Name(name.to_string())
    }
}

impl From<String> for DefaultModel {
    fn from(name: String) -> Self {
        DefaultModel::Name(name)
    }
}

impl From<Arc<Llm>> for DefaultModel {
    fn from(handle: Arc<Llm>) -> Self {
        DefaultModel::Handle(handle)
    }
}

impl std::fmt::Debug for DefaultModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultModel::Name(name) => f.debug_tuple("Name").field(name).finish(),
            DefaultModel::Handle(handle) => f.debug_tuple("Handle").field(&handle.to_string()).finish(),
        }
    }
}

pub struct DefaultModelCell {
    value: RwLock<DefaultModel>,
}

impl DefaultModelCell {
    pub fn new(initial: impl Into<DefaultModel>) -> Self {
        Self {
            value: RwLock::new(initial.into()),
        }
    }

    pub fn from_env(env: &EnvConfig) -> Self {
        Self::new(env.initial_default_model())
    }

    pub fn get(&self) -> DefaultModel {
        self.value.read().clone()
    }

    pub fn set(&self, model: impl Into<DefaultModel>) {
        let model = model.into();
        tracing::debug!(?model, "default model changed");
        *self.value.write() = model;
    }

    pub fn reset(&self, env: &EnvConfig) {
        self.set(env.initial_default_model());
    }
}

pub static DEFAULT_MODEL: Lazy<Arc<DefaultModelCell>> =
    Lazy::new(|| Arc::new(DefaultModelCell::from_env(&EnvConfig::from_env())));

pub fn get_default_model() -> DefaultModel {
    DEFAULT_MODEL.get()
}

pub fn set_default_model(model: impl Into<DefaultModel>) {
    DEFAULT_MODEL.set(model)
}

/// Short names for hosted models.
#[derive(Debug, Clone)]
pub struct AliasTable {
    aliases: HashMap<String, String>,
}

impl AliasTable {
    pub fn empty() -> Self {
        Self {
            aliases: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for name in [
            "gpt-4",
            "gpt-3.5-turbo",
            "gpt-3.5-turbo-instruct",
            "text-davinci-003",
        ] {
            table.aliases.insert(name.to_string(), format!("openai/{name}"));
        }
        table
            .aliases
            .insert("chatgpt".to_string(), "openai/gpt-3.5-turbo".to_string());
        table
    }

    pub fn insert(&mut self, alias: impl Into<String>, target: impl Into<String>) -> Result<()> {
        let alias = alias.into();
        let target = target.into();
        let reason = if alias.trim().is_empty() {
            Some("alias is empty")
        } else if target.trim().is_empty() {
            Some("target is empty")
        } else if alias == target {
            Some("alias refers to itself")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ModelError::AliasResolution {
                alias,
                reason: reason.to_string(),
            });
        }
        self.aliases.insert(alias, target);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.aliases.get(name).map(String::as_str)
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::builtin()
    }
}

pub struct Resolver {
    defaults: Arc<DefaultModelCell>,
    aliases: AliasTable,
    registry: Arc<BackendRegistry>,
    env: EnvConfig,
}

impl Resolver {
    pub fn new(
        defaults: Arc<DefaultModelCell>,
        aliases: AliasTable,
        registry: Arc<BackendRegistry>,
        env: EnvConfig,
    ) -> Self {
        Self {
            defaults,
            aliases,
            registry,
            env,
        }
    }

    /// Resolver over the process-wide default model, built-in aliases and
    /// backend registry.
    pub fn global() -> Self {
        Self::new(
            DEFAULT_MODEL.clone(),
            AliasTable::builtin(),
            REGISTRY.clone(),
            EnvConfig::from_env(),
        )
    }

    pub fn defaults(&self) -> &DefaultModelCell {
        &self.defaults
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn resolve(&self, descriptor: impl Into<ModelDescriptor>, options: ModelOptions) -> Result<Arc<Llm>> {
        let name = match descriptor.into() {
            ModelDescriptor::Handle(handle) => return Ok(handle),
            ModelDescriptor::Name(name) if name != DYNAMIC => name,
            ModelDescriptor::Name(_) | ModelDescriptor::Dynamic => match self.defaults.get() {
                DefaultModel::Handle(handle) => return Ok(handle),
                DefaultModel::Name(name) if name == DYNAMIC => {
                    return Err(ModelError::InvalidDescriptor(format!(
                        "the default model cannot itself be '{DYNAMIC}'"
                    )))
                }
                DefaultModel::Name(name) => name,
            },
        };

        if name.trim().is_empty() {
            return Err(ModelError::InvalidDescriptor("model identifier is empty".to_string()));
        }

        let identifier = self.aliases.resolve(&name).unwrap_or(name.as_str()).to_string();
        let configuration = options.render();
        let mut options = options;
        let endpoint = options.pop("endpoint").map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        });

        tracing::debug!(model = %name, identifier = %identifier, options = %configuration, "resolving model");

        let mut warnings = Vec::new();
        let adapter: Arc<dyn ModelAdapter> = if let Some(hosted) = identifier.strip_prefix("openai/") {
            Arc::new(OpenAiAdapter::new(hosted, endpoint, options, self.env.clone()))
        } else {
            let mut identifier = identifier.as_str();

            if identifier == "random" {
                let vocab = options
                    .get("vocab")
                    .cloned()
                    .unwrap_or_else(|| Value::from(RANDOM_DEFAULT_TOKENIZER));
                options.insert("tokenizer", vocab);
                options.insert("inprocess", true);
                options.insert("async_transport", true);
            }

            if let Some(weights) = identifier.strip_prefix("llama.cpp:") {
                if !options.contains_key("tokenizer") {
                    let expected = Path::new(weights)
                        .parent()
                        .unwrap_or_else(|| Path::new(""))
                        .join("tokenizer.model");
                    if expected.exists() {
                        options.insert("tokenizer", expected.to_string_lossy().into_owned());
                    } else {
                        let warning = ResolutionWarning::TokenizerFallback {
                            expected: expected.to_string_lossy().into_owned(),
                            fallback: FALLBACK_LLAMA_TOKENIZER.to_string(),
                        };
                        tracing::warn!("{warning}");
                        warnings.push(warning);
                        options.insert("tokenizer", FALLBACK_LLAMA_TOKENIZER);
                    }
                }
            }

            let endpoint = endpoint.unwrap_or_else(|| self.env.remote_endpoint.clone());

            if let Some(local) = identifier.strip_prefix("local:") {
                identifier = local;
                options.insert("inprocess", true);
            }

            if options.is_truthy("inprocess") {
                Arc::new(InProcessAdapter::new(identifier, options, self.registry.clone()))
            } else {
                Arc::new(RemoteAdapter::new(identifier, endpoint, options, self.env.clone()))
            }
        };

        tracing::info!(model = %name, kind = %adapter.kind(), "resolved model");
        Ok(Arc::new(Llm::new(name, configuration, adapter).with_warnings(warnings)))
    }
}

/// Resolves `descriptor` with the process-wide resolver.
pub fn model(descriptor: impl Into<ModelDescriptor>, options: ModelOptions) -> Result<Arc<Llm>> {
    Resolver::global().resolve(descriptor, options)
}
