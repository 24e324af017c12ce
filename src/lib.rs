pub mod app;
pub mod core;
pub mod envconfig;
pub mod infra;

pub use app::{
    get_default_model, model, set_default_model, AdapterKind, DefaultModel, GenerateOptions, Llm, ModelAdapter,
    ModelDescriptor, Resolver, ScoringResult,
};
pub use crate::core::{
    BiasSet, GenerationBackend, GenerationRequest, GenerationResult, ModelError, ModelOptions, ResolutionWarning,
    Result, StreamEvent, TokenId, TokenStreamer, Tokenizer,
};
pub use envconfig::EnvConfig;
