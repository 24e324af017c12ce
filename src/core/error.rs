use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid model descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid alias '{alias}': {reason}")]
    AliasResolution { alias: String, reason: String },

    #[error("failed to construct {kind} backend")]
    BackendConstruction {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("generation returned no results")]
    EmptyResult,

    #[error("synchronous entry points cannot run inside an async runtime; await the async variant instead")]
    NestedRuntime,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Generation(#[from] candle_core::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("malformed backend response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ModelError {
    pub fn construction(kind: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ModelError::BackendConstruction {
            kind: kind.into(),
            source: source.into(),
        }
    }

    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        ModelError::Tokenizer(err.to_string())
    }
}

/// Non-fatal conditions noticed while resolving a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionWarning {
    /// No `tokenizer.model` next to llama.cpp weights; a default tokenizer was substituted.
    TokenizerFallback { expected: String, fallback: String },
}

impl std::fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionWarning::TokenizerFallback { expected, fallback } => write!(
                f,
                "{expected} not found next to the model weights, using default '{fallback}' tokenizer; \
                 set the 'tokenizer' option to override"
            ),
        }
    }
}
