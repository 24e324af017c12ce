pub mod error;
pub mod generation;
pub mod model;
pub mod options;
pub mod tokenizer;

pub use error::{ModelError, ResolutionWarning};
pub use generation::{
    BiasSet, BiasTensorBuilder, CausalLm, DenseBiasBuilder, GenerationBackend, GenerationRequest,
    GenerationResult, LocalBackend, StreamEvent, TokenStreamer,
};
pub use model::{BackendRegistry, BackendSpec};
pub use options::ModelOptions;
pub use tokenizer::{load_tokenizer, Tokenizer, TokenizerSource};

pub type TokenId = u32;

pub type Result<T> = std::result::Result<T, ModelError>;
