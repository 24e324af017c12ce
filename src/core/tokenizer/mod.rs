pub mod byte;
pub mod huggingface;

pub use byte::ByteTokenizer;
pub use huggingface::HfTokenizer;

use crate::core::{ModelError, Result, TokenId};
use std::path::Path;
use std::sync::Arc;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;
    fn decode(&self, tokens: &[TokenId]) -> Result<String>;

    fn vocab_size(&self) -> usize;
    fn eos_token(&self) -> TokenId;

    fn token_to_id(&self, token: &str) -> Option<TokenId>;
}

/// Name of the synthetic byte-level vocabulary that needs no files.
pub const BYTES_VOCAB: &str = "bytes";

/// Where a tokenizer comes from: a built-in vocabulary, a local file, or a
/// Hugging Face hub repository id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerSource {
    Builtin(String),
    File(std::path::PathBuf),
    Hub(String),
}

impl TokenizerSource {
    pub fn parse(name: &str) -> Self {
        if name == BYTES_VOCAB {
            TokenizerSource::Builtin(name.to_string())
        } else if Path::new(name).exists() {
            TokenizerSource::File(name.into())
        } else {
            TokenizerSource::Hub(name.to_string())
        }
    }

    pub fn load(&self) -> Result<Arc<dyn Tokenizer>> {
        match self {
            TokenizerSource::Builtin(_) => Ok(Arc::new(ByteTokenizer::new())),
            TokenizerSource::File(path) => Ok(Arc::new(HfTokenizer::from_path(path)?)),
            TokenizerSource::Hub(repo) => Ok(Arc::new(HfTokenizer::from_hub(repo)?)),
        }
    }
}

pub fn load_tokenizer(name: &str) -> Result<Arc<dyn Tokenizer>> {
    let source = TokenizerSource::parse(name);
    tracing::debug!(?source, "loading tokenizer");
    source.load().map_err(|e| match e {
        ModelError::Tokenizer(msg) => ModelError::Tokenizer(format!("{name}: {msg}")),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_parse() {
        assert_eq!(TokenizerSource::parse("bytes"), TokenizerSource::Builtin("bytes".into()));
        assert_eq!(
            TokenizerSource::parse("huggyllama/llama-7b"),
            TokenizerSource::Hub("huggyllama/llama-7b".into())
        );
        let dir = std::env::temp_dir();
        assert_eq!(
            TokenizerSource::parse(dir.to_str().unwrap()),
            TokenizerSource::File(dir.clone())
        );
    }

    #[test]
    fn test_load_builtin() {
        let tokenizer = load_tokenizer("bytes").unwrap();
        assert_eq!(tokenizer.vocab_size(), 257);
    }
}
