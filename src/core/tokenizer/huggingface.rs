use super::Tokenizer;
use crate::core::{ModelError, Result, TokenId};
use std::path::{Path, PathBuf};

const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>", "<eos>", "<|im_end|>"];

/// `tokenizer.json` tokenizers loaded through the `tokenizers` crate.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos: TokenId,
}

impl HfTokenizer {
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        let eos = EOS_CANDIDATES
            .iter()
            .find_map(|t| inner.token_to_id(t))
            .unwrap_or(0);
        Self { inner, eos }
    }

    /// SentencePiece `.model` files are not readable here; a sibling
    /// `tokenizer.json` is used in their place.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = if path.is_dir() {
            path.join("tokenizer.json")
        } else if path.extension().is_some_and(|ext| ext == "model") {
            path.with_extension("json")
        } else {
            path.to_path_buf()
        };
        if !file.exists() {
            return Err(ModelError::Tokenizer(format!(
                "no tokenizer.json available for {}",
                path.display()
            )));
        }
        let inner = tokenizers::Tokenizer::from_file(&file).map_err(ModelError::tokenizer)?;
        Ok(Self::new(inner))
    }

    pub fn from_hub(repo: &str) -> Result<Self> {
        let file: PathBuf = hf_hub::api::sync::Api::new()
            .and_then(|api| api.model(repo.to_string()).get("tokenizer.json"))
            .map_err(ModelError::tokenizer)?;
        tracing::info!(repo, path = %file.display(), "fetched tokenizer");
        Self::from_path(&file)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = self.inner.encode(text, false).map_err(ModelError::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        self.inner.decode(tokens, true).map_err(ModelError::tokenizer)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn eos_token(&self) -> TokenId {
        self.eos
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.inner.token_to_id(token)
    }
}
