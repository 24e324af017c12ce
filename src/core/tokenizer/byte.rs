use super::Tokenizer;
use crate::core::{Result, TokenId};

const EOS_TEXT: &str = "<|endoftext|>";

/// One token per byte plus a trailing end-of-text token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const EOS: TokenId = 256;

    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter_map(|&t| u8::try_from(t).ok())
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::EOS as usize + 1
    }

    fn eos_token(&self) -> TokenId {
        Self::EOS
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        if token == EOS_TEXT {
            return Some(Self::EOS);
        }
        match token.as_bytes() {
            [b] => Some(TokenId::from(*b)),
            _ => None,
        }
    }
}
