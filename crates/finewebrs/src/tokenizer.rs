use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};

pub const END_OF_TEXT: &str = "<|endoftext|>";

/// What the shard writer and the trainer need from a tokenizer.
pub trait TokenEncoder: Send + Sync {
    /// Encode text without adding any special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// The id that terminates every document.
    fn eot_token(&self) -> u32;

    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// Tokenize one document for a shard: encode, append `<|endoftext|>` and
/// check that every id fits the on-disk `u16`.
pub fn tokenize_document<E: TokenEncoder + ?Sized>(encoder: &E, text: &str) -> Result<Vec<u16>> {
    let mut ids = encoder.encode(text)?;
    ids.push(encoder.eot_token());
    ids.into_iter()
        .map(|id| u16::try_from(id).map_err(|_| Error::TokenOutOfRange { token: id }))
        .collect()
}

/// A Hugging Face `tokenizers` tokenizer, GPT-2 by default.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eot_token: u32,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` path if it exists, else treat `name` as a
    /// pretrained identifier on the Hugging Face hub (e.g. `gpt2`).
    pub fn load(name: &str) -> Result<Self> {
        let inner = if Path::new(name).exists() {
            tokenizers::Tokenizer::from_file(name)
        } else {
            tokenizers::Tokenizer::from_pretrained(name, None)
        }
        .map_err(|e| Error::Tokenizer(format!("cannot load tokenizer {name}: {e}")))?;
        Self::from_tokenizer(inner)
    }

    pub fn from_tokenizer(inner: tokenizers::Tokenizer) -> Result<Self> {
        let eot_token = inner
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| Error::Tokenizer(format!("tokenizer has no {END_OF_TEXT} token")))?;
        info!(vocab_size = inner.get_vocab_size(true), eot_token, "tokenizer loaded");
        Ok(Self { inner, eot_token })
    }

    /// Vocabulary size including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TokenEncoder for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn eot_token(&self) -> u32 {
        self.eot_token
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner.decode(ids, false).map_err(|e| Error::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// One token per byte, `<|endoftext|>` is 256.
    pub struct ByteTokenizer;

    impl TokenEncoder for ByteTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn eot_token(&self) -> u32 {
            256
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            let bytes: Vec<u8> = ids.iter().filter(|&&id| id < 256).map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    /// Emits a single fixed id for any input.
    pub struct FixedTokenizer(pub u32);

    impl TokenEncoder for FixedTokenizer {
        fn encode(&self, _text: &str) -> Result<Vec<u32>> {
            Ok(vec![self.0])
        }

        fn eot_token(&self) -> u32 {
            0
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(format!("{ids:?}"))
        }
    }
}
