use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the shard pipeline and the training driver.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A tokenizer emitted an id that does not fit the on-disk token width.
    #[error("token id {token} does not fit in u16, vocabulary too large for the shard format")]
    TokenOutOfRange { token: u32 },

    #[error("no shards found for split {split} in {dir:?}")]
    NoShards { split: String, dir: PathBuf },

    #[error("corrupt shard {path:?}: {reason}")]
    CorruptShard { path: PathBuf, reason: String },

    /// No shard of the split can hold a single window for this rank.
    #[error("no shard holds {needed} tokens (B*T*rank + B*T + 1) after {attempts} reloads")]
    ShardTooSmall { needed: usize, attempts: usize },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("NVML error: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TokenOutOfRange { token: 65536 };
        assert_eq!(
            err.to_string(),
            "token id 65536 does not fit in u16, vocabulary too large for the shard format"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }
}
