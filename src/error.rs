//! Error types for sediment

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Store corruption: {0}")]
    Corruption(String),

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    #[error("Invalid attribute type: expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Unsupported filter: {0}")]
    UnsupportedFilter(String),

    #[error("Usage error: {0}")]
    Usage(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
