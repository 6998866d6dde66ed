//! Codec error types

use thiserror::Error;

/// Errors raised while encoding or decoding bodies.
#[derive(Clone, Debug, Error)]
pub enum CodecError {
    /// Value could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Bytes could not be deserialized into the requested type
    #[error("Decode error: {0}")]
    Decode(String),

    /// No codec registered for the content type
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),
}

impl From<ciborium::ser::Error<std::io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::Decode(err.to_string())
    }
}
