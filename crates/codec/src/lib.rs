//! Body encodings for requests, responses and published messages.
//!
//! The dispatcher treats bodies as opaque bytes; a [`Codec`] turns typed
//! values into those bytes and back. [`AnyCodec`] picks an implementation
//! from a `Content-Type` value at runtime.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::CodecError;

use std::fmt::Debug;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Content type of [`CborCodec`].
pub const CBOR: &str = "application/cbor";

/// Content type of [`JsonCodec`].
pub const JSON: &str = "application/json";

/// Encodes and decodes message bodies.
pub trait Codec: Clone + Debug + Send + Sync + 'static {
    /// Value carried in the `Content-Type` header.
    fn content_type(&self) -> &'static str;

    /// Serialize a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the value cannot be represented.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Deserialize a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// CBOR bodies via `ciborium`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn content_type(&self) -> &'static str {
        CBOR
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(ciborium::de::from_reader(bytes)?)
    }
}

/// JSON bodies via `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Runtime-selected codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnyCodec {
    /// [`CborCodec`]
    #[default]
    Cbor,
    /// [`JsonCodec`]
    Json,
}

impl AnyCodec {
    /// Pick a codec for a `Content-Type` value. Parameters such as
    /// `; charset=utf-8` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedContentType`] for unknown types.
    pub fn for_content_type(content_type: &str) -> Result<Self, CodecError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            CBOR => Ok(Self::Cbor),
            JSON => Ok(Self::Json),
            _ => Err(CodecError::UnsupportedContentType(content_type.to_string())),
        }
    }
}

impl Codec for AnyCodec {
    fn content_type(&self) -> &'static str {
        match self {
            Self::Cbor => CborCodec.content_type(),
            Self::Json => JsonCodec.content_type(),
        }
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            Self::Cbor => CborCodec.encode(value),
            Self::Json => JsonCodec.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Cbor => CborCodec.decode(bytes),
            Self::Json => JsonCodec.decode(bytes),
        }
    }
}
