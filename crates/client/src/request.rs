//! Requests and responses.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use waypoint_codec::{AnyCodec, CBOR, Codec};
use waypoint_transport::{Message, header};

use crate::error::Result;
use crate::metadata::Metadata;

/// A request addressed to an endpoint of a logical service.
///
/// The body is already encoded; see [`Client::new_request`](crate::Client::new_request).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    service: String,
    endpoint: String,
    content_type: String,
    body: Bytes,
}

impl Request {
    /// Create a request with an encoded body.
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    /// Target service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Target endpoint within the service.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Encoding of the body.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Encoded body.
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Build the wire message for one attempt.
    pub(crate) fn to_message(&self, id: &str, metadata: &Metadata) -> Message {
        let mut message = Message::new(self.body.clone());

        for (key, value) in metadata {
            if !header::is_reserved(key) {
                message.header.insert(key.clone(), value.clone());
            }
        }

        message
            .with_header(header::ID, id)
            .with_header(header::SERVICE, &self.service)
            .with_header(header::ENDPOINT, &self.endpoint)
            .with_header(header::CONTENT_TYPE, &self.content_type)
    }
}

/// A successful reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    header: HashMap<String, String>,
    body: Bytes,
}

impl Response {
    /// Reply headers.
    pub const fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    /// Encoded body.
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Encoding of the body. Replies without a content type are CBOR.
    pub fn content_type(&self) -> &str {
        self.header
            .get(header::CONTENT_TYPE)
            .map_or(CBOR, String::as_str)
    }

    /// Decode the body with the codec named by its content type.
    ///
    /// # Errors
    ///
    /// [`Error::Codec`](crate::Error::Codec) if the content type is unknown
    /// or the body is not a valid `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let codec = AnyCodec::for_content_type(self.content_type())?;
        Ok(codec.decode(&self.body)?)
    }
}

impl From<Message> for Response {
    fn from(message: Message) -> Self {
        Self {
            header: message.header,
            body: message.body,
        }
    }
}
