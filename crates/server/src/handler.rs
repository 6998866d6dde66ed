use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use waypoint_codec::{AnyCodec, Codec, CodecError};
use waypoint_transport::Message;
use waypoint_transport::header::{self, ErrorDetail};

use crate::error::Error;
use crate::stream::ServerStream;

/// Error returned by a handler. Sent to the caller as an error header.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code}: {detail}")]
pub struct HandlerError {
    /// Status code, HTTP-like by convention
    pub code: u16,
    /// Description
    pub detail: String,
}

impl HandlerError {
    /// Create a handler error.
    pub fn new(code: u16, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// 400: the request could not be understood.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, detail)
    }

    /// 404: no such endpoint or resource.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(404, detail)
    }

    /// 500: the handler failed.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(500, detail)
    }
}

impl From<HandlerError> for ErrorDetail {
    fn from(error: HandlerError) -> Self {
        Self::new(error.code, error.detail)
    }
}

impl From<Error> for HandlerError {
    fn from(error: Error) -> Self {
        match error {
            Error::Codec(CodecError::Decode(detail)) => Self::bad_request(detail),
            Error::Codec(CodecError::UnsupportedContentType(content_type)) => {
                Self::new(415, format!("unsupported content type {content_type}"))
            }
            other => Self::internal(other.to_string()),
        }
    }
}

pub(crate) type UnaryFuture = BoxFuture<'static, Result<Message, HandlerError>>;
pub(crate) type UnaryHandler = Arc<dyn Fn(Message) -> UnaryFuture + Send + Sync>;
pub(crate) type StreamFuture = BoxFuture<'static, Result<(), HandlerError>>;
pub(crate) type StreamHandler = Arc<dyn Fn(ServerStream) -> StreamFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Route {
    Unary(UnaryHandler),
    Stream(StreamHandler),
}

/// Codec named by a message's content type, CBOR when absent.
pub(crate) fn codec_for(message: &Message) -> Result<AnyCodec, Error> {
    message
        .header(header::CONTENT_TYPE)
        .map_or(Ok(AnyCodec::default()), AnyCodec::for_content_type)
        .map_err(Error::from)
}

pub(crate) fn typed<Req, Resp, F, Fut>(handler: F) -> UnaryHandler
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);

    Arc::new(move |message: Message| -> UnaryFuture {
        let handler = handler.clone();
        Box::pin(async move {
            let codec = codec_for(&message)?;
            let request: Req = codec.decode(&message.body).map_err(Error::from)?;
            let response = handler(request).await?;
            let body = codec.encode(&response).map_err(Error::from)?;

            Ok(Message::new(body).with_header(header::CONTENT_TYPE, codec.content_type()))
        })
    })
}

pub(crate) fn raw<F, Fut>(handler: F) -> UnaryHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message, HandlerError>> + Send + 'static,
{
    Arc::new(move |message: Message| -> UnaryFuture { Box::pin(handler(message)) })
}

pub(crate) fn stream<F, Fut>(handler: F) -> StreamHandler
where
    F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |stream: ServerStream| -> StreamFuture { Box::pin(handler(stream)) })
}
