use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use waypoint_codec::{AnyCodec, Codec};
use waypoint_transport::header::{self, ErrorDetail};
use waypoint_transport::{Connection, Message, TransportError};

use crate::error::Result;
use crate::handler::{HandlerError, codec_for};

/// Server half of a stream.
///
/// The handler owns the stream until it returns; the server then sends the
/// end-of-stream marker, carrying the handler's error if it failed.
pub struct ServerStream {
    id: String,
    endpoint: String,
    open: Message,
    codec: AnyCodec,
    conn: Arc<dyn Connection>,
    received_end: bool,
}

impl ServerStream {
    pub(crate) fn open(
        id: String,
        endpoint: String,
        open: Message,
        conn: Arc<dyn Connection>,
    ) -> Result<Self> {
        let codec = codec_for(&open)?;

        Ok(Self {
            id,
            endpoint,
            open,
            codec,
            conn,
            received_end: false,
        })
    }

    /// Stream id chosen by the caller.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Endpoint the stream was opened on.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// A header of the opening message, such as caller metadata.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.open.header(key)
    }

    /// Receive the next message. Returns `Ok(None)` once the caller has
    /// finished sending.
    ///
    /// # Errors
    ///
    /// Transport and decode failures.
    pub async fn recv<T>(&mut self) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        if self.received_end {
            return Ok(None);
        }

        loop {
            let message = self.conn.recv().await?;

            if message.header(header::ID) != Some(self.id.as_str()) {
                debug!("Dropping frame for another stream on {}", self.id);
                continue;
            }

            if message.flag(header::END) {
                self.received_end = true;
                return Ok(None);
            }

            let codec = codec_for(&message)?;
            return Ok(Some(codec.decode(&message.body)?));
        }
    }

    /// Send one message to the caller.
    ///
    /// # Errors
    ///
    /// Transport and encode failures.
    pub async fn send<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let message = Message::new(self.codec.encode(value)?)
            .with_header(header::ID, &self.id)
            .with_header(header::CONTENT_TYPE, self.codec.content_type());

        Ok(self.conn.send(message).await?)
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("received_end", &self.received_end)
            .finish_non_exhaustive()
    }
}

/// Send the end-of-stream marker for `id`, with the handler's error if any.
pub(crate) async fn finish(
    conn: &dyn Connection,
    id: &str,
    outcome: std::result::Result<(), HandlerError>,
) -> std::result::Result<(), TransportError> {
    let mut end = Message::default()
        .with_header(header::ID, id)
        .with_header(header::END, "true");

    if let Err(e) = outcome {
        end = end.with_header(header::ERROR, ErrorDetail::from(e).to_header());
    }

    conn.send(end).await
}
