//! Bidirectional streams bound to one node.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use waypoint_codec::{AnyCodec, Codec};
use waypoint_pool::PooledConnection;
use waypoint_registry::ServiceInstance;
use waypoint_transport::header::{self, ErrorDetail};
use waypoint_transport::{Message, TransportError};

use crate::context::Context;
use crate::error::{Error, Result};

/// Reports the outcome of a stream to the selector, once.
pub(crate) type MarkFn = Box<dyn FnOnce(Option<&Error>) + Send>;

/// An open stream.
///
/// The stream stays on the node it was opened against for its whole life.
/// Any transport failure ends it and is returned to the caller; it is never
/// moved to another node. Call [`Stream::close`] when done so the connection
/// can be reused. A stream dropped before it ends is not reported to the
/// selector and its connection is discarded.
pub struct Stream {
    id: String,
    node: ServiceInstance,
    endpoint: String,
    ctx: Context,
    codec: AnyCodec,
    conn: Option<PooledConnection>,
    mark: Option<MarkFn>,
    sent_end: bool,
    received_end: bool,
    failed: bool,
}

impl Stream {
    pub(crate) fn new(
        id: String,
        node: ServiceInstance,
        endpoint: String,
        ctx: Context,
        codec: AnyCodec,
        conn: PooledConnection,
        mark: MarkFn,
    ) -> Self {
        Self {
            id,
            node,
            endpoint,
            ctx,
            codec,
            conn: Some(conn),
            mark: Some(mark),
            sent_end: false,
            received_end: false,
            failed: false,
        }
    }

    /// Stream id shared with the server.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The node this stream is bound to.
    pub const fn node(&self) -> &ServiceInstance {
        &self.node
    }

    /// Endpoint the stream was opened on.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the server has finished sending.
    pub const fn is_remote_done(&self) -> bool {
        self.received_end
    }

    fn connection(&self) -> Result<&PooledConnection> {
        if self.failed {
            return Err(Error::Stream("stream failed".to_string()));
        }
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Stream("stream closed".to_string()))
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Transport failures end the stream. Sending after
    /// [`Stream::close_send`] is an [`Error::Stream`].
    pub async fn send<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        if self.sent_end {
            return Err(Error::Stream("send after close_send".to_string()));
        }

        let body = self.codec.encode(value)?;
        let message = Message::new(body)
            .with_header(header::ID, &self.id)
            .with_header(header::CONTENT_TYPE, self.codec.content_type());

        self.write(message).await
    }

    /// Receive the next message. Returns `Ok(None)` once the server has
    /// finished sending.
    ///
    /// # Errors
    ///
    /// Transport failures and handler errors end the stream.
    pub async fn recv<T>(&mut self) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        if self.received_end {
            return Ok(None);
        }

        let conn = self.connection()?;
        let received = self
            .ctx
            .run(conn.recv())
            .await
            .and_then(|r| r.map_err(Error::from));

        let message = match received {
            Ok(message) => message,
            Err(e) => return Err(self.fail(e)),
        };

        if message.header(header::ID) != Some(self.id.as_str()) {
            let e = TransportError::Protocol("frame for another stream".to_string());
            return Err(self.fail(e.into()));
        }

        if let Some(value) = message.header(header::ERROR) {
            let detail = ErrorDetail::from_header(value);
            self.received_end = true;
            return Err(self.fail(Error::Application {
                code: detail.code,
                detail: detail.detail,
            }));
        }

        if message.flag(header::END) {
            debug!("Stream {} ended by server", self.id);
            self.received_end = true;
            return Ok(None);
        }

        let codec = message
            .header(header::CONTENT_TYPE)
            .map_or(Ok(self.codec), AnyCodec::for_content_type)?;

        Ok(Some(codec.decode(&message.body)?))
    }

    /// Tell the server no more messages will be sent.
    ///
    /// # Errors
    ///
    /// Transport failures end the stream.
    pub async fn close_send(&mut self) -> Result<()> {
        if self.sent_end {
            return Ok(());
        }

        let message = Message::default()
            .with_header(header::ID, &self.id)
            .with_header(header::END, "true");

        self.write(message).await?;
        self.sent_end = true;
        Ok(())
    }

    /// Finish the stream and report its outcome.
    ///
    /// The connection goes back to the pool only if both sides ended cleanly.
    ///
    /// # Errors
    ///
    /// Returns the error if sending the end-of-stream marker failed.
    pub async fn close(mut self) -> Result<()> {
        if self.failed || self.conn.is_none() {
            return Ok(());
        }

        if !self.sent_end {
            self.close_send().await?;
        }

        let healthy = self.sent_end && self.received_end;
        self.finish(None, healthy);
        Ok(())
    }

    async fn write(&mut self, message: Message) -> Result<()> {
        let conn = self.connection()?;
        let sent = self
            .ctx
            .run(conn.send(message))
            .await
            .and_then(|r| r.map_err(Error::from));

        match sent {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        warn!("Stream {} to {} failed: {}", self.id, self.node, error);
        self.failed = true;
        self.finish(Some(&error), false);
        error
    }

    fn finish(&mut self, error: Option<&Error>, healthy: bool) {
        if let Some(mark) = self.mark.take() {
            mark(error);
        }
        if let Some(conn) = self.conn.take() {
            conn.release(healthy);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Abandoning a stream says nothing about the node, so no mark.
            debug!("Stream {} dropped without close", self.id);
            self.mark = None;
            conn.release(false);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("node", &self.node.address())
            .field("endpoint", &self.endpoint)
            .field("sent_end", &self.sent_end)
            .field("received_end", &self.received_end)
            .field("failed", &self.failed)
            .finish()
    }
}
