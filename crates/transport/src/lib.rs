//! Generic transport abstraction for request dispatch.
//!
//! This crate provides a transport-agnostic interface for exchanging framed
//! messages with a remote address. Specific transport implementations are
//! provided in separate crates.
//!
//! Transports handle:
//! - Dialing an address within a timeout
//! - Sending and receiving whole [`Message`]s on a connection
//! - Accepting inbound connections on a listener
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
pub mod header;

pub use error::TransportError;

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// A framed message: a header map plus an opaque body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Message headers
    pub header: HashMap<String, String>,
    /// Encoded body
    pub body: Bytes,
}

impl Message {
    /// Create a message with an empty header.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Set a header, returning the message.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    /// Whether a header is present with the value `"true"`.
    pub fn flag(&self, key: &str) -> bool {
        self.header(key) == Some("true")
    }
}

/// An established bidirectional connection.
///
/// A connection is used by one caller at a time; `send` and `recv` may be
/// called from the same task in any order.
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// Address of the remote end
    fn remote(&self) -> &str;

    /// Send a message
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Receive the next message
    async fn recv(&self) -> Result<Message, TransportError>;

    /// Close the connection. Pending and future `recv` calls on both ends fail.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether either end has closed the connection
    fn is_closed(&self) -> bool;
}

/// A listener accepting inbound connections.
#[async_trait]
pub trait Listener: Debug + Send + Sync + 'static {
    /// Address the listener is bound to
    fn address(&self) -> &str;

    /// Wait for the next inbound connection
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Stop accepting and release the address
    async fn close(&self) -> Result<(), TransportError>;
}

/// Transport trait for dialing and listening
#[async_trait]
pub trait Transport: Clone + Debug + Send + Sync + 'static {
    /// Dial `address`, failing if no connection is established within `timeout`
    async fn dial(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, TransportError>;

    /// Listen on `address`
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>, TransportError>;
}

/// Configuration shared by transport implementations
#[derive(Debug, Clone)]
pub struct Config {
    /// Default dial timeout
    pub dial_timeout: Duration,
    /// Messages buffered per direction on a connection
    pub buffer_size: usize,
    /// Maximum body size in bytes
    pub max_message_size: usize,
}

/// Default dial timeout used when a caller does not supply one.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

impl Default for Config {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            buffer_size: 100,
            max_message_size: 10 * 1024 * 1024, // 10MB
        }
    }
}
