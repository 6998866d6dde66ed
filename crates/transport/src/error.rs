//! Transport error types

use std::time::Duration;

use thiserror::Error;

/// Transport-level errors
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// Could not establish a connection
    #[error("Failed to dial {address}: {reason}")]
    Dial {
        /// Address that was dialed
        address: String,
        /// Why the dial failed
        reason: String,
    },

    /// The connection was closed by either side
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation did not complete in time
    #[error("Transport operation timed out after {0:?}")]
    Timeout(Duration),

    /// The address could not be used
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Another listener already owns the address
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    /// Framing or protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the failure is tied to the connection rather than the caller's input.
    ///
    /// Transient errors are candidates for a retry against the same or
    /// another address.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. } | Self::ConnectionClosed | Self::Timeout(_) | Self::Other(_)
        )
    }
}
