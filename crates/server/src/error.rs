use thiserror::Error;
use waypoint_codec::CodecError;
use waypoint_transport::TransportError;

/// The result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving.
#[derive(Debug, Error)]
pub enum Error {
    /// `start` was called twice.
    #[error("server already started")]
    AlreadyStarted,

    /// A body could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The listen address could not be bound.
    #[error("failed to listen on {address}: {source}")]
    Listen {
        /// Listen address
        address: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// The instance could not be registered.
    #[error("registry error: {0}")]
    Registry(String),

    /// I/O on a connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
