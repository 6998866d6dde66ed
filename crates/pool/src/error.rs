use std::time::Duration;

use thiserror::Error;
use waypoint_transport::TransportError;

/// The result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while acquiring pooled connections.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Every connection for the address stayed in use for the whole wait.
    #[error("pool for {address} exhausted after waiting {waited:?}")]
    Exhausted {
        /// Destination address
        address: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// A new connection could not be established.
    #[error("failed to dial {address}: {source}")]
    Dial {
        /// Destination address
        address: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    Closed,
}
