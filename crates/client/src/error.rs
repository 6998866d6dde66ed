//! Caller-facing error taxonomy.

use std::time::Duration;

use thiserror::Error;
use waypoint_codec::CodecError;
use waypoint_selector::SelectorError;
use waypoint_transport::TransportError;

/// The result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by [`Client`](crate::Client) calls.
///
/// A call always ends in exactly one of these. Failures of intermediate
/// attempts are only visible through logs and wrappers.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The registry has no instances of the service.
    #[error("service {0} not found")]
    NotFound(String),

    /// Instances exist but none passed selection.
    #[error("no available nodes for service {0}")]
    NoneAvailable(String),

    /// The registry could not be queried.
    #[error("registry error: {0}")]
    Registry(String),

    /// A connection to the node could not be established.
    #[error("failed to dial {address}: {source}")]
    Dial {
        /// Node address
        address: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// Every pooled connection to the node stayed busy.
    #[error("connection pool for {address} exhausted after {waited:?}")]
    PoolExhausted {
        /// Node address
        address: String,
        /// How long the attempt waited for a connection
        waited: Duration,
    },

    /// I/O failed while the request was in flight.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The remote handler returned an error.
    #[error("application error {code}: {detail}")]
    Application {
        /// Status code chosen by the handler
        code: u16,
        /// Description
        detail: String,
    },

    /// The attempt budget was spent; wraps the last attempt's error.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        #[source]
        source: Box<Error>,
    },

    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    /// The call's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The broker rejected a publish.
    #[error("broker error: {0}")]
    Broker(String),

    /// The stream was used after it ended or failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// The client has been shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl Error {
    /// Whether another attempt, possibly against another node, may succeed.
    ///
    /// Connection-layer and transient transport failures are retryable.
    /// Application errors, selection failures and caller-driven errors are
    /// not.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Dial { .. } | Self::PoolExhausted { .. } => true,
            Self::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the caller ended the call through cancellation or deadline.
    pub const fn is_caller_driven(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl From<SelectorError> for Error {
    fn from(err: SelectorError) -> Self {
        match err {
            SelectorError::NotFound(service) => Self::NotFound(service),
            SelectorError::NoneAvailable(service) => Self::NoneAvailable(service),
            SelectorError::Registry(reason) => Self::Registry(reason),
        }
    }
}

impl From<waypoint_pool::Error> for Error {
    fn from(err: waypoint_pool::Error) -> Self {
        match err {
            waypoint_pool::Error::Exhausted { address, waited } => {
                Self::PoolExhausted { address, waited }
            }
            waypoint_pool::Error::Dial { address, source } => Self::Dial { address, source },
            waypoint_pool::Error::Closed => Self::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            Error::Dial {
                address: "a".to_string(),
                source: TransportError::ConnectionClosed,
            }
            .is_retryable()
        );
        assert!(Error::Transport(TransportError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(!Error::Transport(TransportError::Protocol("bad frame".to_string())).is_retryable());
        assert!(
            !Error::Application {
                code: 400,
                detail: "bad name".to_string(),
            }
            .is_retryable()
        );
        assert!(!Error::NotFound("ghost".to_string()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_selector_errors_keep_their_meaning() {
        assert!(matches!(
            Error::from(SelectorError::NotFound("ghost".to_string())),
            Error::NotFound(s) if s == "ghost"
        ));
        assert!(matches!(
            Error::from(SelectorError::NoneAvailable("greeter".to_string())),
            Error::NoneAvailable(_)
        ));
    }
}
