use thiserror::Error;
use waypoint_broker::BrokerError;

/// Errors that can occur in the memory broker.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Topic is empty or contains whitespace.
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),
}

impl BrokerError for Error {}
