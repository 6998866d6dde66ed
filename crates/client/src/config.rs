use std::time::Duration;

use waypoint_codec::AnyCodec;
use waypoint_pool::PoolConfig;

use crate::backoff::BackoffConfig;

/// Process-wide defaults for a [`Client`](crate::Client).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientConfig {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Total time allowed for one call, all attempts included.
    pub request_timeout: Duration,
    /// Time allowed to obtain a connection for one attempt.
    pub dial_timeout: Duration,
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Delay between attempts.
    pub backoff: BackoffConfig,
    /// Encoding for request bodies and published events.
    pub codec: AnyCodec,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            request_timeout: Duration::from_secs(5),
            dial_timeout: waypoint_transport::DEFAULT_DIAL_TIMEOUT,
            pool: PoolConfig::default(),
            backoff: BackoffConfig::default(),
            codec: AnyCodec::Cbor,
        }
    }
}
