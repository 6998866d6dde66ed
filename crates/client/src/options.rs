//! Per-call options.

use std::sync::Arc;
use std::time::Duration;

use waypoint_selector::SelectOptions;

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::config::ClientConfig;
use crate::retry::{DefaultRetry, RetryPolicy};

/// Options for a single call, seeded from the client's [`ClientConfig`].
///
/// Obtain one with [`Client::options`](crate::Client::options) and override
/// what the call needs.
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub(crate) retries: u32,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) dial_timeout: Duration,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) backoff: Arc<dyn Backoff>,
    pub(crate) select: SelectOptions,
    pub(crate) addresses: Vec<String>,
}

impl CallOptions {
    /// Options carrying the defaults of `config`.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            retries: config.retries,
            request_timeout: Some(config.request_timeout).filter(|t| !t.is_zero()),
            dial_timeout: config.dial_timeout,
            retry: Arc::new(DefaultRetry),
            backoff: Arc::new(ExponentialBackoff::new(config.backoff)),
            select: SelectOptions::default(),
            addresses: Vec::new(),
        }
    }

    /// Retries after the first attempt.
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Total time allowed for the call.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Let the call run until the context ends it.
    #[must_use]
    pub const fn no_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    /// Time allowed to obtain a connection for each attempt.
    #[must_use]
    pub const fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: impl RetryPolicy) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    /// Replace the backoff.
    #[must_use]
    pub fn backoff(mut self, backoff: impl Backoff) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Filters and strategy override for node selection.
    #[must_use]
    pub fn select_options(mut self, options: SelectOptions) -> Self {
        self.select = options;
        self
    }

    /// Skip selection and call this address. May be given several times;
    /// addresses are tried in order.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    /// Total attempts allowed.
    pub const fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Current per-call timeout.
    pub const fn timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::new(&ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::retry::NeverRetry;

    #[test]
    fn test_defaults_follow_config() {
        let options = CallOptions::default();
        assert_eq!(options.max_attempts(), 2);
        assert_eq!(options.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_overrides() {
        let options = CallOptions::default()
            .retries(3)
            .no_timeout()
            .retry_policy(NeverRetry)
            .address("10.0.0.1:1")
            .address("10.0.0.2:1");

        assert_eq!(options.max_attempts(), 4);
        assert_eq!(options.timeout(), None);
        assert_eq!(options.addresses, vec!["10.0.0.1:1", "10.0.0.2:1"]);
    }
}
