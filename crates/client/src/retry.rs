//! Retry decisions.

use std::fmt::{self, Debug};

use crate::error::Error;

/// Decides whether a failed attempt should be retried.
///
/// Policies are pure: they see only the error and the zero-based index of
/// the attempt that produced it. The attempt budget is enforced by the
/// client, not the policy.
pub trait RetryPolicy: Debug + Send + Sync + 'static {
    /// Whether to try again after `error` from attempt number `attempt`.
    fn should_retry(&self, error: &Error, attempt: u32) -> bool;
}

/// Retries connection-layer and transient transport errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetry;

impl RetryPolicy for DefaultRetry {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        error.is_retryable()
    }
}

/// Never retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn should_retry(&self, _error: &Error, _attempt: u32) -> bool {
        false
    }
}

/// A retry policy built from a closure.
pub struct RetryFn<F>(F);

/// Wrap a closure as a [`RetryPolicy`].
pub const fn retry_fn<F>(f: F) -> RetryFn<F>
where
    F: Fn(&Error, u32) -> bool + Send + Sync + 'static,
{
    RetryFn(f)
}

impl<F> RetryPolicy for RetryFn<F>
where
    F: Fn(&Error, u32) -> bool + Send + Sync + 'static,
{
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        (self.0)(error, attempt)
    }
}

impl<F> Debug for RetryFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryFn(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use waypoint_transport::TransportError;

    #[test]
    fn test_default_skips_application_errors() {
        let application = Error::Application {
            code: 422,
            detail: "invalid".to_string(),
        };
        assert!(!DefaultRetry.should_retry(&application, 0));
        assert!(DefaultRetry.should_retry(&Error::Transport(TransportError::ConnectionClosed), 0));
        assert!(!NeverRetry.should_retry(&Error::Transport(TransportError::ConnectionClosed), 0));
    }

    #[test]
    fn test_closure_policy_sees_attempt() {
        let policy = retry_fn(|_, attempt| attempt < 2);
        assert!(policy.should_retry(&Error::Cancelled, 1));
        assert!(!policy.should_retry(&Error::Cancelled, 2));
    }
}
