//! Middleware around individual call attempts.
//!
//! Wrappers are applied in registration order with the first wrapper
//! outermost. Each one receives the next function in the chain and returns a
//! function with the same contract; it may add side effects such as logging,
//! metrics or header injection but must not change what a call means.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, warn};
use waypoint_registry::ServiceInstance;

use crate::context::Context;
use crate::error::Result;
use crate::options::CallOptions;
use crate::request::{Request, Response};

/// Future returned by a [`CallFn`].
pub type CallFuture = BoxFuture<'static, Result<Response>>;

/// One attempt of a unary call against a chosen node.
pub type CallFn =
    Arc<dyn Fn(Context, ServiceInstance, Request, Arc<CallOptions>) -> CallFuture + Send + Sync>;

/// Build a [`CallFn`] from an async closure.
pub fn call_fn<F, Fut>(f: F) -> CallFn
where
    F: Fn(Context, ServiceInstance, Request, Arc<CallOptions>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(
        move |ctx: Context,
              node: ServiceInstance,
              request: Request,
              options: Arc<CallOptions>|
              -> CallFuture { Box::pin(f(ctx, node, request, options)) },
    )
}

/// Wraps a [`CallFn`].
pub trait CallWrapper: Send + Sync + 'static {
    /// Return a function that runs `next` with added behavior.
    fn wrap(&self, next: CallFn) -> CallFn;
}

impl<F> CallWrapper for F
where
    F: Fn(CallFn) -> CallFn + Send + Sync + 'static,
{
    fn wrap(&self, next: CallFn) -> CallFn {
        self(next)
    }
}

/// Logs the node, duration and outcome of every attempt.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceWrapper;

impl CallWrapper for TraceWrapper {
    fn wrap(&self, next: CallFn) -> CallFn {
        call_fn(move |ctx, node, request, options| {
            let next = next.clone();
            async move {
                let started = Instant::now();
                let address = node.address().to_string();
                let endpoint = request.endpoint().to_string();

                let result = next(ctx, node, request, options).await;

                match &result {
                    Ok(_) => debug!(
                        %address,
                        %endpoint,
                        elapsed = ?started.elapsed(),
                        "attempt succeeded"
                    ),
                    Err(e) => warn!(
                        %address,
                        %endpoint,
                        elapsed = ?started.elapsed(),
                        error = %e,
                        "attempt failed"
                    ),
                }

                result
            }
        })
    }
}

/// Compose `wrappers` around `base`, first wrapper outermost.
pub(crate) fn chain(wrappers: &[Arc<dyn CallWrapper>], base: CallFn) -> CallFn {
    wrappers
        .iter()
        .rev()
        .fold(base, |next, wrapper| wrapper.wrap(next))
}
