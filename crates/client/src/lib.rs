//! Client-side request dispatch.
//!
//! A [`Client`] resolves a service name through a
//! [`Selector`](waypoint_selector::Selector), borrows a pooled connection
//! to the chosen node and sends the request, retrying on other nodes when
//! an attempt fails with a retryable error. Every attempt's outcome is fed
//! back to the selector so that later calls avoid failing nodes.
//!
//! Streams are opened the same way but stay bound to their node once open.
//! Events are published through a [`Broker`](waypoint_broker::Broker) and
//! never retried.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod backoff;
mod client;
mod config;
mod context;
mod error;
mod metadata;
mod options;
mod request;
mod retry;
mod stats;
mod stream;
mod wrapper;

pub use backoff::{Backoff, BackoffConfig, ConstantBackoff, ExponentialBackoff};
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use context::Context;
pub use error::{Error, Result};
pub use metadata::Metadata;
pub use options::CallOptions;
pub use request::{Request, Response};
pub use retry::{DefaultRetry, NeverRetry, RetryFn, RetryPolicy, retry_fn};
pub use stats::Stats;
pub use stream::Stream;
pub use wrapper::{CallFn, CallFuture, CallWrapper, TraceWrapper, call_fn};
