//! Abstract interface for fire-and-forget publish/subscribe.
//!
//! Publishing is outside the request dispatch path: it is never retried and
//! never goes through node selection.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for broker errors
pub trait BrokerError: Error + Send + Sync + 'static {}

/// Marker trait for subscription handler errors
pub trait SubscriptionHandlerError: Error + Send + Sync + 'static {}

/// A published event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    /// Event headers, including the body's `Content-Type`
    pub header: HashMap<String, String>,
    /// Encoded body
    pub body: Bytes,
}

impl Event {
    /// Create an event with an empty header.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Set a header, returning the event.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }
}

/// Receives events for a subscription.
#[async_trait]
pub trait SubscriptionHandler
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: SubscriptionHandlerError;

    /// Handles one event published on `topic`.
    async fn handle(&self, topic: String, event: Event) -> Result<(), Self::Error>;
}

/// A live subscription.
#[async_trait]
pub trait Subscription: Debug + Send + Sync + 'static {
    /// Topic this subscription listens on.
    fn topic(&self) -> &str;

    /// Stop delivering events. Idempotent.
    async fn unsubscribe(&self);
}

/// A publish/subscribe broker.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// Handle returned by [`Broker::subscribe`].
    type Subscription: Subscription;

    /// Publish an event. Succeeds even when nobody is subscribed.
    async fn publish(&self, topic: &str, event: Event) -> Result<(), Self::Error>;

    /// Deliver every event published on `topic` to `handler` until unsubscribed.
    async fn subscribe<H>(&self, topic: &str, handler: H) -> Result<Self::Subscription, Self::Error>
    where
        H: SubscriptionHandler;
}
