//! In-memory implementation of the broker crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use waypoint_broker::{Broker, Event, Subscription, SubscriptionHandler};

const DEFAULT_TOPIC_CAPACITY: usize = 100;

/// In-memory broker. Clones share the same topics.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    topics: Arc<DashMap<String, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl MemoryBroker {
    /// Create a broker with the default per-topic buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a broker buffering up to `capacity` events per topic.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(topic: &str) -> Result<(), Error> {
    if topic.is_empty() || topic.chars().any(char::is_whitespace) {
        return Err(Error::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Subscription handle for [`MemoryBroker`].
///
/// Delivery continues until [`Subscription::unsubscribe`] is called; dropping
/// the handle does not stop it.
#[derive(Clone, Debug)]
pub struct MemorySubscription {
    topic: String,
    token: CancellationToken,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn unsubscribe(&self) {
        self.token.cancel();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;
    type Subscription = MemorySubscription;

    async fn publish(&self, topic: &str, event: Event) -> Result<(), Self::Error> {
        validate(topic)?;

        // Err only means there are no subscribers.
        if self.sender(topic).send(event).is_err() {
            debug!("No subscribers on {}, event dropped", topic);
        }

        Ok(())
    }

    async fn subscribe<H>(&self, topic: &str, handler: H) -> Result<Self::Subscription, Self::Error>
    where
        H: SubscriptionHandler,
    {
        validate(topic)?;

        let mut receiver = self.sender(topic).subscribe();
        let token = CancellationToken::new();

        let task_token = token.clone();
        let task_topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = task_token.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(event) => {
                            if let Err(e) = handler.handle(task_topic.clone(), event).await {
                                warn!("Subscription handler on {} failed: {}", task_topic, e);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Subscription on {} lagged, {} events skipped", task_topic, skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("Subscription on {} stopped", task_topic);
        });

        Ok(MemorySubscription {
            topic: topic.to_string(),
            token,
        })
    }
}
