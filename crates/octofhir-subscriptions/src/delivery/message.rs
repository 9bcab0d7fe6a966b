//! In-process message channel.
//!
//! Notifications are published on a [`MessageBus`] topic named by the
//! subscription endpoint. Consumers subscribe to a topic and receive
//! [`Notification`]s as they are delivered.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{DeliveryChannel, DeliveryOutcome};
use crate::types::{Notification, SubscriptionRecord};

const TOPIC_CAPACITY: usize = 256;

/// Topic-keyed broadcast bus for message subscriptions.
#[derive(Default)]
pub struct MessageBus {
    topics: DashMap<String, broadcast::Sender<Notification>>,
}

impl MessageBus {
    /// Create a bus with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start consuming `endpoint`. Only notifications published afterwards are received.
    pub fn subscribe(&self, endpoint: &str) -> broadcast::Receiver<Notification> {
        self.topics
            .entry(endpoint.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publish to a topic. Returns the number of consumers reached.
    pub fn publish(&self, endpoint: &str, notification: Notification) -> usize {
        let Some(sender) = self.topics.get(endpoint).map(|s| s.clone()) else {
            return 0;
        };
        match sender.send(notification) {
            Ok(receivers) => receivers,
            Err(_) => {
                self.topics
                    .remove_if(endpoint, |_, s| s.receiver_count() == 0);
                0
            }
        }
    }

    /// Number of live consumers of a topic.
    pub fn consumer_count(&self, endpoint: &str) -> usize {
        self.topics
            .get(endpoint)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

pub struct MessageChannel {
    bus: Arc<MessageBus>,
}

impl MessageChannel {
    /// Create a channel publishing to `bus`.
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DeliveryChannel for MessageChannel {
    fn name(&self) -> &str {
        "message"
    }

    async fn deliver(
        &self,
        subscription: &SubscriptionRecord,
        notification: &Notification,
    ) -> DeliveryOutcome {
        let endpoint = subscription.channel.endpoint.as_str();
        if endpoint.is_empty() {
            return DeliveryOutcome::fatal("message channel requires an endpoint");
        }
        if self.bus.publish(endpoint, notification.clone()) == 0 {
            DeliveryOutcome::Retryable(format!("no consumer for message endpoint '{endpoint}'"))
        } else {
            DeliveryOutcome::Delivered
        }
    }
}
