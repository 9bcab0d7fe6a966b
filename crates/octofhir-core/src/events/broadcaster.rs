//! Event broadcaster for resource and delivery events.
//!
//! The `EventBroadcaster` is the bus the REST boundary publishes resource
//! changes on and the subscription dispatcher publishes delivery outcomes on.
//! It uses tokio's broadcast channel, so slow receivers lag instead of
//! blocking publishers.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::{DeliveryEvent, ResourceEvent, SystemEvent};

/// Default buffer size for the broadcast channel.
/// Events beyond this limit will cause older events to be dropped for slow receivers.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Broadcaster for system events.
///
/// # Example
///
/// ```
/// use octofhir_core::events::{EventBroadcaster, ResourceEvent};
///
/// let broadcaster = EventBroadcaster::new();
/// let _receiver = broadcaster.subscribe();
///
/// broadcaster.send_resource(ResourceEvent::created("Patient", "123", serde_json::json!({})));
/// ```
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<SystemEvent>,
}

impl EventBroadcaster {
    /// Create a new broadcaster with default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new broadcaster with custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new broadcaster wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Send a system event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn send(&self, event: SystemEvent) -> usize {
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                tracing::trace!("No event subscribers, event dropped");
                0
            }
        }
    }

    /// Send a resource event to all subscribers.
    pub fn send_resource(&self, event: ResourceEvent) -> usize {
        self.send(SystemEvent::Resource(event))
    }

    /// Send a delivery event to all subscribers.
    pub fn send_delivery(&self, event: DeliveryEvent) -> usize {
        self.send(SystemEvent::Delivery(event))
    }

    /// Subscribe to events.
    ///
    /// Events sent before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers.
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
