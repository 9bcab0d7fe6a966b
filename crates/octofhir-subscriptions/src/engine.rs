//! Subscription engine facade.
//!
//! The REST boundary talks to the engine only: subscription administration
//! (create/update/delete/deactivate) and `on_resource_written` after each
//! durable resource write. The engine owns the registry, matcher, dispatcher
//! and the delivery channels.

use std::sync::Arc;

use octofhir_core::events::{EventBroadcaster, ResourceEvent, ResourceEventType};
use serde_json::Value;

use crate::config::SubscriptionConfig;
use crate::delivery::{
    ChannelSet, EmailChannel, MessageBus, MessageChannel, RestHookChannel, SessionHandle,
    SessionManager, WebSocketChannel,
};
use crate::dispatcher::Dispatcher;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::matcher::Matcher;
use crate::registry::SubscriptionRegistry;
use crate::retry::RetryPolicy;
use crate::types::{
    ChannelType, Notification, PayloadFormat, SubscriptionRecord, SubscriptionStatus,
};

const SUBSCRIPTION_TYPE: &str = "Subscription";

pub struct SubscriptionEngine {
    config: SubscriptionConfig,
    registry: Arc<SubscriptionRegistry>,
    matcher: Matcher,
    dispatcher: Dispatcher,
    sessions: Arc<SessionManager>,
    message_bus: Arc<MessageBus>,
    events: Arc<EventBroadcaster>,
}

impl SubscriptionEngine {
    /// Build the engine and its delivery channels from configuration.
    pub fn new(config: SubscriptionConfig, events: Arc<EventBroadcaster>) -> SubscriptionResult<Self> {
        config.validate().map_err(SubscriptionError::Validation)?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let sessions = Arc::new(SessionManager::new(config.websocket.outbound_buffer));
        let message_bus = Arc::new(MessageBus::new());
        let email = config.email.as_ref().map(EmailChannel::new).transpose()?;
        let channels = Arc::new(ChannelSet {
            websocket: WebSocketChannel::new(sessions.clone()),
            rest_hook: RestHookChannel::new(&config.rest_hook)?,
            email,
            message: MessageChannel::new(message_bus.clone()),
        });
        let dispatcher = Dispatcher::new(
            registry.clone(),
            channels,
            RetryPolicy::from(&config.retry),
            events.clone(),
        );

        tracing::info!(
            enabled = config.enabled,
            max_attempts = config.retry.max_attempts,
            email = config.email.is_some(),
            "Subscription engine initialized"
        );

        Ok(Self {
            matcher: Matcher::new(registry.clone()),
            config,
            registry,
            dispatcher,
            sessions,
            message_bus,
            events,
        })
    }

    /// Check a `Subscription` resource without registering it.
    ///
    /// Also rejects `message` endpoints that are not configured topics.
    pub fn validate(&self, resource: &Value) -> SubscriptionResult<()> {
        let record = SubscriptionRecord::from_resource("validation", resource)?;
        let channel = &record.channel;
        if channel.channel_type == ChannelType::Message
            && !self.config.message.has_topic(&channel.endpoint)
        {
            return Err(SubscriptionError::validation(format!(
                "Message endpoint '{}' is not a configured topic",
                channel.endpoint
            )));
        }
        Ok(())
    }

    /// Register a newly created `Subscription` resource.
    ///
    /// Returns the resulting status: `Active`, or `Off` when the resource asks
    /// for it (stored at the boundary, never registered).
    pub fn create(&self, id: &str, resource: &Value) -> SubscriptionResult<SubscriptionStatus> {
        let record = SubscriptionRecord::from_resource(id, resource)?;
        if record.status == SubscriptionStatus::Off {
            tracing::debug!(subscription_id = %id, "Subscription created with status off");
            return Ok(SubscriptionStatus::Off);
        }
        let record = self.registry.register(record)?;
        tracing::info!(
            subscription_id = %id,
            criteria = %record.criteria,
            channel = %record.channel.channel_type,
            "Subscription activated"
        );
        Ok(record.status)
    }

    /// Re-register a subscription after its resource was replaced.
    ///
    /// Notifications still queued under the previous definition are delivered
    /// with the new one if it is active, and dropped otherwise. The worker
    /// queue is kept, so delivery order spans the update.
    pub fn update(&self, id: &str, resource: &Value) -> SubscriptionResult<SubscriptionStatus> {
        let record = SubscriptionRecord::from_resource(id, resource)?;
        let websocket = record.channel.channel_type == ChannelType::WebSocket;
        let status = match self.registry.replace(record) {
            Some(record) => record.status,
            None => SubscriptionStatus::Off,
        };
        if status == SubscriptionStatus::Off {
            self.dispatcher.retire(id);
        }
        if status == SubscriptionStatus::Off || !websocket {
            self.sessions
                .close_subscription(id, "subscription is no longer delivered over websocket");
        }
        tracing::info!(subscription_id = %id, status = %status, "Subscription updated");
        Ok(status)
    }

    /// Remove a subscription. Unknown ids are not an error at the boundary.
    pub fn delete(&self, id: &str) -> bool {
        let removed = self.registry.unregister(id).is_ok();
        self.dispatcher.retire(id);
        let closed = self.sessions.close_subscription(id, "subscription deleted");
        if removed {
            tracing::info!(subscription_id = %id, closed_sessions = closed, "Subscription deleted");
        }
        removed
    }

    /// Explicit deactivation: `Active|Error -> Off`.
    pub fn deactivate(&self, id: &str) -> SubscriptionResult<()> {
        self.registry.update_status(id, SubscriptionStatus::Off, None)?;
        self.dispatcher.retire(id);
        self.sessions.close_subscription(id, "subscription deactivated");
        Ok(())
    }

    /// Registered record for `id`.
    pub fn get(&self, id: &str) -> Option<Arc<SubscriptionRecord>> {
        self.registry.get(id)
    }

    /// Live status and error text of a registered subscription.
    pub fn status(&self, id: &str) -> Option<(SubscriptionStatus, Option<String>)> {
        self.registry
            .get(id)
            .map(|record| (record.status, record.error.clone()))
    }

    /// Hand a durably written resource to the engine.
    ///
    /// Returns the number of notifications queued. Never fails: delivery
    /// problems surface through subscription status and delivery events.
    pub fn on_resource_written(&self, event: &ResourceEvent) -> usize {
        if event.event_type == ResourceEventType::Deleted {
            return 0;
        }
        let Some(resource) = &event.resource else {
            return 0;
        };
        self.on_resource_changed(&event.resource_type, &event.resource_id, resource)
    }

    /// Match a written resource and queue one notification per matching subscription.
    pub fn on_resource_changed(&self, resource_type: &str, resource_id: &str, resource: &Value) -> usize {
        if !self.config.enabled || resource_type == SUBSCRIPTION_TYPE {
            return 0;
        }

        let matches = self.matcher.find_matches(resource_type, resource);
        if matches.is_empty() {
            return 0;
        }

        let snapshot = Arc::new(resource.clone());
        for record in &matches {
            self.dispatcher.dispatch(Notification {
                subscription_id: record.id.clone(),
                resource_type: resource_type.to_string(),
                resource_id: resource_id.to_string(),
                snapshot: Some(snapshot.clone()),
            });
        }

        tracing::debug!(
            resource_type = %resource_type,
            resource_id = %resource_id,
            matches = matches.len(),
            "Resource matched subscriptions"
        );
        matches.len()
    }

    /// Open a websocket session for an active websocket subscription.
    pub fn bind_session(
        &self,
        subscription_id: &str,
        format: Option<PayloadFormat>,
    ) -> SubscriptionResult<SessionHandle> {
        let record = self
            .registry
            .get(subscription_id)
            .ok_or_else(|| SubscriptionError::not_found(subscription_id))?;
        if record.channel.channel_type != ChannelType::WebSocket {
            return Err(SubscriptionError::validation(format!(
                "Subscription {subscription_id} is not a websocket subscription"
            )));
        }
        if !record.is_active() {
            return Err(SubscriptionError::validation(format!(
                "Subscription {subscription_id} is not active (status {})",
                record.status
            )));
        }
        self.confirm_bound(self.sessions.register(subscription_id, format))
    }

    /// Keep a freshly registered session only if its subscription is still
    /// deliverable over websocket.
    ///
    /// `delete` unregisters before closing sessions and binding registers
    /// before this check, so a session is either seen by the close or
    /// rejected here.
    fn confirm_bound(&self, handle: SessionHandle) -> SubscriptionResult<SessionHandle> {
        match self.registry.get(&handle.subscription_id) {
            Some(record)
                if record.is_active() && record.channel.channel_type == ChannelType::WebSocket =>
            {
                Ok(handle)
            }
            _ => {
                self.sessions.deregister(&handle.connection_id);
                Err(SubscriptionError::not_found(handle.subscription_id))
            }
        }
    }

    /// Open websocket sessions.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// In-process topics used by `message` subscriptions.
    pub fn message_bus(&self) -> &Arc<MessageBus> {
        &self.message_bus
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Stop all delivery workers. Queued notifications are discarded.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        tracing::info!("Subscription engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::SessionFrame;
    use octofhir_core::events::{DeliveryEventKind, SystemEvent};
    use serde_json::json;
    use std::time::Duration;

    fn engine(max_attempts: u32) -> SubscriptionEngine {
        let mut config = SubscriptionConfig::default();
        config.retry.max_attempts = max_attempts;
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 5;
        SubscriptionEngine::new(config, EventBroadcaster::new_shared()).unwrap()
    }

    fn websocket_subscription(criteria: &str) -> Value {
        json!({
            "resourceType": "Subscription",
            "status": "requested",
            "criteria": criteria,
            "channel": {"type": "websocket"}
        })
    }

    fn observation(id: &str, code: &str) -> Value {
        json!({
            "resourceType": "Observation",
            "id": id,
            "status": "final",
            "code": {"coding": [{"system": "SNOMED-CT", "code": code}]}
        })
    }

    async fn recv(handle: &mut SessionHandle) -> Option<SessionFrame> {
        tokio::time::timeout(Duration::from_millis(200), handle.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn reference_flow_sends_one_ping() {
        let engine = engine(3);
        let status = engine
            .create("5103", &websocket_subscription("Observation?code=SNOMED-CT|82313006"))
            .unwrap();
        assert_eq!(status, SubscriptionStatus::Active);

        let mut handle = engine.bind_session("5103", None).unwrap();

        assert_eq!(engine.on_resource_changed("Observation", "1", &observation("1", "82313006")), 1);
        assert_eq!(recv(&mut handle).await, Some(SessionFrame::Text("ping 5103".into())));

        assert_eq!(engine.on_resource_changed("Observation", "2", &observation("2", "8231")), 0);
        assert_eq!(recv(&mut handle).await, None);
    }

    #[tokio::test]
    async fn other_types_and_subscriptions_never_trigger() {
        let engine = engine(3);
        engine
            .create("s1", &websocket_subscription("Observation?status=final"))
            .unwrap();
        let patient = json!({"resourceType": "Patient", "id": "p1", "status": "final"});
        assert_eq!(engine.on_resource_changed("Patient", "p1", &patient), 0);
        assert_eq!(
            engine.on_resource_changed(
                "Subscription",
                "s2",
                &websocket_subscription("Observation?status=final")
            ),
            0
        );
        let deleted = ResourceEvent::deleted("Observation", "1");
        assert_eq!(engine.on_resource_written(&deleted), 0);
        let created = ResourceEvent::created("Observation", "1", observation("1", "x"));
        assert_eq!(engine.on_resource_written(&created), 1);
    }

    #[test]
    fn create_validates_and_honours_off() {
        let engine = engine(3);
        assert!(matches!(
            engine.create("bad", &websocket_subscription("Observation?bogus=1")),
            Err(SubscriptionError::Validation(_))
        ));
        assert!(engine.validate(&websocket_subscription("Observation?code=1")).is_ok());

        let mut off = websocket_subscription("Observation?code=1");
        off["status"] = json!("off");
        assert_eq!(engine.create("off", &off).unwrap(), SubscriptionStatus::Off);
        assert!(engine.get("off").is_none());
        assert_eq!(engine.on_resource_changed("Observation", "1", &observation("1", "1")), 0);
    }

    #[tokio::test]
    async fn delete_stops_delivery_and_closes_sessions() {
        let engine = engine(3);
        engine
            .create("s1", &websocket_subscription("Observation?code=1"))
            .unwrap();
        let mut handle = engine.bind_session("s1", None).unwrap();

        assert!(engine.delete("s1"));
        assert!(matches!(recv(&mut handle).await, Some(SessionFrame::Close(_))));
        assert_eq!(engine.on_resource_changed("Observation", "1", &observation("1", "1")), 0);
        assert!(!engine.delete("s1"));
        assert!(engine.bind_session("s1", None).is_err());
    }

    #[tokio::test]
    async fn deactivate_removes_from_matching() {
        let engine = engine(3);
        engine
            .create("s1", &websocket_subscription("Observation?code=1"))
            .unwrap();
        engine.deactivate("s1").unwrap();
        assert!(engine.status("s1").is_none());
        assert_eq!(engine.on_resource_changed("Observation", "1", &observation("1", "1")), 0);
        assert!(matches!(
            engine.deactivate("s1"),
            Err(SubscriptionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_replaces_criteria() {
        let engine = engine(3);
        engine
            .create("s1", &websocket_subscription("Observation?code=1"))
            .unwrap();
        engine
            .update("s1", &websocket_subscription("Observation?code=2"))
            .unwrap();
        assert_eq!(engine.on_resource_changed("Observation", "1", &observation("1", "1")), 0);
        assert_eq!(engine.on_resource_changed("Observation", "2", &observation("2", "2")), 1);

        let mut off = websocket_subscription("Observation?code=2");
        off["status"] = json!("off");
        assert_eq!(engine.update("s1", &off).unwrap(), SubscriptionStatus::Off);
        assert_eq!(engine.on_resource_changed("Observation", "3", &observation("3", "2")), 0);
    }

    #[tokio::test]
    async fn bind_requires_active_websocket_subscription() {
        let engine = engine(3);
        engine
            .create(
                "hook",
                &json!({
                    "resourceType": "Subscription",
                    "criteria": "Observation?code=1",
                    "channel": {"type": "rest-hook", "endpoint": "http://localhost/hook"}
                }),
            )
            .unwrap();
        assert!(matches!(
            engine.bind_session("hook", None),
            Err(SubscriptionError::Validation(_))
        ));
        assert!(matches!(
            engine.bind_session("missing", None),
            Err(SubscriptionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn socket_without_listener_exhausts_budget() {
        let engine = engine(2);
        let mut events = engine.events().subscribe();
        engine
            .create("s1", &websocket_subscription("Observation?code=1"))
            .unwrap();
        engine.on_resource_changed("Observation", "1", &observation("1", "1"));

        let mut failed = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            let SystemEvent::Delivery(event) = event else {
                continue;
            };
            match event.kind {
                DeliveryEventKind::AttemptFailed => failed += 1,
                DeliveryEventKind::StatusChanged => break,
                _ => {}
            }
        }
        assert_eq!(failed, 2);
        let (status, error) = engine.status("s1").unwrap();
        assert_eq!(status, SubscriptionStatus::Error);
        assert!(error.is_some());
        assert_eq!(engine.on_resource_changed("Observation", "2", &observation("2", "1")), 0);
    }

    #[test]
    fn disabled_engine_ignores_writes() {
        let config = SubscriptionConfig {
            enabled: false,
            ..Default::default()
        };
        let engine = SubscriptionEngine::new(config, EventBroadcaster::new_shared()).unwrap();
        engine
            .create("s1", &websocket_subscription("Observation?code=1"))
            .unwrap();
        assert_eq!(engine.on_resource_changed("Observation", "1", &observation("1", "1")), 0);
    }

    #[test]
    fn validate_requires_configured_message_topic() {
        let mut config = SubscriptionConfig::default();
        config.message.topics = vec!["lab-feed".into()];
        let engine = SubscriptionEngine::new(config, EventBroadcaster::new_shared()).unwrap();
        let message = |endpoint: &str| {
            json!({
                "resourceType": "Subscription",
                "criteria": "Observation?code=1",
                "channel": {"type": "message", "endpoint": endpoint}
            })
        };
        assert!(engine.validate(&message("lab-feed")).is_ok());
        assert!(matches!(
            engine.validate(&message("elsewhere")),
            Err(SubscriptionError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn update_keeps_delivery_order() {
        let mut config = SubscriptionConfig::default();
        config.retry.initial_backoff_ms = 100;
        config.retry.max_backoff_ms = 500;
        let engine = SubscriptionEngine::new(config, EventBroadcaster::new_shared()).unwrap();
        let mut events = engine.events().subscribe();
        let subscription = json!({
            "resourceType": "Subscription",
            "status": "requested",
            "criteria": "Observation?code=1",
            "channel": {"type": "message", "endpoint": "feed"}
        });
        engine.create("s1", &subscription).unwrap();

        assert_eq!(engine.on_resource_changed("Observation", "A", &observation("A", "1")), 1);
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SystemEvent::Delivery(event) = event {
                assert_eq!(event.kind, DeliveryEventKind::AttemptFailed);
                break;
            }
        }

        engine.update("s1", &subscription).unwrap();
        let mut consumer = engine.message_bus().subscribe("feed");
        assert_eq!(engine.on_resource_changed("Observation", "B", &observation("B", "1")), 1);

        let first = consumer.recv().await.unwrap();
        let second = consumer.recv().await.unwrap();
        assert_eq!(
            (first.resource_id.as_str(), second.resource_id.as_str()),
            ("A", "B")
        );
        assert_eq!(engine.status("s1").unwrap().0, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn session_registered_after_delete_is_discarded() {
        let engine = engine(3);
        engine
            .create("s1", &websocket_subscription("Observation?code=1"))
            .unwrap();
        let bound = engine.bind_session("s1", None).unwrap();
        assert!(engine.confirm_bound(bound).is_ok());

        // Delete completes between the bind check and session registration.
        engine.delete("s1");
        let late = engine.sessions().register("s1", None);
        assert!(matches!(
            engine.confirm_bound(late),
            Err(SubscriptionError::NotFound(_))
        ));
        assert_eq!(engine.sessions().session_count("s1"), 0);
    }
}
