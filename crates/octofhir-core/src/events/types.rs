//! Event types for the resource and delivery event stream.
//!
//! - `ResourceEvent` - a durably persisted FHIR resource change
//! - `DeliveryEvent` - an outcome reported by the subscription dispatcher
//! - `SystemEvent` - unified enum carried by the broadcaster

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// ============================================================================
// Resource Events
// ============================================================================

/// Type of resource change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceEventType {
    /// Resource was created
    Created,
    /// Resource was updated
    Updated,
    /// Resource was deleted
    Deleted,
}

impl ResourceEventType {
    /// Returns the string representation of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceEventType::Created => "created",
            ResourceEventType::Updated => "updated",
            ResourceEventType::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ResourceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event representing a change to a FHIR resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Type of change (created, updated, deleted)
    pub event_type: ResourceEventType,
    /// FHIR resource type (e.g., "Patient", "Observation")
    pub resource_type: String,
    /// Resource ID
    pub resource_id: String,
    /// Version ID if available
    pub version_id: Option<i64>,
    /// The resource data as JSON (None for deletions)
    pub resource: Option<serde_json::Value>,
    /// Timestamp of the event
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ResourceEvent {
    /// Create a new resource event.
    pub fn new(
        event_type: ResourceEventType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            version_id: None,
            resource,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Create a "created" event.
    pub fn created(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: serde_json::Value,
    ) -> Self {
        Self::new(
            ResourceEventType::Created,
            resource_type,
            resource_id,
            Some(resource),
        )
    }

    /// Create an "updated" event.
    pub fn updated(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: serde_json::Value,
    ) -> Self {
        Self::new(
            ResourceEventType::Updated,
            resource_type,
            resource_id,
            Some(resource),
        )
    }

    /// Create a "deleted" event.
    pub fn deleted(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self::new(ResourceEventType::Deleted, resource_type, resource_id, None)
    }

    /// Set the version ID.
    pub fn with_version(mut self, version_id: i64) -> Self {
        self.version_id = Some(version_id);
        self
    }

    /// `Type/id` reference for the changed resource.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }
}

// ============================================================================
// Delivery Events
// ============================================================================

/// Kind of delivery outcome reported by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventKind {
    /// The channel accepted the notification
    Delivered,
    /// A retryable failure; another attempt may follow
    AttemptFailed,
    /// A fatal failure; no retry, subscription moves to error
    Rejected,
    /// The retry budget ran out; subscription moves to error
    Exhausted,
    /// The subscription status changed as a consequence of delivery
    StatusChanged,
    /// A queued notification was discarded because its subscription is no longer active
    Dropped,
}

impl DeliveryEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::AttemptFailed => "attempt_failed",
            Self::Rejected => "rejected",
            Self::Exhausted => "exhausted",
            Self::StatusChanged => "status_changed",
            Self::Dropped => "dropped",
        }
    }

    /// Whether this kind signals a problem worth a warning in the logs.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::AttemptFailed | Self::Rejected | Self::Exhausted
        )
    }
}

impl std::fmt::Display for DeliveryEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Observability event emitted for each notification delivery step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub kind: DeliveryEventKind,
    pub subscription_id: String,
    /// Channel type code (`websocket`, `rest-hook`, ...)
    pub channel: String,
    /// `Type/id` of the resource that triggered the notification, if any
    pub focus: Option<String>,
    /// 1-based attempt number for the notification
    pub attempt: u32,
    /// Failure reason or new status description
    pub reason: Option<String>,
    /// New subscription status for `StatusChanged`
    pub status: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl DeliveryEvent {
    pub fn new(
        kind: DeliveryEventKind,
        subscription_id: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            subscription_id: subscription_id.into(),
            channel: channel.into(),
            focus: None,
            attempt: 0,
            reason: None,
            status: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.focus = Some(focus.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

// ============================================================================
// System Event (Unified)
// ============================================================================

/// Unified event enum combining all event types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// A FHIR resource was created, updated, or deleted
    Resource(ResourceEvent),
    /// The subscription dispatcher reported a delivery outcome
    Delivery(DeliveryEvent),
}

impl SystemEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            SystemEvent::Resource(e) => e.timestamp,
            SystemEvent::Delivery(e) => e.timestamp,
        }
    }

    /// Get the resource event if this is a resource event.
    pub fn as_resource(&self) -> Option<&ResourceEvent> {
        match self {
            SystemEvent::Resource(e) => Some(e),
            _ => None,
        }
    }

    /// Get the delivery event if this is a delivery event.
    pub fn as_delivery(&self) -> Option<&DeliveryEvent> {
        match self {
            SystemEvent::Delivery(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ResourceEvent> for SystemEvent {
    fn from(event: ResourceEvent) -> Self {
        SystemEvent::Resource(event)
    }
}

impl From<DeliveryEvent> for SystemEvent {
    fn from(event: DeliveryEvent) -> Self {
        SystemEvent::Delivery(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_event_created() {
        let event = ResourceEvent::created("Observation", "42", serde_json::json!({"id": "42"}));
        assert_eq!(event.event_type, ResourceEventType::Created);
        assert_eq!(event.resource_type, "Observation");
        assert_eq!(event.reference(), "Observation/42");
        assert!(event.resource.is_some());
    }

    #[test]
    fn test_deleted_event_has_no_body() {
        let event = ResourceEvent::deleted("Observation", "42").with_version(3);
        assert_eq!(event.event_type, ResourceEventType::Deleted);
        assert!(event.resource.is_none());
        assert_eq!(event.version_id, Some(3));
    }

    #[test]
    fn test_delivery_event_builder() {
        let event = DeliveryEvent::new(DeliveryEventKind::AttemptFailed, "sub-1", "websocket")
            .with_focus("Observation/1")
            .with_attempt(2)
            .with_reason("no open sessions");
        assert_eq!(event.attempt, 2);
        assert_eq!(event.focus.as_deref(), Some("Observation/1"));
        assert!(event.kind.is_failure());
        assert!(!DeliveryEventKind::Delivered.is_failure());
    }

    #[test]
    fn test_system_event_from() {
        let system_event: SystemEvent =
            DeliveryEvent::new(DeliveryEventKind::Delivered, "sub-1", "message").into();
        assert!(system_event.as_delivery().is_some());
        assert!(system_event.as_resource().is_none());
    }

    #[test]
    fn test_event_serialization() {
        let event = SystemEvent::from(ResourceEvent::created(
            "Patient",
            "123",
            serde_json::json!({"id": "123"}),
        ));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "resource");
        let parsed: SystemEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.as_resource().unwrap().resource_id, "123");
    }
}
