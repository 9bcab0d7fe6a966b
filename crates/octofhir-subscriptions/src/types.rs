//! Subscription record model and its mapping from FHIR `Subscription` resources.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::criteria::CriteriaPredicate;
use crate::error::{SubscriptionError, SubscriptionResult};

// =============================================================================
// STATUS / CHANNEL ENUMS
// =============================================================================

/// Lifecycle status of a subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Requested,
    Active,
    Error,
    Off,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Error => "error",
            Self::Off => "off",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "requested" => Some(Self::Requested),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery mechanism of a subscription. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    #[serde(rename = "websocket")]
    WebSocket,
    RestHook,
    Email,
    Message,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::RestHook => "rest-hook",
            Self::Email => "email",
            Self::Message => "message",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "websocket" => Some(Self::WebSocket),
            "rest-hook" => Some(Self::RestHook),
            "email" => Some(Self::Email),
            "message" => Some(Self::Message),
            _ => None,
        }
    }

    /// Whether the channel needs `channel.endpoint`.
    pub fn requires_endpoint(&self) -> bool {
        !matches!(self, Self::WebSocket)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding of the notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Json,
    Xml,
    /// No resource body; the notification only names the subscription
    IdOnly,
}

impl PayloadFormat {
    /// Map `channel.payload`; an absent payload means id-only notifications.
    pub fn from_mime(mime: Option<&str>) -> SubscriptionResult<Self> {
        let Some(mime) = mime.map(str::trim).filter(|m| !m.is_empty()) else {
            return Ok(Self::IdOnly);
        };
        let base = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match base.as_str() {
            "application/fhir+json" | "application/json+fhir" | "application/json" | "json" => {
                Ok(Self::Json)
            }
            "application/fhir+xml" | "application/xml+fhir" | "application/xml" | "xml" => {
                Ok(Self::Xml)
            }
            _ => Err(SubscriptionError::validation(format!(
                "Unsupported channel.payload '{mime}'"
            ))),
        }
    }

    /// Parse a session-level `_format` preference (`json`, `xml`, `id`).
    pub fn from_format_param(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "id" | "id_only" | "ping" => Some(Self::IdOnly),
            other => Self::from_mime(Some(other)).ok(),
        }
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Self::Json => Some("application/fhir+json;charset=utf-8"),
            Self::Xml => Some("application/fhir+xml;charset=utf-8"),
            Self::IdOnly => None,
        }
    }
}

// =============================================================================
// SUBSCRIPTION RECORD
// =============================================================================

/// Where and how notifications for a subscription are delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub channel_type: ChannelType,
    /// URL, address or bus name; empty for websocket
    pub endpoint: String,
    pub payload_format: PayloadFormat,
    /// Extra `Name: value` headers for rest-hook delivery
    pub headers: Vec<String>,
}

/// A subscription as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub id: String,
    pub criteria: CriteriaPredicate,
    pub channel: ChannelDescriptor,
    pub status: SubscriptionStatus,
    /// Last delivery failure, set when the status is `Error`
    pub error: Option<String>,
}

impl SubscriptionRecord {
    pub fn new(id: impl Into<String>, criteria: CriteriaPredicate, channel: ChannelDescriptor) -> Self {
        Self {
            id: id.into(),
            criteria,
            channel,
            status: SubscriptionStatus::Requested,
            error: None,
        }
    }

    /// Build a record from a FHIR `Subscription` resource.
    ///
    /// Accepted statuses at the boundary are `requested`, `active` and `off`;
    /// `error` is owned by the engine and cannot be requested by clients.
    pub fn from_resource(id: &str, resource: &Value) -> SubscriptionResult<Self> {
        let object = resource
            .as_object()
            .ok_or_else(|| SubscriptionError::validation("Subscription must be a JSON object"))?;
        if object.get("resourceType").and_then(Value::as_str) != Some("Subscription") {
            return Err(SubscriptionError::validation(
                "resourceType must be 'Subscription'",
            ));
        }

        let criteria = object
            .get("criteria")
            .and_then(Value::as_str)
            .ok_or_else(|| SubscriptionError::validation("Subscription.criteria is required"))?;
        let criteria = CriteriaPredicate::parse(criteria)?;

        let status = match object.get("status").and_then(Value::as_str) {
            None => SubscriptionStatus::Requested,
            Some(code) => match SubscriptionStatus::parse(code) {
                Some(SubscriptionStatus::Error) | None => {
                    return Err(SubscriptionError::validation(format!(
                        "Subscription.status '{code}' cannot be set by clients"
                    )));
                }
                Some(status) => status,
            },
        };

        let channel = object
            .get("channel")
            .and_then(Value::as_object)
            .ok_or_else(|| SubscriptionError::validation("Subscription.channel is required"))?;
        let channel_code = channel
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SubscriptionError::validation("Subscription.channel.type is required"))?;
        let channel_type = ChannelType::parse(channel_code).ok_or_else(|| {
            SubscriptionError::validation(format!(
                "Unsupported Subscription.channel.type '{channel_code}'"
            ))
        })?;

        let endpoint = channel
            .get("endpoint")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if channel_type.requires_endpoint() && endpoint.is_empty() {
            return Err(SubscriptionError::validation(format!(
                "Subscription.channel.endpoint is required for {channel_type} channels"
            )));
        }

        let payload_format =
            PayloadFormat::from_mime(channel.get("payload").and_then(Value::as_str))?;

        let headers = match channel.get("header") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(single)) => vec![single.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|h| {
                    h.as_str().map(str::to_string).ok_or_else(|| {
                        SubscriptionError::validation("Subscription.channel.header must be strings")
                    })
                })
                .collect::<SubscriptionResult<Vec<_>>>()?,
            Some(_) => {
                return Err(SubscriptionError::validation(
                    "Subscription.channel.header must be strings",
                ));
            }
        };

        Ok(Self {
            id: id.to_string(),
            criteria,
            channel: ChannelDescriptor {
                channel_type,
                endpoint,
                payload_format,
                headers,
            },
            status,
            error: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

// =============================================================================
// NOTIFICATION
// =============================================================================

/// One match, produced per resource write and subscription. Not persisted.
#[derive(Debug, Clone)]
pub struct Notification {
    pub subscription_id: String,
    pub resource_type: String,
    pub resource_id: String,
    /// Resource as written; shared between all notifications of one write
    pub snapshot: Option<Arc<Value>>,
}

impl Notification {
    /// `Type/id` of the resource that triggered the notification.
    pub fn focus(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }

    /// Encode the resource snapshot. `None` for id-only payloads.
    pub fn encode(&self, format: PayloadFormat) -> SubscriptionResult<Option<String>> {
        let body = match format {
            PayloadFormat::IdOnly => return Ok(None),
            PayloadFormat::Json => serde_json::to_string(self.snapshot()?)?,
            PayloadFormat::Xml => octofhir_core::to_fhir_xml(self.snapshot()?)?,
        };
        Ok(Some(body))
    }

    fn snapshot(&self) -> SubscriptionResult<&Value> {
        self.snapshot.as_deref().ok_or_else(|| {
            SubscriptionError::Serialization(format!(
                "notification for {} carries no resource",
                self.focus()
            ))
        })
    }
}
