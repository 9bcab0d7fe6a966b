//! Notification delivery channels.
//!
//! Channels form a closed set selected by [`ChannelType`]:
//! - websocket (live sessions held by the [`SessionManager`])
//! - rest-hook (HTTP POST)
//! - email (SMTP)
//! - message (in-process [`MessageBus`])

pub mod email;
pub mod message;
pub mod rest_hook;
pub mod websocket;

pub use email::EmailChannel;
pub use message::{MessageBus, MessageChannel};
pub use rest_hook::RestHookChannel;
pub use websocket::{SessionFrame, SessionHandle, SessionManager, WebSocketChannel};

use std::fmt;

use async_trait::async_trait;

use crate::types::{ChannelType, Notification, SubscriptionRecord};

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure; the dispatcher retries within the budget
    Retryable(String),
    /// Permanent failure; the subscription moves to error without retry
    Fatal(String),
}

impl DeliveryOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => f.write_str("delivered"),
            Self::Retryable(reason) => write!(f, "retryable: {reason}"),
            Self::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// A notification transport.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Channel name for logging and events.
    fn name(&self) -> &str;

    /// Attempt to deliver one notification for `subscription`.
    async fn deliver(
        &self,
        subscription: &SubscriptionRecord,
        notification: &Notification,
    ) -> DeliveryOutcome;
}

/// One implementation per channel type.
pub struct ChannelSet {
    pub websocket: WebSocketChannel,
    pub rest_hook: RestHookChannel,
    /// `None` when SMTP is not configured
    pub email: Option<EmailChannel>,
    pub message: MessageChannel,
}

impl ChannelSet {
    /// Route to the channel named by the record's descriptor.
    pub async fn deliver(
        &self,
        subscription: &SubscriptionRecord,
        notification: &Notification,
    ) -> DeliveryOutcome {
        match subscription.channel.channel_type {
            ChannelType::WebSocket => self.websocket.deliver(subscription, notification).await,
            ChannelType::RestHook => self.rest_hook.deliver(subscription, notification).await,
            ChannelType::Email => match &self.email {
                Some(email) => email.deliver(subscription, notification).await,
                None => DeliveryOutcome::fatal("email delivery is not configured"),
            },
            ChannelType::Message => self.message.deliver(subscription, notification).await,
        }
    }
}
