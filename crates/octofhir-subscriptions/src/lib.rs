//! Criteria-based FHIR subscriptions.
//!
//! Resource writes are matched against active subscriptions and turned into
//! notifications, delivered over websocket, rest-hook, email or an in-process
//! message bus. [`SubscriptionEngine`] is the entry point for the REST layer.

pub mod config;
pub mod criteria;
pub mod delivery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod registry;
pub mod retry;
pub mod types;

pub use config::{
    EmailConfig, MessageConfig, RestHookConfig, RetryConfig, SubscriptionConfig, WebSocketConfig,
};
pub use criteria::{Comparator, CriteriaPredicate};
pub use delivery::{
    DeliveryChannel, DeliveryOutcome, MessageBus, SessionFrame, SessionHandle, SessionManager,
};
pub use engine::SubscriptionEngine;
pub use error::{SubscriptionError, SubscriptionResult};
pub use registry::SubscriptionRegistry;
pub use types::{
    ChannelDescriptor, ChannelType, Notification, PayloadFormat, SubscriptionRecord,
    SubscriptionStatus,
};
