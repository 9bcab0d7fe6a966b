//! Subscription error types.

use octofhir_core::CoreError;
use thiserror::Error;

use crate::types::SubscriptionStatus;

/// Result type for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Errors raised by subscription administration.
///
/// Delivery failures are not errors; they are reported as
/// [`DeliveryOutcome`](crate::delivery::DeliveryOutcome) values and surface
/// through the subscription status and the event stream.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Malformed criteria or channel descriptor
    #[error("Validation error: {0}")]
    Validation(String),

    /// A record with this id is already registered
    #[error("Subscription already registered: {0}")]
    DuplicateId(String),

    #[error("Subscription not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for subscription {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    /// A delivery channel could not be constructed from configuration
    #[error("Delivery channel error: {0}")]
    Delivery(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SubscriptionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Whether the error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::DuplicateId(_)
                | Self::NotFound(_)
                | Self::InvalidTransition { .. }
        )
    }
}

impl From<CoreError> for SubscriptionError {
    fn from(e: CoreError) -> Self {
        if e.is_client_error() {
            Self::Validation(e.to_string())
        } else {
            Self::Serialization(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors() {
        assert!(SubscriptionError::validation("bad criteria").is_client_error());
        assert!(SubscriptionError::DuplicateId("1".into()).is_client_error());
        assert!(!SubscriptionError::Delivery("tls".into()).is_client_error());
    }

    #[test]
    fn transition_message_names_both_states() {
        let err = SubscriptionError::InvalidTransition {
            id: "5103".into(),
            from: SubscriptionStatus::Off,
            to: SubscriptionStatus::Active,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for subscription 5103: off -> active"
        );
    }

    #[test]
    fn core_errors_map_by_category() {
        let err: SubscriptionError = CoreError::invalid_resource("not an object").into();
        assert!(matches!(err, SubscriptionError::Validation(_)));
    }
}
