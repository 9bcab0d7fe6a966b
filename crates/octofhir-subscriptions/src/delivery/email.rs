//! Email delivery channel over SMTP.
//!
//! The endpoint is `mailto:<address>` or a bare address.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{DeliveryChannel, DeliveryOutcome};
use crate::config::EmailConfig;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{Notification, SubscriptionRecord};

pub struct EmailChannel {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailChannel {
    /// Build the SMTP transport from configuration.
    pub fn new(config: &EmailConfig) -> SubscriptionResult<Self> {
        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| SubscriptionError::Delivery(format!("invalid sender address: {e}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .map_err(|e| SubscriptionError::Delivery(format!("invalid SMTP relay: {e}")))?
            .port(config.smtp_port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }

    fn recipient(endpoint: &str) -> Result<Mailbox, String> {
        let address = endpoint.strip_prefix("mailto:").unwrap_or(endpoint).trim();
        address
            .parse::<Mailbox>()
            .map_err(|e| format!("invalid email endpoint '{endpoint}': {e}"))
    }

    fn subject(notification: &Notification) -> String {
        format!("FHIR Subscription Notification: {}", notification.focus())
    }

    fn body(subscription: &SubscriptionRecord, notification: &Notification) -> Result<String, String> {
        let summary = format!(
            "Subscription: {}\nCriteria: {}\nResource: {}\n",
            subscription.id,
            subscription.criteria,
            notification.focus()
        );
        match notification
            .encode(subscription.channel.payload_format)
            .map_err(|e| e.to_string())?
        {
            Some(payload) => Ok(format!("{summary}\n{payload}\n")),
            None => Ok(summary),
        }
    }
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(
        &self,
        subscription: &SubscriptionRecord,
        notification: &Notification,
    ) -> DeliveryOutcome {
        let to = match Self::recipient(&subscription.channel.endpoint) {
            Ok(to) => to,
            Err(reason) => return DeliveryOutcome::Fatal(reason),
        };
        let body = match Self::body(subscription, notification) {
            Ok(body) => body,
            Err(reason) => return DeliveryOutcome::Fatal(reason),
        };
        let message = match Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(Self::subject(notification))
            .header(ContentType::TEXT_PLAIN)
            .body(body)
        {
            Ok(message) => message,
            Err(e) => return DeliveryOutcome::fatal(e.to_string()),
        };

        match self.mailer.send(message).await {
            Ok(_) => DeliveryOutcome::Delivered,
            Err(e) if e.is_permanent() => DeliveryOutcome::fatal(e.to_string()),
            Err(e) => {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "SMTP delivery failed"
                );
                DeliveryOutcome::retryable(e.to_string())
            }
        }
    }
}
