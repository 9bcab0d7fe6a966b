//! REST-hook channel for HTTP POST notifications.
//!
//! Body is the encoded resource (empty for id-only payloads). Non-2xx
//! responses and transport failures are retryable; endpoints or headers that
//! can never work are fatal.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};

use super::{DeliveryChannel, DeliveryOutcome};
use crate::config::RestHookConfig;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{Notification, SubscriptionRecord};

pub const SUBSCRIPTION_ID_HEADER: &str = "x-subscription-id";

/// REST-hook delivery channel.
pub struct RestHookChannel {
    client: Client,
}

impl RestHookChannel {
    /// Build the HTTP client from configuration.
    pub fn new(config: &RestHookConfig) -> SubscriptionResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| SubscriptionError::Delivery(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, String> {
    let url = Url::parse(endpoint).map_err(|e| format!("malformed endpoint '{endpoint}': {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported endpoint scheme '{other}'")),
    }
}

/// Parse `Name: value` header lines.
fn parse_headers(lines: &[String]) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("invalid header '{line}', expected 'Name: value'"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| format!("invalid header name in '{line}': {e}"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| format!("invalid header value in '{line}': {e}"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl DeliveryChannel for RestHookChannel {
    fn name(&self) -> &str {
        "rest-hook"
    }

    async fn deliver(
        &self,
        subscription: &SubscriptionRecord,
        notification: &Notification,
    ) -> DeliveryOutcome {
        let endpoint = &subscription.channel.endpoint;
        let url = match parse_endpoint(endpoint) {
            Ok(url) => url,
            Err(reason) => return DeliveryOutcome::Fatal(reason),
        };
        let mut headers = match parse_headers(&subscription.channel.headers) {
            Ok(headers) => headers,
            Err(reason) => return DeliveryOutcome::Fatal(reason),
        };
        if let Ok(id) = HeaderValue::from_str(&subscription.id) {
            headers.insert(SUBSCRIPTION_ID_HEADER, id);
        }

        let format = subscription.channel.payload_format;
        let body = match notification.encode(format) {
            Ok(body) => body.unwrap_or_default(),
            Err(e) => return DeliveryOutcome::fatal(e.to_string()),
        };
        if let Some(content_type) = format.content_type() {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        let start = Instant::now();
        let response = self.client.post(url).headers(headers).body(body).send().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    endpoint = %endpoint,
                    status = resp.status().as_u16(),
                    elapsed_ms,
                    "REST-hook delivery succeeded"
                );
                DeliveryOutcome::Delivered
            }
            Ok(resp) => {
                let status = resp.status();
                tracing::debug!(
                    subscription_id = %subscription.id,
                    endpoint = %endpoint,
                    status = status.as_u16(),
                    elapsed_ms,
                    "REST-hook delivery failed with HTTP error"
                );
                DeliveryOutcome::Retryable(format!("HTTP {}", status.as_u16()))
            }
            Err(e) if e.is_builder() => DeliveryOutcome::Fatal(e.to_string()),
            Err(e) => {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    endpoint = %endpoint,
                    error = %e,
                    elapsed_ms,
                    "REST-hook delivery failed with network error"
                );
                DeliveryOutcome::Retryable(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(endpoint: &str, payload: Option<&str>, headers: &[&str]) -> SubscriptionRecord {
        let mut channel = json!({"type": "rest-hook", "endpoint": endpoint, "header": headers});
        if let Some(payload) = payload {
            channel["payload"] = json!(payload);
        }
        SubscriptionRecord::from_resource(
            "5103",
            &json!({
                "resourceType": "Subscription",
                "criteria": "Observation?code=82313006",
                "channel": channel
            }),
        )
        .unwrap()
    }

    fn notification() -> Notification {
        Notification {
            subscription_id: "5103".into(),
            resource_type: "Observation".into(),
            resource_id: "1".into(),
            snapshot: Some(Arc::new(
                json!({"resourceType": "Observation", "id": "1", "status": "final"}),
            )),
        }
    }

    fn channel() -> RestHookChannel {
        RestHookChannel::new(&RestHookConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn posts_encoded_resource() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-subscription-id", "5103"))
            .and(header("authorization", "Bearer abc"))
            .and(header("content-type", "application/fhir+json;charset=utf-8"))
            .and(body_string_contains("\"status\":\"final\""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let rec = record(
            &format!("{}/hook", server.uri()),
            Some("application/fhir+json"),
            &["Authorization: Bearer abc"],
        );
        assert_eq!(
            channel().deliver(&rec, &notification()).await,
            DeliveryOutcome::Delivered
        );
    }

    #[tokio::test]
    async fn id_only_sends_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let rec = record(&format!("{}/hook", server.uri()), None, &[]);
        assert_eq!(
            channel().deliver(&rec, &notification()).await,
            DeliveryOutcome::Delivered
        );
        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].body.is_empty());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let rec = record(&format!("{}/hook", server.uri()), None, &[]);
        assert_eq!(
            channel().deliver(&rec, &notification()).await,
            DeliveryOutcome::Retryable("HTTP 503".into())
        );
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        // Port 9 (discard) is not expected to be listening locally.
        let rec = record("http://127.0.0.1:9/hook", None, &[]);
        assert!(matches!(
            channel().deliver(&rec, &notification()).await,
            DeliveryOutcome::Retryable(_)
        ));
    }

    #[tokio::test]
    async fn malformed_endpoint_or_header_is_fatal() {
        let rec = record("not a url", None, &[]);
        assert!(matches!(
            channel().deliver(&rec, &notification()).await,
            DeliveryOutcome::Fatal(_)
        ));

        let rec = record("ftp://example.org/hook", None, &[]);
        assert!(matches!(
            channel().deliver(&rec, &notification()).await,
            DeliveryOutcome::Fatal(_)
        ));

        let rec = record("http://example.org/hook", None, &["no-colon-here"]);
        assert!(matches!(
            channel().deliver(&rec, &notification()).await,
            DeliveryOutcome::Fatal(_)
        ));
    }
}
