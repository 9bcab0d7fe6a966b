use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `[subscriptions]` section of the server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// When false, subscriptions are still stored but never matched
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rest_hook: RestHookConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub message: MessageConfig,
    /// SMTP settings; email channels fail fatally when absent
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            retry: RetryConfig::default(),
            rest_hook: RestHookConfig::default(),
            websocket: WebSocketConfig::default(),
            message: MessageConfig::default(),
            email: None,
        }
    }
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.retry.max_attempts == 0 {
            return Err("subscriptions.retry.max_attempts must be >= 1".into());
        }
        if !(self.retry.backoff_factor >= 1.0) {
            return Err("subscriptions.retry.backoff_factor must be >= 1.0".into());
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(
                "subscriptions.retry.max_backoff_ms must be >= initial_backoff_ms".into(),
            );
        }
        if self.rest_hook.timeout_ms == 0 || self.rest_hook.connect_timeout_ms == 0 {
            return Err("subscriptions.rest_hook timeouts must be > 0".into());
        }
        if self.websocket.outbound_buffer == 0 {
            return Err("subscriptions.websocket.outbound_buffer must be >= 1".into());
        }
        if self.message.topics.iter().any(|t| t.trim().is_empty()) {
            return Err("subscriptions.message.topics must not contain empty names".into());
        }
        if let Some(email) = &self.email {
            if email.smtp_host.trim().is_empty() {
                return Err("subscriptions.email.smtp_host must not be empty".into());
            }
            if email.from.trim().is_empty() {
                return Err("subscriptions.email.from must not be empty".into());
            }
        }
        Ok(())
    }
}

/// Retry budget and backoff for retryable delivery failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per notification, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestHookConfig {
    #[serde(default = "default_rest_hook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_rest_hook_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RestHookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_rest_hook_timeout_ms(),
            connect_timeout_ms: default_rest_hook_connect_timeout_ms(),
        }
    }
}

impl RestHookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Frames buffered per session before the session counts as unreachable
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Interval for protocol-level Ping frames; 0 disables the heartbeat
    #[serde(default)]
    pub heartbeat_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            heartbeat_secs: 0,
        }
    }
}

impl WebSocketConfig {
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }
}

/// In-process topics for `message` subscriptions.
///
/// The server attaches a consumer to every listed topic at startup, and only
/// these topics are accepted as `message` endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageConfig {
    #[serde(default)]
    pub topics: Vec<String>,
}

impl MessageConfig {
    pub fn has_topic(&self, endpoint: &str) -> bool {
        self.topics.iter().any(|t| t == endpoint)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
}

fn default_enabled() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_rest_hook_timeout_ms() -> u64 {
    30_000
}
fn default_rest_hook_connect_timeout_ms() -> u64 {
    10_000
}
fn default_outbound_buffer() -> usize {
    32
}
fn default_smtp_port() -> u16 {
    587
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = SubscriptionConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.websocket.heartbeat().is_none());
    }

    #[test]
    fn rejects_zero_attempts_and_small_factor() {
        let mut cfg = SubscriptionConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().unwrap_err().contains("max_attempts"));

        let mut cfg = SubscriptionConfig::default();
        cfg.retry.backoff_factor = 0.5;
        assert!(cfg.validate().unwrap_err().contains("backoff_factor"));
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let cfg: SubscriptionConfig =
            serde_json::from_value(serde_json::json!({"retry": {"max_attempts": 5}})).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.initial_backoff_ms, 500);
        assert_eq!(cfg.websocket.outbound_buffer, 32);
    }

    #[test]
    fn email_requires_host_and_sender() {
        let mut cfg = SubscriptionConfig::default();
        cfg.email = Some(EmailConfig {
            smtp_host: "".into(),
            smtp_port: 25,
            username: None,
            password: None,
            from: "fhir@example.org".into(),
        });
        assert!(cfg.validate().is_err());
    }
}
