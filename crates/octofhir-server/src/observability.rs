// Tracing initialization with a reloadable log level, plus the delivery event
// logger and the consumers of configured message topics.
use std::sync::{Arc, OnceLock};

use octofhir_core::events::{DeliveryEvent, EventBroadcaster, SystemEvent};
use octofhir_subscriptions::SubscriptionEngine;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    // Prefer RUST_LOG from env, otherwise use provided level string.
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer())
        .try_init();
}

/// Apply the configured level unless `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let _ = handle.modify(|f| {
            *f = EnvFilter::new(level);
        });
    }
}

/// Log every delivery event published on the broadcaster.
///
/// Failures are logged at warn, everything else at info/debug. The task ends
/// when the broadcaster is dropped.
pub fn spawn_delivery_logger(events: &Arc<EventBroadcaster>) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SystemEvent::Delivery(event)) => log_delivery(&event),
                Ok(SystemEvent::Resource(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Delivery event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_delivery(event: &DeliveryEvent) {
    let focus = event.focus.as_deref().unwrap_or("-");
    let reason = event.reason.as_deref().unwrap_or("");
    if event.kind.is_failure() {
        tracing::warn!(
            subscription_id = %event.subscription_id,
            channel = %event.channel,
            kind = %event.kind,
            focus,
            attempt = event.attempt,
            reason,
            "Subscription delivery failed"
        );
    } else if event.status.is_some() {
        tracing::info!(
            subscription_id = %event.subscription_id,
            status = event.status.as_deref().unwrap_or(""),
            reason,
            "Subscription status changed by delivery"
        );
    } else {
        tracing::debug!(
            subscription_id = %event.subscription_id,
            channel = %event.channel,
            kind = %event.kind,
            focus,
            attempt = event.attempt,
            "Subscription delivery event"
        );
    }
}

/// Attach a logging consumer to every configured message topic.
///
/// Each task ends when the engine's message bus is dropped.
pub fn spawn_message_consumers(engine: &SubscriptionEngine) -> Vec<JoinHandle<()>> {
    engine
        .config()
        .message
        .topics
        .iter()
        .map(|topic| {
            let mut rx = engine.message_bus().subscribe(topic);
            let topic = topic.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(notification) => tracing::info!(
                            topic = %topic,
                            subscription_id = %notification.subscription_id,
                            focus = %notification.focus(),
                            "Message notification received"
                        ),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(topic = %topic, skipped, "Message consumer lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        })
        .collect()
}
