//! Notification dispatcher.
//!
//! Each subscription gets one delivery worker fed by an unbounded FIFO queue.
//! Hand-off from the write path is a non-blocking enqueue; retries, backoff
//! and status changes happen inside the worker, so per-subscription order is
//! the order in which notifications were enqueued.
//!
//! A retired worker keeps draining its queue. A successor spawned for the
//! same id waits for it to finish first, so at most one worker delivers for
//! a subscription at any time.
//!
//! ```text
//! on_resource_written ──► dispatch(n) ──► queue[sub] ──► worker[sub]
//!                                                          │  check ACTIVE
//!                                                          │  ChannelSet::deliver
//!                                                          │  retry / backoff
//!                                                          └► DeliveryEvent
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use octofhir_core::events::{DeliveryEvent, DeliveryEventKind, EventBroadcaster};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::delivery::{ChannelSet, DeliveryOutcome};
use crate::registry::SubscriptionRegistry;
use crate::retry::RetryPolicy;
use crate::types::{Notification, SubscriptionRecord, SubscriptionStatus};

struct Shared {
    registry: Arc<SubscriptionRegistry>,
    channels: Arc<ChannelSet>,
    policy: RetryPolicy,
    events: Arc<EventBroadcaster>,
}

/// Delivery worker of one subscription.
///
/// A retired worker has no sender; its task keeps draining what was queued
/// before retirement.
#[derive(Default)]
struct Worker {
    sender: Option<mpsc::UnboundedSender<Notification>>,
    task: Option<JoinHandle<()>>,
}

impl Worker {
    fn is_live(&self) -> bool {
        self.sender.is_some() || self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: DashMap<String, Worker>,
}

impl Dispatcher {
    /// Create a dispatcher. Workers are spawned lazily on first dispatch.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        channels: Arc<ChannelSet>,
        policy: RetryPolicy,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                channels,
                policy,
                events,
            }),
            workers: DashMap::new(),
        }
    }

    /// Queue a notification for its subscription's worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, notification: Notification) {
        let subscription_id = notification.subscription_id.clone();
        let mut pending = Some(notification);

        // A worker only exits once its sender is gone, so one respawn suffices.
        for _ in 0..2 {
            let Some(notification) = pending.take() else {
                return;
            };
            let sender = {
                let mut worker = self.workers.entry(subscription_id.clone()).or_default();
                match worker.sender.clone() {
                    Some(sender) => sender,
                    None => {
                        // Successor of a retired worker starts once it has drained.
                        let predecessor = worker.task.take();
                        let (sender, task) = self.spawn_worker(&subscription_id, predecessor);
                        *worker = Worker {
                            sender: Some(sender.clone()),
                            task: Some(task),
                        };
                        sender
                    }
                }
            };
            match sender.send(notification) {
                Ok(()) => return,
                Err(mpsc::error::SendError(notification)) => {
                    self.workers.remove_if(&subscription_id, |_, w| {
                        w.sender.as_ref().is_some_and(|s| s.same_channel(&sender))
                    });
                    pending = Some(notification);
                }
            }
        }
        tracing::error!(
            subscription_id = %subscription_id,
            "Failed to hand off notification to delivery worker"
        );
    }

    /// Stop the worker of a subscription after it drains its queue.
    ///
    /// Queued notifications are dropped by the worker if the subscription is
    /// no longer active. A later dispatch for the same id starts a new worker
    /// that waits for this one.
    pub fn retire(&self, subscription_id: &str) {
        if let Some(mut worker) = self.workers.get_mut(subscription_id) {
            worker.sender = None;
        }
        self.workers.retain(|_, worker| worker.is_live());
    }

    /// Number of subscriptions with an open worker queue.
    pub fn worker_count(&self) -> usize {
        self.workers.iter().filter(|w| w.sender.is_some()).count()
    }

    /// Close every worker queue.
    pub fn shutdown(&self) {
        self.workers.clear();
    }

    fn spawn_worker(
        &self,
        subscription_id: &str,
        predecessor: Option<JoinHandle<()>>,
    ) -> (mpsc::UnboundedSender<Notification>, JoinHandle<()>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let subscription_id = subscription_id.to_string();
        let task = tokio::spawn(async move {
            if let Some(predecessor) = predecessor {
                let _ = predecessor.await;
            }
            tracing::debug!(subscription_id = %subscription_id, "Delivery worker started");
            run_worker(shared, rx).await;
            tracing::debug!(subscription_id = %subscription_id, "Delivery worker stopped");
        });
        (sender, task)
    }
}

async fn run_worker(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        deliver_with_retry(&shared, &notification).await;
    }
}

async fn deliver_with_retry(shared: &Shared, notification: &Notification) {
    let mut attempt = 1;
    loop {
        // Re-read before every attempt: deletion or an error status stops delivery.
        let record = match shared.registry.get(&notification.subscription_id) {
            Some(record) if record.is_active() => record,
            other => {
                let channel = other
                    .as_ref()
                    .map(|r| r.channel.channel_type.as_str())
                    .unwrap_or("unknown");
                shared.events.send_delivery(
                    event(DeliveryEventKind::Dropped, notification, channel, attempt)
                        .with_reason("subscription is no longer active"),
                );
                return;
            }
        };
        let channel = record.channel.channel_type.as_str();

        match shared.channels.deliver(&record, notification).await {
            DeliveryOutcome::Delivered => {
                shared
                    .events
                    .send_delivery(event(DeliveryEventKind::Delivered, notification, channel, attempt));
                return;
            }
            DeliveryOutcome::Retryable(reason) if shared.policy.should_retry(attempt) => {
                shared.events.send_delivery(
                    event(DeliveryEventKind::AttemptFailed, notification, channel, attempt)
                        .with_reason(reason),
                );
                tokio::time::sleep(shared.policy.delay_after(attempt)).await;
                attempt += 1;
            }
            DeliveryOutcome::Retryable(reason) => {
                shared.events.send_delivery(
                    event(DeliveryEventKind::AttemptFailed, notification, channel, attempt)
                        .with_reason(reason.clone()),
                );
                let reason = format!("delivery failed after {attempt} attempts: {reason}");
                shared.events.send_delivery(
                    event(DeliveryEventKind::Exhausted, notification, channel, attempt)
                        .with_reason(reason.clone()),
                );
                mark_error(shared, &record, notification, attempt, reason);
                return;
            }
            DeliveryOutcome::Fatal(reason) => {
                shared.events.send_delivery(
                    event(DeliveryEventKind::Rejected, notification, channel, attempt)
                        .with_reason(reason.clone()),
                );
                mark_error(shared, &record, notification, attempt, reason);
                return;
            }
        }
    }
}

fn mark_error(
    shared: &Shared,
    record: &Arc<SubscriptionRecord>,
    notification: &Notification,
    attempt: u32,
    reason: String,
) {
    let channel = record.channel.channel_type.as_str();
    if shared.registry.mark_error_if_current(record, reason.clone()) {
        shared.events.send_delivery(
            event(DeliveryEventKind::StatusChanged, notification, channel, attempt)
                .with_status(SubscriptionStatus::Error.as_str())
                .with_reason(reason),
        );
    } else {
        // Updated, deleted or deactivated while the attempt was in flight.
        tracing::debug!(
            subscription_id = %record.id,
            "Subscription changed before it could be marked as error"
        );
    }
}

fn event(
    kind: DeliveryEventKind,
    notification: &Notification,
    channel: &str,
    attempt: u32,
) -> DeliveryEvent {
    DeliveryEvent::new(kind, &notification.subscription_id, channel)
        .with_focus(notification.focus())
        .with_attempt(attempt)
}
