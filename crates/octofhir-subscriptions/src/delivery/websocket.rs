//! WebSocket channel and session manager.
//!
//! Protocol (text frames):
//! - client `bind <id>`, server `bound <id>` (or bound at upgrade time via query)
//! - server `ping <id>` for id-only notifications, otherwise the encoded resource
//! - server `Invalid bind request - <reason>` before closing a bad bind
//!
//! The socket task owns the connection; this module only holds the outbound
//! sender for each open session.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{DeliveryChannel, DeliveryOutcome};
use crate::error::SubscriptionResult;
use crate::types::{Notification, PayloadFormat, SubscriptionRecord};

/// Frame queued for a session's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFrame {
    Text(String),
    /// Close the connection with a reason (subscription deleted or deactivated)
    Close(String),
}

/// Id-only notification frame.
pub fn ping_frame(subscription_id: &str) -> String {
    format!("ping {subscription_id}")
}

/// Acknowledgement of a successful bind.
pub fn bound_frame(subscription_id: &str) -> String {
    format!("bound {subscription_id}")
}

/// Error frame sent before a rejected bind is closed.
pub fn invalid_bind_frame(reason: &str) -> String {
    format!("Invalid bind request - {reason}")
}

/// Extract the subscription id from a `bind <id>` frame.
pub fn parse_bind_request(text: &str) -> Result<&str, String> {
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((verb, id)) if verb.eq_ignore_ascii_case("bind") && !id.trim().is_empty() => {
            Ok(id.trim())
        }
        _ => Err(format!("Unable to parse '{text}', expected 'bind <subscription id>'")),
    }
}

struct Session {
    connection_id: String,
    connected_at: OffsetDateTime,
    /// Overrides the record's payload format for this session
    format: Option<PayloadFormat>,
    sender: mpsc::Sender<SessionFrame>,
}

/// Receiving side of a registered session, owned by the socket task.
pub struct SessionHandle {
    pub connection_id: String,
    pub subscription_id: String,
    pub receiver: mpsc::Receiver<SessionFrame>,
}

/// Public view of an open session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connection_id: String,
    pub connected_at: OffsetDateTime,
}

/// Maps subscription ids to their open sessions.
pub struct SessionManager {
    sessions: DashMap<String, Vec<Session>>,
    /// connection id -> subscription id
    connections: DashMap<String, String>,
    buffer: usize,
}

impl SessionManager {
    /// Create an empty manager. `buffer` is the outbound queue size per session.
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            connections: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Open a session for `subscription_id`.
    pub fn register(&self, subscription_id: &str, format: Option<PayloadFormat>) -> SessionHandle {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let connection_id = uuid::Uuid::new_v4().to_string();

        self.sessions
            .entry(subscription_id.to_string())
            .or_default()
            .push(Session {
                connection_id: connection_id.clone(),
                connected_at: OffsetDateTime::now_utc(),
                format,
                sender,
            });
        self.connections
            .insert(connection_id.clone(), subscription_id.to_string());

        tracing::debug!(
            subscription_id = %subscription_id,
            connection_id = %connection_id,
            "WebSocket session registered"
        );

        SessionHandle {
            connection_id,
            subscription_id: subscription_id.to_string(),
            receiver,
        }
    }

    /// Remove a session. Returns false if it was already gone.
    pub fn deregister(&self, connection_id: &str) -> bool {
        let Some((_, subscription_id)) = self.connections.remove(connection_id) else {
            return false;
        };
        self.sessions.remove_if_mut(&subscription_id, |_, sessions| {
            sessions.retain(|s| s.connection_id != connection_id);
            sessions.is_empty()
        });
        tracing::debug!(
            subscription_id = %subscription_id,
            connection_id = %connection_id,
            "WebSocket session deregistered"
        );
        true
    }

    /// Queue a notification on every open session of its subscription.
    ///
    /// Returns the number of sessions that accepted the frame. Sessions whose
    /// socket task has gone away are pruned; full buffers count as not
    /// delivered. Fails if the notification cannot be encoded for a session.
    pub fn send_to(
        &self,
        notification: &Notification,
        default_format: PayloadFormat,
    ) -> SubscriptionResult<usize> {
        let subscription_id = notification.subscription_id.as_str();
        let mut delivered = 0;
        let mut closed = Vec::new();

        if let Some(mut sessions) = self.sessions.get_mut(subscription_id) {
            let mut rendered: Vec<(PayloadFormat, String)> = Vec::new();
            for session in sessions.iter() {
                let format = session.format.unwrap_or(default_format);
                let frame = match rendered.iter().find(|(f, _)| *f == format) {
                    Some((_, frame)) => frame.clone(),
                    None => {
                        let frame = render(notification, format)?;
                        rendered.push((format, frame.clone()));
                        frame
                    }
                };
                match session.sender.try_send(SessionFrame::Text(frame)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            subscription_id = %subscription_id,
                            connection_id = %session.connection_id,
                            "WebSocket session buffer full, frame not queued"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(session.connection_id.clone()),
                }
            }
            sessions.retain(|s| !closed.contains(&s.connection_id));
        }

        for connection_id in &closed {
            self.connections.remove(connection_id);
        }
        self.sessions
            .remove_if(subscription_id, |_, sessions| sessions.is_empty());
        Ok(delivered)
    }

    /// Close and remove every session of a subscription.
    pub fn close_subscription(&self, subscription_id: &str, reason: &str) -> usize {
        let Some((_, sessions)) = self.sessions.remove(subscription_id) else {
            return 0;
        };
        for session in &sessions {
            self.connections.remove(&session.connection_id);
            let _ = session
                .sender
                .try_send(SessionFrame::Close(reason.to_string()));
        }
        sessions.len()
    }

    /// Number of open sessions bound to a subscription.
    pub fn session_count(&self, subscription_id: &str) -> usize {
        self.sessions
            .get(subscription_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Number of open sessions across all subscriptions.
    pub fn total_sessions(&self) -> usize {
        self.connections.len()
    }

    /// Connection details of every session bound to a subscription.
    pub fn sessions_for(&self, subscription_id: &str) -> Vec<SessionInfo> {
        self.sessions
            .get(subscription_id)
            .map(|sessions| {
                sessions
                    .iter()
                    .map(|s| SessionInfo {
                        connection_id: s.connection_id.clone(),
                        connected_at: s.connected_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn render(notification: &Notification, format: PayloadFormat) -> SubscriptionResult<String> {
    Ok(notification
        .encode(format)?
        .unwrap_or_else(|| ping_frame(&notification.subscription_id)))
}

/// Socket delivery: writes to every open session of the subscription.
pub struct WebSocketChannel {
    sessions: Arc<SessionManager>,
}

impl WebSocketChannel {
    /// Create a channel writing to the sessions of `sessions`.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl DeliveryChannel for WebSocketChannel {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn deliver(
        &self,
        subscription: &SubscriptionRecord,
        notification: &Notification,
    ) -> DeliveryOutcome {
        match self
            .sessions
            .send_to(notification, subscription.channel.payload_format)
        {
            Ok(0) => {
                // A client may reconnect before the budget runs out.
                DeliveryOutcome::retryable("no open websocket session accepted the notification")
            }
            Ok(_) => DeliveryOutcome::Delivered,
            Err(e) => DeliveryOutcome::fatal(format!("cannot encode notification: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification() -> Notification {
        Notification {
            subscription_id: "5103".into(),
            resource_type: "Observation".into(),
            resource_id: "1".into(),
            snapshot: Some(Arc::new(json!({"resourceType": "Observation", "id": "1"}))),
        }
    }

    fn websocket_record(payload: Option<&str>) -> SubscriptionRecord {
        let mut channel = json!({"type": "websocket"});
        if let Some(payload) = payload {
            channel["payload"] = json!(payload);
        }
        SubscriptionRecord::from_resource(
            "5103",
            &json!({
                "resourceType": "Subscription",
                "criteria": "Observation?code=1",
                "channel": channel
            }),
        )
        .unwrap()
    }

    #[test]
    fn bind_request_parsing() {
        assert_eq!(parse_bind_request("bind 5103"), Ok("5103"));
        assert_eq!(parse_bind_request("  BIND   abc  "), Ok("abc"));
        assert!(parse_bind_request("bind").is_err());
        assert!(parse_bind_request("hello 5103").is_err());
        assert_eq!(bound_frame("5103"), "bound 5103");
        assert_eq!(ping_frame("5103"), "ping 5103");
    }

    #[tokio::test]
    async fn send_to_all_open_sessions() {
        let manager = SessionManager::new(8);
        let mut first = manager.register("5103", None);
        let mut second = manager.register("5103", Some(PayloadFormat::Json));
        assert_eq!(manager.session_count("5103"), 2);

        let delivered = manager
            .send_to(&notification(), PayloadFormat::IdOnly)
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(
            first.receiver.recv().await,
            Some(SessionFrame::Text("ping 5103".into()))
        );
        let Some(SessionFrame::Text(body)) = second.receiver.recv().await else {
            panic!("expected text frame");
        };
        assert!(body.contains("\"resourceType\":\"Observation\""));
    }

    #[test]
    fn no_sessions_delivers_nothing() {
        let manager = SessionManager::new(8);
        assert_eq!(
            manager.send_to(&notification(), PayloadFormat::IdOnly).unwrap(),
            0
        );
    }

    #[test]
    fn deregister_and_prune_closed() {
        let manager = SessionManager::new(8);
        let first = manager.register("5103", None);
        let second = manager.register("5103", None);

        assert!(manager.deregister(&first.connection_id));
        assert!(!manager.deregister(&first.connection_id));
        assert_eq!(manager.session_count("5103"), 1);

        drop(second);
        assert_eq!(
            manager.send_to(&notification(), PayloadFormat::IdOnly).unwrap(),
            0
        );
        assert_eq!(manager.session_count("5103"), 0);
        assert_eq!(manager.total_sessions(), 0);
    }

    #[test]
    fn full_buffer_is_not_counted() {
        let manager = SessionManager::new(1);
        let _handle = manager.register("5103", None);
        let n = notification();
        assert_eq!(manager.send_to(&n, PayloadFormat::IdOnly).unwrap(), 1);
        assert_eq!(manager.send_to(&n, PayloadFormat::IdOnly).unwrap(), 0);
        assert_eq!(manager.session_count("5103"), 1);
    }

    #[tokio::test]
    async fn close_subscription_sends_close_frames() {
        let manager = SessionManager::new(4);
        let mut handle = manager.register("5103", None);
        assert_eq!(manager.close_subscription("5103", "deleted"), 1);
        assert_eq!(
            handle.receiver.recv().await,
            Some(SessionFrame::Close("deleted".into()))
        );
        assert_eq!(manager.total_sessions(), 0);
    }

    #[tokio::test]
    async fn channel_reports_retryable_without_listener() {
        let sessions = Arc::new(SessionManager::new(4));
        let channel = WebSocketChannel::new(sessions.clone());
        let record = websocket_record(None);
        let n = notification();
        assert!(matches!(
            channel.deliver(&record, &n).await,
            DeliveryOutcome::Retryable(_)
        ));

        let _handle = sessions.register("5103", None);
        assert_eq!(channel.deliver(&record, &n).await, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn unencodable_notification_is_fatal() {
        let sessions = Arc::new(SessionManager::new(4));
        let channel = WebSocketChannel::new(sessions.clone());
        let mut handle = sessions.register("5103", None);
        let n = Notification {
            snapshot: None,
            ..notification()
        };

        assert!(sessions.send_to(&n, PayloadFormat::Json).is_err());
        assert!(matches!(
            channel
                .deliver(&websocket_record(Some("application/fhir+json")), &n)
                .await,
            DeliveryOutcome::Fatal(_)
        ));
        assert!(handle.receiver.try_recv().is_err());

        // Id-only payloads need no snapshot.
        assert_eq!(
            channel.deliver(&websocket_record(None), &n).await,
            DeliveryOutcome::Delivered
        );
    }
}
