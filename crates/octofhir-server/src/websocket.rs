//! Websocket endpoint for `websocket` channel subscriptions.
//!
//! A client identifies its subscription either with `?subscription=<id>` on
//! the upgrade request or with a `bind <id>` text frame. After binding, every
//! notification arrives as one text frame: `ping <id>` for id-only payloads,
//! otherwise the encoded resource.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use octofhir_subscriptions::delivery::websocket::{
    bound_frame, invalid_bind_frame, parse_bind_request,
};
use octofhir_subscriptions::{PayloadFormat, SessionFrame, SessionHandle, SubscriptionEngine};
use tokio::time::{Interval, interval};

use crate::server::AppState;

/// Close code sent when the subscription goes away while the session is open.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent after a rejected bind.
const CLOSE_POLICY: u16 = 1008;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    upgrade(ws, state, params, None)
}

pub async fn versioned_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(fhir_version): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    upgrade(ws, state, params, Some(fhir_version))
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    params: HashMap<String, String>,
    fhir_version: Option<String>,
) -> Response {
    let subscription = params
        .get("subscription")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let format = params
        .get("_format")
        .and_then(|f| PayloadFormat::from_format_param(f));
    let heartbeat = state.engine.config().websocket.heartbeat();
    let engine = state.engine.clone();

    ws.on_upgrade(move |socket| async move {
        tracing::debug!(
            fhir_version = fhir_version.as_deref().unwrap_or("default"),
            "WebSocket connection opened"
        );
        handle_socket(socket, engine, subscription, format, heartbeat).await;
    })
}

async fn handle_socket(
    socket: WebSocket,
    engine: Arc<SubscriptionEngine>,
    subscription: Option<String>,
    format: Option<PayloadFormat>,
    heartbeat: Option<Duration>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Identification: query parameter, or the first text frame.
    let requested = match subscription {
        Some(id) => Ok(id),
        None => loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    break parse_bind_request(text.as_str()).map(str::to_string);
                }
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            }
        },
    };

    let handle = match requested.and_then(|id| bind(&engine, &id, format)) {
        Ok(handle) => handle,
        Err(reason) => {
            tracing::debug!(reason = %reason, "WebSocket bind rejected");
            let _ = sender
                .send(Message::Text(invalid_bind_frame(&reason).into()))
                .await;
            close(&mut sender, CLOSE_POLICY, "invalid bind request").await;
            return;
        }
    };

    if sender
        .send(Message::Text(bound_frame(&handle.subscription_id).into()))
        .await
        .is_err()
    {
        engine.sessions().deregister(&handle.connection_id);
        return;
    }

    tracing::info!(
        subscription_id = %handle.subscription_id,
        connection_id = %handle.connection_id,
        "WebSocket bound to subscription"
    );

    let SessionHandle {
        connection_id,
        subscription_id,
        receiver: mut frames,
    } = handle;
    let mut heartbeat = heartbeat.map(interval);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(subscription_id = %subscription_id, "Client closed WebSocket");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    // Anything else from a bound client is ignored
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            frame = frames.recv() => {
                match frame {
                    Some(SessionFrame::Text(text)) => {
                        if let Err(e) = sender.send(Message::Text(text.into())).await {
                            tracing::debug!(error = %e, "Failed to send notification");
                            break;
                        }
                    }
                    Some(SessionFrame::Close(reason)) => {
                        close(&mut sender, CLOSE_GOING_AWAY, &reason).await;
                        break;
                    }
                    None => break,
                }
            }

            _ = tick(&mut heartbeat) => {
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    engine.sessions().deregister(&connection_id);
    tracing::info!(
        subscription_id = %subscription_id,
        connection_id = %connection_id,
        "WebSocket connection closed"
    );
}

fn bind(
    engine: &SubscriptionEngine,
    subscription_id: &str,
    format: Option<PayloadFormat>,
) -> Result<SessionHandle, String> {
    engine
        .bind_session(subscription_id, format)
        .map_err(|e| e.to_string())
}

/// Wait for the next heartbeat, or forever when heartbeats are disabled.
async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from(reason.to_string()),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}
