//! WebSocket observers.
//!
//! Each connection registers one observer with the notification hub. The
//! client first receives the current file list, lock set and its own pending
//! messages, then every notification the hub delivers to it.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use cadvault_core::Notification;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::error::{ApiError, Result};
use crate::handlers::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user: String,
}

/// GET /ws?user={name}
pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
) -> Result<Response> {
    let user = query.user.trim().to_string();
    if user.is_empty() {
        return Err(ApiError::BadRequest("user is required".into()));
    }
    Ok(ws.on_upgrade(move |socket| handle_ws_connection(state, user, socket)))
}

async fn send_notification(
    sink: &mut SplitSink<WebSocket, Message>,
    notification: &Notification,
) -> bool {
    match serde_json::to_string(notification) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize {}: {}", notification.kind(), e);
            true
        }
    }
}

async fn initial_notifications(state: &AppState, user: &str) -> Vec<Notification> {
    let mut initial = Vec::new();
    match state.coordinator.current_state().await {
        Ok(current) => initial.extend(current.notifications()),
        Err(e) => warn!("Failed to load state for {}: {}", user, e),
    }
    match state.coordinator.pending_messages(user).await {
        Ok(messages) if !messages.is_empty() => initial.push(Notification::PendingMessages {
            user: user.to_string(),
            messages,
        }),
        Ok(_) => {}
        Err(e) => warn!("Failed to load messages for {}: {}", user, e),
    }
    initial
}

async fn handle_ws_connection(state: AppState, user: String, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let hub = state.coordinator.hub().clone();
    let (observer_id, events) = hub.register(&user);
    info!(observer = %observer_id, user = %user, "Observer connected");

    let initial = initial_notifications(&state, &user).await;

    // Outbound forwarder
    let outbound_task = tokio::spawn(async move {
        for notification in &initial {
            if !send_notification(&mut ws_tx, notification).await {
                return;
            }
        }
        let mut events = ReceiverStream::new(events);
        while let Some(notification) = events.next().await {
            if !send_notification(&mut ws_tx, &notification).await {
                break;
            }
        }
    });

    // Inbound: only watch for the client going away
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(observer = %observer_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    outbound_task.abort();
    hub.unregister(&observer_id);
    info!(observer = %observer_id, user = %user, "Observer disconnected");
}
