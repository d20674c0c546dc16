//! WebSocket endpoint for live data changes

use crate::rest::{ApiState, NOT_CONNECTED};
use axum::{
    extract::{
        rejection::ExtensionRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};
use ualink_hub::HubClient;

// ============================================================================
// Router Setup
// ============================================================================

pub fn create_ws_router(state: ApiState) -> Router {
    Router::new()
        .route("/ws/subscribe", get(ws_subscribe_handler))
        .with_state(state)
}

// ============================================================================
// WebSocket Handlers
// ============================================================================

/// WS /ws/subscribe - live data changes, filtered by control messages
async fn ws_subscribe_handler(
    State(state): State<ApiState>,
    connect_info: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.controller.is_connected() {
        return (StatusCode::SERVICE_UNAVAILABLE, NOT_CONNECTED).into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let remote = connect_info.ok().map(|ConnectInfo(addr)| addr);

    ws.on_upgrade(move |socket| handle_subscribe_socket(socket, state, remote))
}

async fn handle_subscribe_socket(socket: WebSocket, state: ApiState, remote: Option<SocketAddr>) {
    let client = state.hub.register();
    let client_id = client.id();
    if let Some(addr) = remote {
        state.remotes.insert(client_id, addr);
    }
    info!(client_id = %client_id, remote = ?remote, "WebSocket client connected");

    let (sender, receiver) = socket.split();
    let outbound = client.receiver();

    let mut send_task = tokio::spawn(handle_send_messages(sender, outbound, client_id));

    tokio::select! {
        _ = &mut send_task => {
            debug!(client_id = %client_id, "Send task completed");
        }
        _ = handle_receive_messages(receiver, &client) => {
            debug!(client_id = %client_id, "Receive loop completed");
            send_task.abort();
        }
    }

    state.remotes.remove(&client_id);
    drop(client);
    info!(client_id = %client_id, "WebSocket client disconnected");
}

// ============================================================================
// Message Handling
// ============================================================================

async fn handle_send_messages(
    mut sender: SplitSink<WebSocket, Message>,
    outbound: flume::Receiver<ualink_core::types::BroadcastMessage>,
    client_id: ualink_hub::ClientId,
) {
    while let Ok(message) = outbound.recv_async().await {
        match serde_json::to_string(&message) {
            Ok(json) => {
                if let Err(e) = sender.send(Message::Text(json.into())).await {
                    debug!(client_id = %client_id, error = %e, "Failed to send message");
                    return;
                }
            }
            Err(e) => {
                error!(client_id = %client_id, error = %e, "Failed to serialize message");
            }
        }
    }

    // The hub closed this client
    let _ = sender.send(Message::Close(None)).await;
}

async fn handle_receive_messages(mut receiver: SplitStream<WebSocket>, client: &HubClient) {
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => client.handle_text(text.as_str()),
            Ok(Message::Binary(_)) => {
                warn!(client_id = %client.id(), "Ignoring binary message");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(client_id = %client.id(), error = %e, "WebSocket read failed");
                break;
            }
        }
    }
}
