//! API edge over a real socket: WebSocket subscribe and client listing

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode as HttpStatus};
use common::{wait_until, TestStack, SPEED};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tower::ServiceExt;
use ualink_core::types::StatusCode;
use ualink_core::value::Variant;

#[tokio::test]
async fn test_subscribe_rejected_while_disconnected() {
    let stack = TestStack::start().await;

    match tokio_tungstenite::connect_async(stack.ws_url()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 503),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("upgrade should be refused without a session"),
    }
    assert_eq!(stack.hub.client_count(), 0);

    stack.stop().await;
}

#[tokio::test]
async fn test_ws_subscriber_receives_changes() {
    let stack = TestStack::start().await;
    stack.controller.connect().await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(stack.ws_url())
        .await
        .expect("WebSocket upgrade failed");
    wait_until(|| stack.hub.client_count() == 1).await;

    let subscribe = format!(r#"{{"action":"subscribe","node_ids":["{}"]}}"#, SPEED);
    ws.send(Message::Text(subscribe.into())).await.unwrap();
    wait_until(|| stack.controller.is_monitored(SPEED)).await;

    stack
        .server
        .push_change(SPEED, Variant::Float(18.25), StatusCode::GOOD);

    let received = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(frame) = ws.next().await {
            let Ok(Message::Text(text)) = frame else {
                continue;
            };
            let item: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if item["node_id"] == SPEED && item["value"] == "18.25" {
                return item;
            }
        }
        panic!("socket closed before the change arrived");
    })
    .await
    .expect("timed out waiting for data change");
    assert_eq!(received["severity"], "Good");

    ws.close(None).await.unwrap();
    wait_until(|| stack.hub.client_count() == 0).await;

    stack.stop().await;
}

#[tokio::test]
async fn test_ws_clients_lists_remote_address() {
    let stack = TestStack::start().await;
    stack.controller.connect().await.unwrap();

    let (_ws, _) = tokio_tungstenite::connect_async(stack.ws_url())
        .await
        .expect("WebSocket upgrade failed");
    wait_until(|| stack.hub.client_count() == 1).await;
    wait_until(|| stack.state.remotes.len() == 1).await;

    let response = ualink_api::rest::create_rest_router(stack.state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/v1/ws/clients")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), HttpStatus::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let clients: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let clients = clients.as_array().unwrap();
    assert_eq!(clients.len(), 1);
    assert!(clients[0]["remote_addr"]
        .as_str()
        .is_some_and(|addr| addr.starts_with("127.0.0.1:")));
    assert_eq!(clients[0]["subscribe_all"], false);

    stack.stop().await;
}

#[tokio::test]
async fn test_disconnect_closes_ws_subscribers() {
    let stack = TestStack::start().await;
    stack.controller.connect().await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(stack.ws_url())
        .await
        .expect("WebSocket upgrade failed");
    wait_until(|| stack.hub.client_count() == 1).await;

    stack.controller.disconnect().await;

    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket should close when the session ends");

    stack.stop().await;
}
