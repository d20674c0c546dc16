//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ualink_api::rest::ApiState;
use ualink_api::{ServerBuilder, ServerConfig};
use ualink_cert::Provisioner;
use ualink_client::MemoryServer;
use ualink_controller::Controller;
use ualink_core::config::{CertConfig, ClientConfig};
use ualink_core::types::BroadcastMessage;
use ualink_hub::{Hub, HubClient, HubConfig};

pub const SPEED: &str = "ns=2;s=Line1.Speed";
pub const COUNT: &str = "ns=2;s=Line1.Count";
pub const RUNNING: &str = "ns=2;s=Line1.Running";

/// Short retry and timeout settings so failure paths finish quickly.
pub fn fast_config() -> ClientConfig {
    ClientConfig::new("opc.tcp://localhost:4840")
        .with_retry(3, Duration::from_millis(10))
        .with_connect_timeout(Duration::from_millis(500))
}

/// Controller and hub over the demo plant, not yet connected.
pub fn runtime() -> (Arc<Controller>, Hub, MemoryServer) {
    let server = MemoryServer::demo_plant();
    let controller = Controller::new(
        fast_config(),
        Arc::new(server.clone()),
        Provisioner::new(CertConfig::default()),
    );
    let hub = controller.spawn_hub(HubConfig::default());
    (controller, hub, server)
}

/// The full stack serving on an ephemeral local port.
pub struct TestStack {
    pub controller: Arc<Controller>,
    pub hub: Hub,
    pub server: MemoryServer,
    pub state: ApiState,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestStack {
    pub async fn start() -> Self {
        let (controller, hub, server) = runtime();

        let api = ServerBuilder::new(ServerConfig::default())
            .build(controller.clone(), hub.clone())
            .expect("Failed to build API server");
        let state = api.state().clone();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("No local address");

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            api.serve(listener, async move { token.cancelled().await })
                .await
        });

        Self {
            controller,
            hub,
            server,
            state,
            addr,
            shutdown,
            task,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/subscribe", self.addr)
    }

    pub async fn stop(self) {
        self.controller.disconnect().await;
        self.hub.stop().await;
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Polls `condition` every 5ms, panicking after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}

/// Receives until a message for `node_id` carries `value`.
pub async fn recv_value(client: &HubClient, node_id: &str, value: &str) -> BroadcastMessage {
    let wait = async {
        loop {
            match client.recv().await {
                Some(message) if message.node_id == node_id && message.value == value => {
                    return message
                }
                Some(_) => continue,
                None => panic!("hub closed the client before {} = {}", node_id, value),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("timed out waiting for data change")
}
