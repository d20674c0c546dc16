//! Shared fixtures for the unit tests in this crate.

use crate::controller::Controller;
use crate::observer::ControllerObserver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use ualink_cert::Provisioner;
use ualink_client::MemoryServer;
use ualink_core::config::{CertConfig, ClientConfig};
use ualink_core::types::WatchItem;

pub(crate) fn test_config() -> ClientConfig {
    ClientConfig::new("opc.tcp://localhost:4840")
        .with_retry(3, Duration::from_millis(10))
        .with_connect_timeout(Duration::from_millis(500))
}

pub(crate) fn controller(server: &MemoryServer) -> Arc<Controller> {
    Controller::new(
        test_config(),
        Arc::new(server.clone()),
        Provisioner::new(CertConfig::default()),
    )
}

/// A connected controller over the demo plant.
pub(crate) async fn connected() -> (Arc<Controller>, MemoryServer) {
    let server = MemoryServer::demo_plant();
    let controller = controller(&server);
    controller.connect().await.unwrap();
    (controller, server)
}

/// Polls `condition` every 5ms, panicking after two seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    states: Mutex<Vec<(bool, Option<String>)>>,
    updates: Mutex<Vec<String>>,
    resets: Mutex<usize>,
    watch_list: Mutex<Option<Vec<WatchItem>>>,
}

impl RecordingObserver {
    pub(crate) fn states(&self) -> Vec<(bool, Option<String>)> {
        self.states.lock().clone()
    }

    pub(crate) fn updates(&self) -> Vec<String> {
        self.updates.lock().clone()
    }

    pub(crate) fn resets(&self) -> usize {
        *self.resets.lock()
    }

    pub(crate) fn last_watch_list(&self) -> Option<Vec<WatchItem>> {
        self.watch_list.lock().clone()
    }
}

impl ControllerObserver for RecordingObserver {
    fn on_connection_state_change(&self, connected: bool, error: Option<&str>) {
        self.states
            .lock()
            .push((connected, error.map(str::to_string)));
    }

    fn on_address_space_update(&self, parent_id: &str) {
        self.updates.lock().push(parent_id.to_string());
    }

    fn on_address_space_reset(&self) {
        *self.resets.lock() += 1;
    }

    fn on_watch_list_update(&self, items: &[WatchItem]) {
        *self.watch_list.lock() = Some(items.to_vec());
    }
}
