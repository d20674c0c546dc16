//! Watch list and monitored-item ownership.
//!
//! Each watched node owns at most one monitor handle. Handles are taken out of
//! the map under the lock and released after it is dropped; `release` consumes
//! the handle, so a handle can only be released once.

use crate::controller::Controller;
use crate::convert::format_value;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use ualink_client::MonitorHandle;
use ualink_core::error::UalinkError;
use ualink_core::types::{NodeAttributes, StatusCode, WatchItem};
use ualink_core::value::Variant;

/// Deadline for creating a monitored item.
pub const MONITOR_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct WatchEntry {
    pub(crate) item: WatchItem,
    pub(crate) monitor: Option<Box<dyn MonitorHandle>>,
}

/// Watched nodes keyed by node id, so snapshots come out sorted.
#[derive(Default)]
pub(crate) struct WatchManager {
    entries: RwLock<BTreeMap<String, WatchEntry>>,
}

impl WatchManager {
    /// Inserts an empty entry; false if the node is already watched.
    pub(crate) fn insert_if_absent(&self, node_id: &str) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(node_id) {
            return false;
        }
        entries.insert(
            node_id.to_string(),
            WatchEntry {
                item: WatchItem::new(node_id),
                monitor: None,
            },
        );
        true
    }

    pub(crate) fn seed(&self, node_id: &str, attributes: &NodeAttributes) {
        if let Some(entry) = self.entries.write().get_mut(node_id) {
            entry.item = WatchItem::from_attributes(attributes);
            entry.item.node_id = node_id.to_string();
        }
    }

    /// Stores the handle on the entry. The handle is handed back when the entry
    /// is gone or already has one, and must then be released by the caller.
    pub(crate) fn attach_monitor(
        &self,
        node_id: &str,
        monitor: Box<dyn MonitorHandle>,
    ) -> Option<Box<dyn MonitorHandle>> {
        let mut entries = self.entries.write();
        match entries.get_mut(node_id) {
            Some(entry) if entry.monitor.is_none() => {
                entry.monitor = Some(monitor);
                None
            }
            _ => Some(monitor),
        }
    }

    pub(crate) fn remove(&self, node_id: &str) -> Option<WatchEntry> {
        self.entries.write().remove(node_id)
    }

    /// Empties the map in one lock acquisition.
    pub(crate) fn drain(&self) -> Vec<WatchEntry> {
        std::mem::take(&mut *self.entries.write())
            .into_values()
            .collect()
    }

    /// Applies a notification; `None` for nodes that are not watched.
    pub(crate) fn apply_change(
        &self,
        node_id: &str,
        value: &Variant,
        status: StatusCode,
    ) -> Option<WatchItem> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(node_id)?;
        let item = &mut entry.item;
        item.value = if value.is_empty() {
            "<nil>".to_string()
        } else {
            format_value(value, &item.data_type)
        };
        item.apply_status(status);
        item.stamp_now();
        Some(item.clone())
    }

    pub(crate) fn get(&self, node_id: &str) -> Option<WatchItem> {
        self.entries.read().get(node_id).map(|e| e.item.clone())
    }

    pub(crate) fn contains(&self, node_id: &str) -> bool {
        self.entries.read().contains_key(node_id)
    }

    pub(crate) fn is_monitored(&self, node_id: &str) -> bool {
        self.entries
            .read()
            .get(node_id)
            .is_some_and(|e| e.monitor.is_some())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<WatchItem> {
        self.entries.read().values().map(|e| e.item.clone()).collect()
    }
}

async fn release(monitor: Box<dyn MonitorHandle>) {
    let node_id = monitor.node_id().to_string();
    match monitor.release().await {
        Ok(()) => info!(node_id = %node_id, "Stopped monitoring"),
        Err(e) => warn!(node_id = %node_id, error = %e, "Failed to release monitored item"),
    }
}

impl Controller {
    /// Starts watching a node. Watching an already watched node does nothing.
    ///
    /// Attribute seeding and monitor creation are best-effort: the entry stays
    /// in the list even if either fails.
    pub async fn add_watch(&self, node_id: &str) -> Result<(), UalinkError> {
        let session = self.session()?;
        if !self.watches.insert_if_absent(node_id) {
            return Ok(());
        }

        match self.read_node_attributes(node_id).await {
            Ok(attributes) => self.watches.seed(node_id, &attributes),
            Err(e) => debug!(node_id, error = %e, "Watch seeded without attributes"),
        }

        match tokio::time::timeout(MONITOR_TIMEOUT, session.monitor(node_id)).await {
            Ok(Ok(monitor)) => match self.watches.attach_monitor(node_id, monitor) {
                None => info!(node_id, "Monitoring started"),
                Some(orphan) => {
                    debug!(node_id, "Watch removed while monitor was created");
                    release(orphan).await;
                }
            },
            Ok(Err(e)) => warn!(node_id, error = %e, "Failed to monitor"),
            Err(_) => warn!(node_id, timeout_secs = MONITOR_TIMEOUT.as_secs(), "Monitor request timed out"),
        }

        self.publish_watch_list();
        if let Some(item) = self.watches.get(node_id) {
            self.broadcast_item(item);
        }
        Ok(())
    }

    pub async fn remove_watch(&self, node_id: &str) {
        let Some(entry) = self.watches.remove(node_id) else {
            return;
        };
        self.publish_watch_list();
        if let Some(monitor) = entry.monitor {
            release(monitor).await;
        }
    }

    pub async fn remove_all_watches(&self) {
        let entries = self.watches.drain();
        if !entries.is_empty() {
            info!(count = entries.len(), "Clearing watch list");
        }
        self.publish_watch_list();
        for monitor in entries.into_iter().filter_map(|e| e.monitor) {
            release(monitor).await;
        }
    }

    /// Applies a monitored-item notification and fans it out.
    ///
    /// Never blocks: a full broadcast channel drops the copy.
    pub fn handle_data_change(&self, node_id: &str, value: &Variant, status: StatusCode) {
        let Some(item) = self.watches.apply_change(node_id, value, status) else {
            return;
        };
        self.status().metrics().record_data_change();
        self.publish_watch_list();
        self.broadcast_item(item);
    }

    /// Current watch list, sorted by node id.
    pub fn watch_list(&self) -> Vec<WatchItem> {
        self.watches.snapshot()
    }

    pub fn is_watched(&self, node_id: &str) -> bool {
        self.watches.contains(node_id)
    }

    pub fn is_monitored(&self, node_id: &str) -> bool {
        self.watches.is_monitored(node_id)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    pub(crate) fn publish_watch_list(&self) {
        if self.observers.is_empty() {
            return;
        }
        let items = self.watches.snapshot();
        self.observers.notify(|o| o.on_watch_list_update(&items));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected, wait_until, RecordingObserver};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_watch_is_idempotent() {
        let (controller, server) = connected().await;

        controller.add_watch("ns=2;s=Line1.Speed").await.unwrap();
        controller.add_watch("ns=2;s=Line1.Speed").await.unwrap();

        assert_eq!(controller.watch_count(), 1);
        assert_eq!(server.monitors_active(), 1);
        let item = &controller.watch_list()[0];
        assert_eq!(item.name, "Speed");
        assert_eq!(item.data_type, "Float");
        assert_eq!(item.value, "12.5");
        assert!(!item.timestamp.is_empty());
    }

    #[tokio::test]
    async fn test_add_watch_requires_session() {
        let controller = crate::testing::controller(&ualink_client::MemoryServer::demo_plant());
        let err = controller.add_watch("ns=2;s=Line1.Speed").await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(controller.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_monitor_failure_keeps_entry() {
        let (controller, server) = connected().await;
        server.fail_monitor("ns=2;s=Line1.Recipe");

        controller.add_watch("ns=2;s=Line1.Recipe").await.unwrap();
        assert!(controller.is_watched("ns=2;s=Line1.Recipe"));
        assert!(!controller.is_monitored("ns=2;s=Line1.Recipe"));
        assert_eq!(server.monitors_active(), 0);
    }

    #[tokio::test]
    async fn test_remove_releases_exactly_once() {
        let (controller, server) = connected().await;
        controller.add_watch("ns=2;s=Line1.Speed").await.unwrap();
        controller.add_watch("ns=2;s=Line1.Count").await.unwrap();

        controller.remove_watch("ns=2;s=Line1.Speed").await;
        controller.remove_watch("ns=2;s=Line1.Speed").await;
        assert_eq!(server.monitors_released(), 1);

        controller.remove_all_watches().await;
        controller.remove_all_watches().await;
        assert_eq!(server.monitors_released(), 2);
        assert_eq!(server.monitors_active(), 0);
        assert_eq!(controller.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_data_change_updates_and_broadcasts() {
        let (controller, server) = connected().await;
        let observer = Arc::new(RecordingObserver::default());
        controller.add_observer(observer.clone());
        let inbound = controller.broadcast_source().receiver();

        controller.add_watch("ns=2;s=Line1.Speed").await.unwrap();
        assert_eq!(inbound.recv_async().await.unwrap().value, "12.5");

        server.push_change("ns=2;s=Line1.Speed", Variant::Float(20.0), StatusCode::UNCERTAIN);
        let message = tokio::time::timeout(Duration::from_secs(1), inbound.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.node_id, "ns=2;s=Line1.Speed");
        assert_eq!(message.value, "20");
        assert_eq!(message.severity, "Uncertain");

        wait_until(|| {
            observer
                .last_watch_list()
                .is_some_and(|items| items.first().is_some_and(|i| i.value == "20"))
        })
        .await;
    }

    #[tokio::test]
    async fn test_unknown_data_change_is_ignored() {
        let (controller, _server) = connected().await;
        let inbound = controller.broadcast_source().receiver();
        controller.handle_data_change("ns=2;s=Nope", &Variant::Int32(1), StatusCode::GOOD);
        assert!(inbound.is_empty());
        assert_eq!(controller.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_full_broadcast_channel_drops_copy() {
        let (controller, _server) = connected().await;
        controller.add_watch("ns=2;s=Line1.Speed").await.unwrap();
        for _ in 0..200 {
            controller.handle_data_change("ns=2;s=Line1.Speed", &Variant::Float(1.0), StatusCode::GOOD);
        }
        assert!(controller.status().metrics().broadcasts_dropped() > 0);
        assert_eq!(controller.watch_list()[0].value, "1");
    }
}
