//! Observer registration.
//!
//! Observers are called synchronously from whatever task produced the event,
//! never while the controller holds one of its locks. Keep callbacks short.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use ualink_core::types::{NodeAttributes, WatchItem};

/// Receives controller events. Every method has an empty default.
pub trait ControllerObserver: Send + Sync {
    /// Session came up (`connected == true`) or went away. A failed connect
    /// reports `false` with the last error.
    fn on_connection_state_change(&self, _connected: bool, _error: Option<&str>) {}

    /// Children of `parent_id` were published.
    fn on_address_space_update(&self, _parent_id: &str) {}

    /// The cache was dropped on disconnect.
    fn on_address_space_reset(&self) {}

    /// Current watch list, sorted by node id.
    fn on_watch_list_update(&self, _items: &[WatchItem]) {}

    fn on_node_attributes(&self, _attributes: &NodeAttributes) {}
}

pub type ObserverId = u64;

#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Arc<dyn ControllerObserver>)>>,
}

impl ObserverRegistry {
    pub fn add(&self, observer: Arc<dyn ControllerObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.observers.write().push((id, observer));
        id
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for every observer, outside the registry lock.
    pub fn notify(&self, f: impl Fn(&dyn ControllerObserver)) {
        let observers: Vec<Arc<dyn ControllerObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            f(observer.as_ref());
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counter {
        updates: Mutex<Vec<String>>,
    }

    impl ControllerObserver for Counter {
        fn on_address_space_update(&self, parent_id: &str) {
            self.updates.lock().push(parent_id.to_string());
        }
    }

    #[test]
    fn test_add_notify_remove() {
        let registry = ObserverRegistry::default();
        let counter = Arc::new(Counter::default());
        let id = registry.add(counter.clone());

        registry.notify(|o| o.on_address_space_update("i=84"));
        // Default methods are no-ops
        registry.notify(|o| o.on_address_space_reset());
        assert_eq!(*counter.updates.lock(), vec!["i=84".to_string()]);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.notify(|o| o.on_address_space_update("i=85"));
        assert_eq!(counter.updates.lock().len(), 1);
        assert!(registry.is_empty());
    }
}
