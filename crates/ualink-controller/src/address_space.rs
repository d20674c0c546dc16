//! Address-space cache and browser.
//!
//! A parent with no entry in the children index has not been browsed; an
//! empty entry means it was browsed and has no children. Only one browse per
//! parent runs at a time. Late callers wait for it and read what it published.

use crate::attributes::read_node_attributes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use ualink_client::{ProtocolSession, ReferenceDescription};
use ualink_core::error::BrowseError;
use ualink_core::types::{AddressSpaceNode, NodeClass, TagExportRecord, ROOT_FOLDER_ID};

/// Deadline for a single browse request.
pub const BROWSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard deadline for a whole tag collection.
pub const COLLECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Maps {
    nodes: HashMap<String, AddressSpaceNode>,
    children: HashMap<String, Vec<String>>,
}

/// How a browse call got its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseOutcome {
    /// This call ran the browse and published the result
    Published(Vec<AddressSpaceNode>),
    /// Another call was already browsing; these are the children it published
    Joined(Vec<AddressSpaceNode>),
}

impl BrowseOutcome {
    pub fn children(&self) -> &[AddressSpaceNode] {
        match self {
            BrowseOutcome::Published(children) | BrowseOutcome::Joined(children) => children,
        }
    }

    pub fn into_children(self) -> Vec<AddressSpaceNode> {
        match self {
            BrowseOutcome::Published(children) | BrowseOutcome::Joined(children) => children,
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, BrowseOutcome::Published(_))
    }
}

/// Builds child nodes from browse references, sorted by name.
pub fn children_from_references(references: Vec<ReferenceDescription>) -> Vec<AddressSpaceNode> {
    let mut children: Vec<AddressSpaceNode> = references
        .into_iter()
        .filter_map(|reference| {
            let node_id = reference.target_id()?.to_string();
            let name = if reference.display_name.is_empty() {
                node_id.clone()
            } else {
                reference.display_name
            };
            Some(AddressSpaceNode {
                has_children: reference.node_class.may_have_children(),
                node_id,
                name,
                node_class: reference.node_class,
            })
        })
        .collect();
    children.sort_by(|a, b| a.name.cmp(&b.name));
    children
}

/// Cached view of the server's address space.
#[derive(Default)]
pub struct AddressSpace {
    maps: RwLock<Maps>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
    /// Bumped on every reset so a browse that started before it cannot publish into the new maps
    epoch: AtomicU64,
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let maps = self.maps.read();
        f.debug_struct("AddressSpace")
            .field("nodes", &maps.nodes.len())
            .field("browsed", &maps.children.len())
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

/// Clears the in-flight marker and wakes waiters, even if the browse future is dropped.
struct InFlightGuard<'a> {
    space: &'a AddressSpace,
    parent_id: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(notify) = self.space.in_flight.lock().remove(self.parent_id) {
            notify.notify_waiters();
        }
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_been_browsed(&self, node_id: &str) -> bool {
        self.maps.read().children.contains_key(node_id)
    }

    pub fn is_browsing(&self, node_id: &str) -> bool {
        self.in_flight.lock().contains_key(node_id)
    }

    /// Published children of a node, or `None` if it has not been browsed.
    pub fn children(&self, parent_id: &str) -> Option<Vec<AddressSpaceNode>> {
        let maps = self.maps.read();
        let ids = maps.children.get(parent_id)?;
        Some(
            ids.iter()
                .filter_map(|id| maps.nodes.get(id).cloned())
                .collect(),
        )
    }

    pub fn child_ids(&self, parent_id: &str) -> Vec<String> {
        self.maps
            .read()
            .children
            .get(parent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn node(&self, node_id: &str) -> Option<AddressSpaceNode> {
        self.maps.read().nodes.get(node_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.maps.read().nodes.len()
    }

    /// Drops the whole cache by swapping in fresh maps.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.maps.write() = Maps::default();
    }

    fn publish(&self, parent_id: &str, children: &[AddressSpaceNode], epoch: u64) -> bool {
        let mut maps = self.maps.write();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        for child in children {
            maps.nodes.insert(child.node_id.clone(), child.clone());
        }
        maps.children.insert(
            parent_id.to_string(),
            children.iter().map(|c| c.node_id.clone()).collect(),
        );
        true
    }

    /// Browses `parent_id` once, however many callers ask at the same time.
    ///
    /// On failure nothing is published, so the parent stays unbrowsed.
    pub async fn browse(
        &self,
        session: &dyn ProtocolSession,
        parent_id: &str,
        timeout: Duration,
    ) -> Result<BrowseOutcome, BrowseError> {
        let existing = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(parent_id) {
                Some(notify) => Some(Arc::clone(notify)),
                None => {
                    in_flight.insert(parent_id.to_string(), Arc::new(Notify::new()));
                    None
                }
            }
        };

        if let Some(notify) = existing {
            return self.join(parent_id, notify, timeout).await;
        }

        let _guard = InFlightGuard {
            space: self,
            parent_id,
        };
        let epoch = self.epoch.load(Ordering::SeqCst);
        debug!(parent_id, "Browsing");

        let references = match tokio::time::timeout(timeout, session.browse(parent_id)).await {
            Ok(Ok(references)) => references,
            Ok(Err(e)) => {
                warn!(parent_id, error = %e, "Browse failed");
                return Err(BrowseError::Failed {
                    node_id: parent_id.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(parent_id, timeout_secs = timeout.as_secs(), "Browse timed out");
                return Err(BrowseError::Failed {
                    node_id: parent_id.to_string(),
                    reason: format!("timed out after {}s", timeout.as_secs()),
                });
            }
        };

        let children = children_from_references(references);
        if !self.publish(parent_id, &children, epoch) {
            debug!(parent_id, "Discarding browse result from before reset");
            return Err(BrowseError::Failed {
                node_id: parent_id.to_string(),
                reason: "address space was reset".to_string(),
            });
        }
        debug!(parent_id, children = children.len(), "Browse published");
        Ok(BrowseOutcome::Published(children))
    }

    async fn join(
        &self,
        parent_id: &str,
        notify: Arc<Notify>,
        timeout: Duration,
    ) -> Result<BrowseOutcome, BrowseError> {
        // A Notified future receives notify_waiters() from the moment it is created
        let notified = notify.notified();
        let still_running = self
            .in_flight
            .lock()
            .get(parent_id)
            .is_some_and(|current| Arc::ptr_eq(current, &notify));
        if still_running {
            let _ = tokio::time::timeout(timeout, notified).await;
        }

        self.children(parent_id)
            .map(BrowseOutcome::Joined)
            .ok_or_else(|| BrowseError::Failed {
                node_id: parent_id.to_string(),
                reason: "concurrent browse did not publish children".to_string(),
            })
    }

    /// Collects Variable nodes under `parent_id`, browsing on demand.
    ///
    /// An empty parent means the root folder. Non-recursive mode lists only
    /// the direct children. After `deadline` the records gathered so far are
    /// returned inside `BrowseError::TraversalTimeout`.
    pub async fn collect_variable_nodes(
        &self,
        session: &dyn ProtocolSession,
        parent_id: &str,
        recursive: bool,
        deadline: Duration,
    ) -> Result<Vec<TagExportRecord>, BrowseError> {
        let start = if parent_id.is_empty() {
            ROOT_FOLDER_ID
        } else {
            parent_id
        };

        let mut records = Vec::new();
        let finished = tokio::time::timeout(deadline, self.walk(session, start, recursive, &mut records))
            .await
            .is_ok();
        if finished {
            return Ok(records);
        }

        warn!(
            parent_id = start,
            collected = records.len(),
            "Tag collection hit its deadline"
        );
        Err(BrowseError::TraversalTimeout {
            timeout_secs: deadline.as_secs(),
            partial: records,
        })
    }

    async fn walk(
        &self,
        session: &dyn ProtocolSession,
        start: &str,
        recursive: bool,
        records: &mut Vec<TagExportRecord>,
    ) {
        let start_path = self.node(start).map(|n| n.name).unwrap_or_default();
        let mut queue = VecDeque::from([(start.to_string(), start_path)]);
        let mut visited = HashSet::new();

        while let Some((node_id, path)) = queue.pop_front() {
            if !visited.insert(node_id.clone()) {
                continue;
            }

            let node = self.node(&node_id);
            if let Some(node) = &node {
                if node.node_class == NodeClass::Variable {
                    records.push(Self::tag_record(session, node, &path).await);
                }
            }

            if !recursive && node_id != start {
                continue;
            }
            if node.as_ref().is_some_and(|n| !n.has_children) {
                continue;
            }
            if !self.has_been_browsed(&node_id) {
                if let Err(e) = self.browse(session, &node_id, BROWSE_TIMEOUT).await {
                    debug!(node_id = %node_id, error = %e, "Skipping subtree during collection");
                }
            }

            for child in self.children(&node_id).unwrap_or_default() {
                if visited.contains(&child.node_id) {
                    continue;
                }
                let child_path = if path.is_empty() {
                    child.name.clone()
                } else {
                    format!("{}/{}", path, child.name)
                };
                queue.push_back((child.node_id, child_path));
            }
        }
    }

    async fn tag_record(
        session: &dyn ProtocolSession,
        node: &AddressSpaceNode,
        path: &str,
    ) -> TagExportRecord {
        let mut record = TagExportRecord {
            node_id: node.node_id.clone(),
            name: node.name.clone(),
            path: path.to_string(),
            ..Default::default()
        };
        match read_node_attributes(session, &node.node_id).await {
            Ok(attributes) => {
                record.data_type = attributes.data_type;
                record.description = attributes.description;
            }
            Err(e) => debug!(node_id = %node.node_id, error = %e, "Tag attributes unavailable"),
        }
        record
    }
}
