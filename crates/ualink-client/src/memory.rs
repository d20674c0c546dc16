//! In-memory automation server.
//!
//! Implements the session traits over a plain node table so the runtime can be driven
//! without a network: the `--simulate` mode of the binary and the integration tests
//! both use it. Writes are type-checked strictly against the representation each
//! variable accepts, the way real servers answer `BadTypeMismatch`.

use crate::session::{
    DataChange, MonitorHandle, ProtocolResult, ProtocolSession, ReferenceDescription,
    SessionOpener,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use ualink_core::error::{ConnectionError, ProtocolError};
use ualink_core::types::{
    AccessLevel, AttributeId, NodeClass, SessionOptions, StatusCode, ROOT_FOLDER_ID,
};
use ualink_core::value::{ArrayValue, DataValue, LocalizedText, Variant};

/// Id of the standard Objects folder under the root.
pub const OBJECTS_FOLDER_ID: &str = "i=85";

const NOTIFICATION_CAPACITY: usize = 1024;

/// One node of the in-memory address space.
#[derive(Debug, Clone)]
pub struct MemoryNode {
    pub node_id: String,
    pub display_name: String,
    pub node_class: NodeClass,
    pub description: String,
    /// Data type node id, e.g. `i=6`
    pub data_type: String,
    pub value: Variant,
    pub value_rank: i32,
    pub access_level: u8,
    /// Representation accepted on write; defaults to the type of the current value
    pub accepted_type: Option<String>,
}

impl MemoryNode {
    fn accepted_type(&self) -> String {
        self.accepted_type
            .clone()
            .unwrap_or_else(|| self.value.type_name())
    }
}

/// Maps a value to the data type id a server would declare for it.
pub fn data_type_id_for(value: &Variant) -> &'static str {
    let name = match value {
        Variant::Array(array) => array.element_type(),
        Variant::Boolean(_) => "Boolean",
        Variant::SByte(_) => "SByte",
        Variant::Byte(_) => "Byte",
        Variant::Int16(_) => "Int16",
        Variant::UInt16(_) => "UInt16",
        Variant::Int32(_) => "Int32",
        Variant::UInt32(_) => "UInt32",
        Variant::Int64(_) => "Int64",
        Variant::UInt64(_) => "UInt64",
        Variant::Float(_) => "Float",
        Variant::Double(_) => "Double",
        Variant::String(_) => "String",
        Variant::DateTime(_) => "DateTime",
        Variant::LocalizedText(_) => "LocalizedText",
        Variant::ByteString(_) => "ByteString",
        Variant::NodeId(_) => "NodeId",
        Variant::Empty => "BaseDataType",
    };
    match name {
        "Boolean" => "i=1",
        "SByte" => "i=2",
        "Byte" => "i=3",
        "Int16" => "i=4",
        "UInt16" => "i=5",
        "Int32" => "i=6",
        "UInt32" => "i=7",
        "Int64" => "i=8",
        "UInt64" => "i=9",
        "Float" => "i=10",
        "Double" => "i=11",
        "String" => "i=12",
        "DateTime" => "i=13",
        "ByteString" => "i=15",
        "NodeId" => "i=17",
        "LocalizedText" => "i=21",
        _ => "i=24",
    }
}

#[derive(Default)]
struct ServerState {
    nodes: RwLock<HashMap<String, MemoryNode>>,
    references: RwLock<HashMap<String, Vec<String>>>,
    /// References that carry no resolvable concrete id
    raw_references: RwLock<HashMap<String, Vec<ReferenceDescription>>>,
    sessions: Mutex<Vec<Weak<SessionShared>>>,
    failing_browse: RwLock<HashSet<String>>,
    failing_monitor: RwLock<HashSet<String>>,
    failing_reads: RwLock<HashSet<String>>,
    writes: Mutex<Vec<(String, Variant)>>,
    last_options: Mutex<Option<SessionOptions>>,
    open_delay: Mutex<Duration>,
    browse_delay: Mutex<Duration>,
    fail_next_opens: AtomicU32,
    open_calls: AtomicUsize,
    browse_calls: AtomicUsize,
    monitors_active: AtomicUsize,
    monitors_released: AtomicUsize,
}

/// Shared handle to an in-memory address space.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("nodes", &self.state.nodes.read().len())
            .field("open_sessions", &self.open_sessions())
            .finish()
    }
}

impl MemoryServer {
    /// Creates a server holding only the Root and Objects folders.
    pub fn new() -> Self {
        let server = Self::default();
        server.insert_node(MemoryNode {
            node_id: ROOT_FOLDER_ID.to_string(),
            display_name: "Root".to_string(),
            node_class: NodeClass::Object,
            description: String::new(),
            data_type: String::new(),
            value: Variant::Empty,
            value_rank: -1,
            access_level: 0,
            accepted_type: None,
        });
        server.add_object(ROOT_FOLDER_ID, OBJECTS_FOLDER_ID, "Objects");
        server
    }

    /// A small packaging line, used by the binary's simulation mode.
    pub fn demo_plant() -> Self {
        let server = Self::new();
        server.add_object(OBJECTS_FOLDER_ID, "ns=2;s=Line1", "Line1");
        server.add_variable("ns=2;s=Line1", "ns=2;s=Line1.Speed", "Speed", Variant::Float(12.5));
        server.add_variable("ns=2;s=Line1", "ns=2;s=Line1.Count", "Count", Variant::UInt32(0));
        server.add_variable("ns=2;s=Line1", "ns=2;s=Line1.Running", "Running", Variant::Boolean(true));
        server.add_variable(
            "ns=2;s=Line1",
            "ns=2;s=Line1.Recipe",
            "Recipe",
            Variant::String("default".to_string()),
        );
        server.add_variable(
            "ns=2;s=Line1",
            "ns=2;s=Line1.Setpoints",
            "Setpoints",
            Variant::Array(ArrayValue::Double(vec![1.0, 2.0, 3.0])),
        );
        server.add_variable(
            "ns=2;s=Line1",
            "ns=2;s=Line1.Signature",
            "Signature",
            Variant::ByteString(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        );
        server.add_method("ns=2;s=Line1", "ns=2;s=Line1.Reset", "Reset");
        server.set_access_level("ns=2;s=Line1.Count", AccessLevel::CURRENT_READ);
        server
    }

    fn insert_node(&self, node: MemoryNode) {
        self.state.nodes.write().insert(node.node_id.clone(), node);
    }

    /// Adds a hierarchical reference; cycles are allowed.
    pub fn add_reference(&self, parent: &str, child: &str) {
        self.state
            .references
            .write()
            .entry(parent.to_string())
            .or_default()
            .push(child.to_string());
    }

    /// Adds a reference the server cannot resolve to a concrete id.
    pub fn add_raw_reference(&self, parent: &str, reference: ReferenceDescription) {
        self.state
            .raw_references
            .write()
            .entry(parent.to_string())
            .or_default()
            .push(reference);
    }

    pub fn add_object(&self, parent: &str, node_id: &str, name: &str) {
        self.insert_node(MemoryNode {
            node_id: node_id.to_string(),
            display_name: name.to_string(),
            node_class: NodeClass::Object,
            description: String::new(),
            data_type: String::new(),
            value: Variant::Empty,
            value_rank: -1,
            access_level: 0,
            accepted_type: None,
        });
        self.add_reference(parent, node_id);
    }

    pub fn add_method(&self, parent: &str, node_id: &str, name: &str) {
        self.insert_node(MemoryNode {
            node_id: node_id.to_string(),
            display_name: name.to_string(),
            node_class: NodeClass::Method,
            description: String::new(),
            data_type: String::new(),
            value: Variant::Empty,
            value_rank: -1,
            access_level: 0,
            accepted_type: None,
        });
        self.add_reference(parent, node_id);
    }

    /// Adds a readable and writable variable whose declared type follows the value.
    pub fn add_variable(&self, parent: &str, node_id: &str, name: &str, value: Variant) {
        let value_rank = if value.is_array() { 1 } else { -1 };
        self.insert_node(MemoryNode {
            node_id: node_id.to_string(),
            display_name: name.to_string(),
            node_class: NodeClass::Variable,
            description: format!("{} value", name),
            data_type: data_type_id_for(&value).to_string(),
            value,
            value_rank,
            access_level: AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE,
            accepted_type: None,
        });
        self.add_reference(parent, node_id);
    }

    fn update_node(&self, node_id: &str, f: impl FnOnce(&mut MemoryNode)) {
        if let Some(node) = self.state.nodes.write().get_mut(node_id) {
            f(node);
        }
    }

    pub fn set_access_level(&self, node_id: &str, access_level: u8) {
        self.update_node(node_id, |node| node.access_level = access_level);
    }

    /// Overrides the declared data type id without touching the value.
    pub fn set_data_type(&self, node_id: &str, data_type: &str) {
        self.update_node(node_id, |node| node.data_type = data_type.to_string());
    }

    /// Overrides the representation the node accepts on write, e.g. `Float[]`.
    pub fn set_accepted_type(&self, node_id: &str, type_name: &str) {
        self.update_node(node_id, |node| node.accepted_type = Some(type_name.to_string()));
    }

    pub fn set_value_rank(&self, node_id: &str, value_rank: i32) {
        self.update_node(node_id, |node| node.value_rank = value_rank);
    }

    pub fn set_description(&self, node_id: &str, description: &str) {
        self.update_node(node_id, |node| node.description = description.to_string());
    }

    /// Makes the next `count` session opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.fail_next_opens.store(count, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock() = delay;
    }

    pub fn set_browse_delay(&self, delay: Duration) {
        *self.state.browse_delay.lock() = delay;
    }

    pub fn fail_browse(&self, node_id: &str) {
        self.state.failing_browse.write().insert(node_id.to_string());
    }

    pub fn fail_monitor(&self, node_id: &str) {
        self.state.failing_monitor.write().insert(node_id.to_string());
    }

    /// Attribute reads of the node fail; writes still go through.
    pub fn fail_reads(&self, node_id: &str) {
        self.state.failing_reads.write().insert(node_id.to_string());
    }

    pub fn node(&self, node_id: &str) -> Option<MemoryNode> {
        self.state.nodes.read().get(node_id).cloned()
    }

    pub fn value(&self, node_id: &str) -> Option<Variant> {
        self.node(node_id).map(|n| n.value)
    }

    /// Every accepted write, in order.
    pub fn writes(&self) -> Vec<(String, Variant)> {
        self.state.writes.lock().clone()
    }

    /// Options passed to the most recent open.
    pub fn last_options(&self) -> Option<SessionOptions> {
        self.state.last_options.lock().clone()
    }

    pub fn open_calls(&self) -> usize {
        self.state.open_calls.load(Ordering::SeqCst)
    }

    pub fn browse_calls(&self) -> usize {
        self.state.browse_calls.load(Ordering::SeqCst)
    }

    pub fn monitors_active(&self) -> usize {
        self.state.monitors_active.load(Ordering::SeqCst)
    }

    pub fn monitors_released(&self) -> usize {
        self.state.monitors_released.load(Ordering::SeqCst)
    }

    /// Sessions that are open and not closed.
    pub fn open_sessions(&self) -> usize {
        self.state
            .sessions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| !s.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Sets a value from the server side and notifies every monitoring session.
    pub fn push_change(&self, node_id: &str, value: Variant, status: StatusCode) {
        if status.is_good() {
            self.update_node(node_id, |node| node.value = value.clone());
        }
        self.notify(node_id, value, status);
    }

    fn notify(&self, node_id: &str, value: Variant, status: StatusCode) {
        let sessions: Vec<Arc<SessionShared>> = {
            let mut sessions = self.state.sessions.lock();
            sessions.retain(|s| s.strong_count() > 0);
            sessions.iter().filter_map(Weak::upgrade).collect()
        };

        for session in sessions {
            if session.closed.load(Ordering::SeqCst) || !session.monitored.lock().contains(node_id) {
                continue;
            }
            let change = DataChange {
                node_id: node_id.to_string(),
                value: value.clone(),
                status,
            };
            if session.notify_tx.try_send(change).is_err() {
                debug!(node_id, "Dropping notification for saturated session");
            }
        }
    }

    /// Advances numeric demo values until `cancel` fires.
    pub async fn run_simulation(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        let mut tick: u32 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tick = tick.wrapping_add(1);
                    self.push_change("ns=2;s=Line1.Count", Variant::UInt32(tick), StatusCode::GOOD);
                    let speed = 12.5 + (tick % 10) as f32 * 0.5;
                    self.push_change("ns=2;s=Line1.Speed", Variant::Float(speed), StatusCode::GOOD);
                }
            }
        }
    }

    fn lookup(&self, node_id: &str) -> ProtocolResult<MemoryNode> {
        self.node(node_id).ok_or_else(|| ProtocolError::UnknownNode {
            node_id: node_id.to_string(),
        })
    }

    fn read_attribute(node: &MemoryNode, attribute: AttributeId) -> DataValue {
        let is_variable = node.node_class == NodeClass::Variable;
        let value = match attribute {
            AttributeId::NodeId => Variant::NodeId(node.node_id.clone()),
            AttributeId::NodeClass => Variant::Int32(node.node_class.value() as i32),
            AttributeId::BrowseName => Variant::String(node.display_name.clone()),
            AttributeId::DisplayName => {
                Variant::LocalizedText(LocalizedText::new("", node.display_name.clone()))
            }
            AttributeId::Description => {
                Variant::LocalizedText(LocalizedText::new("", node.description.clone()))
            }
            AttributeId::Value if is_variable => node.value.clone(),
            AttributeId::DataType if is_variable => Variant::NodeId(node.data_type.clone()),
            AttributeId::ValueRank if is_variable => Variant::Int32(node.value_rank),
            AttributeId::ArrayDimensions if is_variable => match &node.value {
                Variant::Array(array) => {
                    Variant::Array(ArrayValue::UInt32(vec![array.len() as u32]))
                }
                _ => Variant::Array(ArrayValue::UInt32(Vec::new())),
            },
            AttributeId::AccessLevel | AttributeId::UserAccessLevel if is_variable => {
                Variant::Byte(node.access_level)
            }
            _ => return DataValue::bad(StatusCode::BAD_ATTRIBUTE_ID_INVALID),
        };
        DataValue::new(value)
    }
}

#[async_trait]
impl SessionOpener for MemoryServer {
    async fn open(
        &self,
        endpoint: &str,
        options: &SessionOptions,
    ) -> Result<Arc<dyn ProtocolSession>, ConnectionError> {
        self.state.open_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .state
            .fail_next_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectionError::rejected(endpoint, "BadServerNotConnected"));
        }

        *self.state.last_options.lock() = Some(options.clone());

        let (notify_tx, notify_rx) = flume::bounded(NOTIFICATION_CAPACITY);
        let shared = Arc::new(SessionShared {
            closed: AtomicBool::new(false),
            monitored: Mutex::new(HashSet::new()),
            notify_tx,
            notify_rx,
        });
        self.state.sessions.lock().push(Arc::downgrade(&shared));

        Ok(Arc::new(MemorySession {
            server: self.clone(),
            shared,
        }))
    }
}

struct SessionShared {
    closed: AtomicBool,
    monitored: Mutex<HashSet<String>>,
    notify_tx: flume::Sender<DataChange>,
    notify_rx: flume::Receiver<DataChange>,
}

/// A session against a `MemoryServer`.
pub struct MemorySession {
    server: MemoryServer,
    shared: Arc<SessionShared>,
}

impl MemorySession {
    fn ensure_open(&self) -> ProtocolResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(ProtocolError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProtocolSession for MemorySession {
    async fn close(&self) -> ProtocolResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.monitored.lock().clear();
        Ok(())
    }

    async fn browse(&self, node_id: &str) -> ProtocolResult<Vec<ReferenceDescription>> {
        self.ensure_open()?;
        self.server.state.browse_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.server.state.browse_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.server.state.failing_browse.read().contains(node_id) {
            return Err(ProtocolError::Transport {
                reason: format!("browse of {} refused", node_id),
            });
        }
        self.server.lookup(node_id)?;

        let children = self
            .server
            .state
            .references
            .read()
            .get(node_id)
            .cloned()
            .unwrap_or_default();

        let nodes = self.server.state.nodes.read();
        let mut references: Vec<ReferenceDescription> = children
            .iter()
            .filter_map(|child| nodes.get(child))
            .map(|node| ReferenceDescription {
                node_id: Some(node.node_id.clone()),
                expanded_id: node.node_id.clone(),
                display_name: node.display_name.clone(),
                node_class: node.node_class,
            })
            .collect();

        if let Some(raw) = self.server.state.raw_references.read().get(node_id) {
            references.extend(raw.iter().cloned());
        }

        Ok(references)
    }

    async fn read_attributes(
        &self,
        node_id: &str,
        attributes: &[AttributeId],
    ) -> ProtocolResult<Vec<DataValue>> {
        self.ensure_open()?;
        if self.server.state.failing_reads.read().contains(node_id) {
            return Err(ProtocolError::Transport {
                reason: format!("read of {} refused", node_id),
            });
        }
        let node = self.server.lookup(node_id)?;
        Ok(attributes
            .iter()
            .map(|attribute| MemoryServer::read_attribute(&node, *attribute))
            .collect())
    }

    async fn write_value(&self, node_id: &str, value: Variant) -> ProtocolResult<()> {
        self.ensure_open()?;

        {
            let mut nodes = self.server.state.nodes.write();
            let node = nodes.get_mut(node_id).ok_or_else(|| {
                ProtocolError::bad_status("write", node_id, StatusCode::BAD_NODE_ID_UNKNOWN)
            })?;

            if !AccessLevel(node.access_level).is_writable() {
                return Err(ProtocolError::bad_status(
                    "write",
                    node_id,
                    StatusCode::BAD_NOT_WRITABLE,
                ));
            }

            if value.type_name() != node.accepted_type() {
                return Err(ProtocolError::bad_status(
                    "write",
                    node_id,
                    StatusCode::BAD_TYPE_MISMATCH,
                ));
            }

            node.value = value.clone();
        }

        self.server
            .state
            .writes
            .lock()
            .push((node_id.to_string(), value.clone()));
        self.server.notify(node_id, value, StatusCode::GOOD);
        Ok(())
    }

    async fn monitor(&self, node_id: &str) -> ProtocolResult<Box<dyn MonitorHandle>> {
        self.ensure_open()?;
        self.server.lookup(node_id)?;

        if self.server.state.failing_monitor.read().contains(node_id) {
            return Err(ProtocolError::bad_status(
                "monitor",
                node_id,
                StatusCode::BAD_USER_ACCESS_DENIED,
            ));
        }

        self.shared.monitored.lock().insert(node_id.to_string());
        self.server.state.monitors_active.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryMonitor {
            node_id: node_id.to_string(),
            server: self.server.clone(),
            session: Arc::downgrade(&self.shared),
        }))
    }

    fn notifications(&self) -> flume::Receiver<DataChange> {
        self.shared.notify_rx.clone()
    }
}

struct MemoryMonitor {
    node_id: String,
    server: MemoryServer,
    session: Weak<SessionShared>,
}

#[async_trait]
impl MonitorHandle for MemoryMonitor {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn release(self: Box<Self>) -> ProtocolResult<()> {
        if let Some(session) = self.session.upgrade() {
            session.monitored.lock().remove(&self.node_id);
        }
        self.server.state.monitors_active.fetch_sub(1, Ordering::SeqCst);
        self.server.state.monitors_released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
