use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ualink_core::error::{ConnectionError, ProtocolError};
use ualink_core::types::{AttributeId, NodeClass, SessionOptions, StatusCode};
use ualink_core::value::{DataValue, Variant};

/// Result type for single protocol requests
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// One forward hierarchical reference returned by a browse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDescription {
    /// Concrete node id of the target, when the server resolved one
    pub node_id: Option<String>,
    /// Expanded id string, e.g. `nsu=urn:vendor;s=Motor1`
    pub expanded_id: String,
    pub display_name: String,
    pub node_class: NodeClass,
}

impl ReferenceDescription {
    /// Best id for the target: the concrete id, else the expanded string.
    pub fn target_id(&self) -> Option<&str> {
        match self.node_id.as_deref() {
            Some(id) if !id.is_empty() => Some(id),
            _ if !self.expanded_id.is_empty() => Some(self.expanded_id.as_str()),
            _ => None,
        }
    }
}

/// A monitored-item notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub node_id: String,
    pub value: Variant,
    pub status: StatusCode,
}

/// Opens sessions against an endpoint.
///
/// Implementations own the wire protocol, channel security and framing.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    /// Open and activate a session.
    ///
    /// The caller applies the connect deadline; implementations only need to
    /// be cancel-safe.
    async fn open(
        &self,
        endpoint: &str,
        options: &SessionOptions,
    ) -> Result<Arc<dyn ProtocolSession>, ConnectionError>;
}

/// A live session.
///
/// Deadlines are applied by callers with `tokio::time::timeout`.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Close the session. Must be safe to call more than once.
    async fn close(&self) -> ProtocolResult<()>;

    /// Forward hierarchical references of a node, subtypes included.
    async fn browse(&self, node_id: &str) -> ProtocolResult<Vec<ReferenceDescription>>;

    /// Read several attributes of one node, results in request order.
    ///
    /// An attribute the node does not have comes back with a bad status rather
    /// than failing the whole call.
    async fn read_attributes(
        &self,
        node_id: &str,
        attributes: &[AttributeId],
    ) -> ProtocolResult<Vec<DataValue>>;

    /// Read the current value of a variable.
    async fn read_value(&self, node_id: &str) -> ProtocolResult<DataValue> {
        let mut values = self.read_attributes(node_id, &[AttributeId::Value]).await?;
        values.pop().ok_or_else(|| ProtocolError::Transport {
            reason: format!("empty read response for {}", node_id),
        })
    }

    /// Write the Value attribute. A bad status is returned as `ProtocolError::BadStatus`.
    async fn write_value(&self, node_id: &str, value: Variant) -> ProtocolResult<()>;

    /// Start monitoring a node's value.
    async fn monitor(&self, node_id: &str) -> ProtocolResult<Box<dyn MonitorHandle>>;

    /// Stream of notifications for every monitored item of this session.
    fn notifications(&self) -> flume::Receiver<DataChange>;
}

/// Ownership of one monitored item. Releasing consumes the handle.
#[async_trait]
pub trait MonitorHandle: Send + Sync {
    fn node_id(&self) -> &str;

    async fn release(self: Box<Self>) -> ProtocolResult<()>;
}

impl std::fmt::Debug for dyn MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("node_id", &self.node_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_id_prefers_concrete() {
        let reference = ReferenceDescription {
            node_id: Some("ns=2;s=Motor".into()),
            expanded_id: "nsu=urn:plant;s=Motor".into(),
            display_name: "Motor".into(),
            node_class: NodeClass::Object,
        };
        assert_eq!(reference.target_id(), Some("ns=2;s=Motor"));
    }

    #[test]
    fn test_target_id_falls_back_to_expanded() {
        let reference = ReferenceDescription {
            node_id: None,
            expanded_id: "nsu=urn:plant;s=Motor".into(),
            display_name: "Motor".into(),
            node_class: NodeClass::Object,
        };
        assert_eq!(reference.target_id(), Some("nsu=urn:plant;s=Motor"));

        let empty = ReferenceDescription {
            node_id: Some(String::new()),
            expanded_id: String::new(),
            display_name: String::new(),
            node_class: NodeClass::Object,
        };
        assert_eq!(empty.target_id(), None);
    }
}
