//! Core address-space and session types.
//!
//! Node ids are carried as their canonical string form (`i=84`, `ns=2;s=Line1.Speed`)
//! everywhere above the protocol layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Well-known id of the address-space root folder.
pub const ROOT_FOLDER_ID: &str = "i=84";

// ============================================================================
// Node Classes and Attributes
// ============================================================================

/// Class of an address-space node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeClass {
    #[default]
    Unspecified,
    Object,
    Variable,
    Method,
    ObjectType,
    VariableType,
    ReferenceType,
    DataType,
    View,
}

impl NodeClass {
    /// Decodes the wire value of a node class mask bit.
    pub fn from_value(value: u32) -> Self {
        match value {
            1 => NodeClass::Object,
            2 => NodeClass::Variable,
            4 => NodeClass::Method,
            8 => NodeClass::ObjectType,
            16 => NodeClass::VariableType,
            32 => NodeClass::ReferenceType,
            64 => NodeClass::DataType,
            128 => NodeClass::View,
            _ => NodeClass::Unspecified,
        }
    }

    /// Wire value of this node class.
    pub fn value(self) -> u32 {
        match self {
            NodeClass::Unspecified => 0,
            NodeClass::Object => 1,
            NodeClass::Variable => 2,
            NodeClass::Method => 4,
            NodeClass::ObjectType => 8,
            NodeClass::VariableType => 16,
            NodeClass::ReferenceType => 32,
            NodeClass::DataType => 64,
            NodeClass::View => 128,
        }
    }

    /// Variables and methods are leaves; everything else may have children.
    pub fn may_have_children(self) -> bool {
        !matches!(self, NodeClass::Variable | NodeClass::Method)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeClass::Unspecified => "Unspecified",
            NodeClass::Object => "Object",
            NodeClass::Variable => "Variable",
            NodeClass::Method => "Method",
            NodeClass::ObjectType => "ObjectType",
            NodeClass::VariableType => "VariableType",
            NodeClass::ReferenceType => "ReferenceType",
            NodeClass::DataType => "DataType",
            NodeClass::View => "View",
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute ids read by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeId {
    NodeId = 1,
    NodeClass = 2,
    BrowseName = 3,
    DisplayName = 4,
    Description = 5,
    Value = 13,
    DataType = 14,
    ValueRank = 15,
    ArrayDimensions = 16,
    AccessLevel = 17,
    UserAccessLevel = 18,
}

/// Variable access level bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessLevel(pub u8);

impl AccessLevel {
    pub const CURRENT_READ: u8 = 0x01;
    pub const CURRENT_WRITE: u8 = 0x02;
    pub const HISTORY_READ: u8 = 0x04;
    pub const HISTORY_WRITE: u8 = 0x08;
    pub const SEMANTIC_CHANGE: u8 = 0x10;
    pub const STATUS_WRITE: u8 = 0x20;
    pub const TIMESTAMP_WRITE: u8 = 0x40;

    const NAMES: [(u8, &'static str); 7] = [
        (Self::CURRENT_READ, "Read"),
        (Self::CURRENT_WRITE, "Write"),
        (Self::HISTORY_READ, "HistoryRead"),
        (Self::HISTORY_WRITE, "HistoryWrite"),
        (Self::SEMANTIC_CHANGE, "SemanticChange"),
        (Self::STATUS_WRITE, "StatusWrite"),
        (Self::TIMESTAMP_WRITE, "TimestampWrite"),
    ];

    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::CURRENT_WRITE)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if parts.is_empty() {
            f.write_str("None")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Maps a data type node id to its builtin type name.
///
/// Ids outside namespace 0 (vendor structures and enumerations) are returned as-is.
pub fn builtin_type_name(data_type_id: &str) -> String {
    let Some(raw) = data_type_id.strip_prefix("i=") else {
        return data_type_id.to_string();
    };
    let name = match raw.parse::<u32>() {
        Ok(1) => "Boolean",
        Ok(2) => "SByte",
        Ok(3) => "Byte",
        Ok(4) => "Int16",
        Ok(5) => "UInt16",
        Ok(6) => "Int32",
        Ok(7) => "UInt32",
        Ok(8) => "Int64",
        Ok(9) => "UInt64",
        Ok(10) => "Float",
        Ok(11) => "Double",
        Ok(12) => "String",
        Ok(13) => "DateTime",
        Ok(14) => "Guid",
        Ok(15) => "ByteString",
        Ok(16) => "XmlElement",
        Ok(17) => "NodeId",
        Ok(18) => "ExpandedNodeId",
        Ok(19) => "StatusCode",
        Ok(20) => "QualifiedName",
        Ok(21) => "LocalizedText",
        Ok(22) => "ExtensionObject",
        Ok(23) => "DataValue",
        Ok(24) => "Variant",
        Ok(25) => "DiagnosticInfo",
        _ => return data_type_id.to_string(),
    };
    name.to_string()
}

// ============================================================================
// Status Codes
// ============================================================================

/// A raw 32-bit protocol status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const UNCERTAIN: StatusCode = StatusCode(0x4000_0000);
    pub const UNCERTAIN_LAST_USABLE_VALUE: StatusCode = StatusCode(0x4090_0000);
    pub const BAD: StatusCode = StatusCode(0x8000_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_USER_ACCESS_DENIED: StatusCode = StatusCode(0x801F_0000);
    pub const BAD_WAITING_FOR_INITIAL_DATA: StatusCode = StatusCode(0x8032_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_ATTRIBUTE_ID_INVALID: StatusCode = StatusCode(0x8035_0000);
    pub const BAD_NOT_READABLE: StatusCode = StatusCode(0x803A_0000);
    pub const BAD_NOT_WRITABLE: StatusCode = StatusCode(0x803B_0000);
    pub const BAD_OUT_OF_RANGE: StatusCode = StatusCode(0x803C_0000);
    pub const BAD_TYPE_MISMATCH: StatusCode = StatusCode(0x8074_0000);

    const SYMBOLS: [(u32, &'static str); 14] = [
        (0x0000_0000, "Good"),
        (0x4000_0000, "Uncertain"),
        (0x4090_0000, "UncertainLastUsableValue"),
        (0x8000_0000, "Bad"),
        (0x8005_0000, "BadCommunicationError"),
        (0x800A_0000, "BadTimeout"),
        (0x801F_0000, "BadUserAccessDenied"),
        (0x8032_0000, "BadWaitingForInitialData"),
        (0x8034_0000, "BadNodeIdUnknown"),
        (0x8035_0000, "BadAttributeIdInvalid"),
        (0x803A_0000, "BadNotReadable"),
        (0x803B_0000, "BadNotWritable"),
        (0x803C_0000, "BadOutOfRange"),
        (0x8074_0000, "BadTypeMismatch"),
    ];

    pub fn is_good(self) -> bool {
        self.0 >> 30 == 0
    }

    pub fn is_bad(self) -> bool {
        self.0 >> 30 == 2
    }

    pub fn is_type_mismatch(self) -> bool {
        self.0 & 0xFFFF_0000 == Self::BAD_TYPE_MISMATCH.0
    }

    /// Symbolic name of the code, ignoring the info bits.
    pub fn symbolic_name(self) -> String {
        let code = self.0 & 0xFFFF_0000;
        Self::SYMBOLS
            .iter()
            .find(|(raw, _)| *raw == code)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| format!("0x{:08X}", code))
    }

    /// Splits the code into its display fields.
    pub fn decode(self) -> StatusInfo {
        let raw = self.0;
        let severity = match (raw >> 30) & 0x3 {
            0 => Severity::Good,
            1 => Severity::Uncertain,
            2 => Severity::Bad,
            _ => Severity::Unknown,
        };
        StatusInfo {
            severity,
            symbolic_name: self.symbolic_name(),
            sub_code: ((raw >> 16) & 0x3FFF) as u16,
            structure_changed: raw & 0x0000_8000 != 0,
            semantics_changed: raw & 0x0000_4000 != 0,
            info_bits: (raw & 0x0000_3FFF) as u16,
            raw: format!("0x{:08X}", raw),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.symbolic_name(), self.0)
    }
}

/// Severity bits of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Severity {
    #[default]
    Good,
    Uncertain,
    Bad,
    Unknown,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Good => "Good",
            Severity::Uncertain => "Uncertain",
            Severity::Bad => "Bad",
            Severity::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Decoded status code fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub severity: Severity,
    pub symbolic_name: String,
    pub sub_code: u16,
    pub structure_changed: bool,
    pub semantics_changed: bool,
    pub info_bits: u16,
    pub raw: String,
}

// ============================================================================
// Address Space Records
// ============================================================================

/// One node in the address-space cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpaceNode {
    pub node_id: String,
    pub name: String,
    pub node_class: NodeClass,
    pub has_children: bool,
}

/// Public state of a watched variable.
///
/// This is also the broadcast payload: every hub delivery is an owned clone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchItem {
    pub node_id: String,
    pub name: String,
    pub data_type: String,
    pub value: String,
    pub timestamp: String,
    pub severity: String,
    pub symbolic_name: String,
    pub sub_code: u16,
    pub structure_changed: bool,
    pub semantics_changed: bool,
    pub info_bits: u16,
    pub raw_code: String,
}

impl WatchItem {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            name: node_id.clone(),
            node_id,
            ..Default::default()
        }
    }

    /// Snapshot built from freshly read attributes, stamped with the current time.
    pub fn from_attributes(attributes: &NodeAttributes) -> Self {
        let mut item = Self::new(attributes.node_id.clone());
        if !attributes.name.is_empty() {
            item.name = attributes.name.clone();
        }
        item.data_type = attributes.data_type.clone();
        item.value = attributes.value.clone();
        item.stamp_now();
        item
    }

    /// Sets the timestamp to the local wall clock as `HH:MM:SS.mmm`.
    pub fn stamp_now(&mut self) {
        self.timestamp = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
    }

    /// Copies decoded status fields onto the item.
    pub fn apply_status(&mut self, status: StatusCode) {
        let info = status.decode();
        self.severity = info.severity.to_string();
        self.symbolic_name = info.symbolic_name;
        self.sub_code = info.sub_code;
        self.structure_changed = info.structure_changed;
        self.semantics_changed = info.semantics_changed;
        self.info_bits = info.info_bits;
        self.raw_code = info.raw;
    }
}

/// Message delivered to hub subscribers.
pub type BroadcastMessage = WatchItem;

/// Formatted attributes of a single node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub node_id: String,
    pub name: String,
    pub description: String,
    pub node_class: String,
    pub data_type: String,
    pub access_level: String,
    pub value: String,
    /// -1 for scalars, 0 or more for arrays
    pub value_rank: i32,
    pub array_dimensions: Vec<u32>,
    #[serde(skip)]
    pub writable: bool,
}

impl NodeAttributes {
    pub fn is_array(&self) -> bool {
        self.value_rank >= 0
    }
}

/// Variable node record produced by tag collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagExportRecord {
    pub node_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

// ============================================================================
// Session Options
// ============================================================================

/// Security policy of the secure channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecurityPolicy {
    #[default]
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
    Aes256Sha256RsaPss,
    /// Policy given as a URI that is not in the list above
    Custom(String),
}

impl SecurityPolicy {
    pub const URI_PREFIX: &'static str = "http://opcfoundation.org/UA/SecurityPolicy#";

    pub fn uri(&self) -> String {
        match self {
            SecurityPolicy::Custom(uri) => uri.clone(),
            other => format!("{}{}", Self::URI_PREFIX, other.short_name()),
        }
    }

    pub fn short_name(&self) -> &str {
        match self {
            SecurityPolicy::None => "None",
            SecurityPolicy::Basic128Rsa15 => "Basic128Rsa15",
            SecurityPolicy::Basic256 => "Basic256",
            SecurityPolicy::Basic256Sha256 => "Basic256Sha256",
            SecurityPolicy::Aes128Sha256RsaOaep => "Aes128_Sha256_RsaOaep",
            SecurityPolicy::Aes256Sha256RsaPss => "Aes256_Sha256_RsaPss",
            SecurityPolicy::Custom(uri) => uri.rsplit('#').next().unwrap_or(uri),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, SecurityPolicy::None)
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Message security mode of the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityMode::None => "None",
            SecurityMode::Sign => "Sign",
            SecurityMode::SignAndEncrypt => "SignAndEncrypt",
        };
        f.write_str(s)
    }
}

/// User identity presented when activating the session.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum UserIdentity {
    #[default]
    Anonymous,
    UserName {
        username: String,
        password: String,
        policy_id: Option<String>,
    },
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserIdentity::Anonymous => f.write_str("Anonymous"),
            UserIdentity::UserName {
                username,
                policy_id,
                ..
            } => f
                .debug_struct("UserName")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .field("policy_id", policy_id)
                .finish(),
        }
    }
}

/// Everything the protocol layer needs to open a session.
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub security_policy: SecurityPolicy,
    pub security_mode: SecurityMode,
    pub identity: UserIdentity,
    /// DER client certificate, present only for secure modes
    pub certificate_der: Option<Vec<u8>>,
    /// DER private key, present only for secure modes
    pub private_key_der: Option<Vec<u8>>,
    pub application_uri: String,
    pub product_uri: String,
    pub session_name: String,
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("security_policy", &self.security_policy)
            .field("security_mode", &self.security_mode)
            .field("identity", &self.identity)
            .field(
                "certificate_der",
                &self.certificate_der.as_ref().map(|_| "[CERTIFICATE]"),
            )
            .field(
                "private_key_der",
                &self.private_key_der.as_ref().map(|_| "[PRIVATE KEY]"),
            )
            .field("application_uri", &self.application_uri)
            .field("product_uri", &self.product_uri)
            .field("session_name", &self.session_name)
            .field("session_timeout", &self.session_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decode_good() {
        let info = StatusCode::GOOD.decode();
        assert_eq!(info.severity, Severity::Good);
        assert_eq!(info.symbolic_name, "Good");
        assert_eq!(info.raw, "0x00000000");
    }

    #[test]
    fn test_status_decode_fields() {
        let info = StatusCode(0x8074_C012).decode();
        assert_eq!(info.severity, Severity::Bad);
        assert_eq!(info.symbolic_name, "BadTypeMismatch");
        assert_eq!(info.sub_code, 0x0074);
        assert!(info.structure_changed);
        assert!(info.semantics_changed);
        assert_eq!(info.info_bits, 0x0012);
        assert_eq!(info.raw, "0x8074C012");
    }

    #[test]
    fn test_status_decode_uncertain_and_unknown() {
        assert_eq!(
            StatusCode::UNCERTAIN_LAST_USABLE_VALUE.decode().severity,
            Severity::Uncertain
        );
        let info = StatusCode(0xC123_0000).decode();
        assert_eq!(info.severity, Severity::Unknown);
        assert_eq!(info.symbolic_name, "0xC1230000");
    }

    #[test]
    fn test_access_level_display() {
        assert_eq!(AccessLevel(0).to_string(), "None");
        assert_eq!(AccessLevel(0x03).to_string(), "Read, Write");
        assert_eq!(
            AccessLevel(0x45).to_string(),
            "Read, HistoryRead, TimestampWrite"
        );
        assert!(AccessLevel(0x03).is_writable());
        assert!(!AccessLevel(0x01).is_writable());
    }

    #[test]
    fn test_watch_item_from_attributes() {
        let attributes = NodeAttributes {
            node_id: "ns=2;s=Speed".to_string(),
            name: "Speed".to_string(),
            data_type: "Float".to_string(),
            value: "12.5".to_string(),
            ..Default::default()
        };
        let item = WatchItem::from_attributes(&attributes);
        assert_eq!(item.name, "Speed");
        assert_eq!(item.value, "12.5");
        // HH:MM:SS.mmm
        assert_eq!(item.timestamp.len(), 12);
        assert_eq!(&item.timestamp[8..9], ".");
    }

    #[test]
    fn test_builtin_type_name() {
        assert_eq!(builtin_type_name("i=1"), "Boolean");
        assert_eq!(builtin_type_name("i=10"), "Float");
        assert_eq!(builtin_type_name("i=25"), "DiagnosticInfo");
        assert_eq!(builtin_type_name("i=999"), "i=999");
        assert_eq!(builtin_type_name("ns=3;i=3002"), "ns=3;i=3002");
    }

    #[test]
    fn test_node_class_children() {
        assert!(NodeClass::Object.may_have_children());
        assert!(NodeClass::View.may_have_children());
        assert!(!NodeClass::Variable.may_have_children());
        assert!(!NodeClass::Method.may_have_children());
        assert_eq!(NodeClass::from_value(2), NodeClass::Variable);
        assert_eq!(NodeClass::from_value(3), NodeClass::Unspecified);
    }

    #[test]
    fn test_security_policy_uri() {
        assert_eq!(
            SecurityPolicy::Basic256Sha256.uri(),
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
        );
        assert_eq!(
            SecurityPolicy::Aes128Sha256RsaOaep.uri(),
            "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
        );
    }

    #[test]
    fn test_session_options_debug_redacts_secrets() {
        let options = SessionOptions {
            identity: UserIdentity::UserName {
                username: "operator".into(),
                password: "hunter2".into(),
                policy_id: None,
            },
            private_key_der: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        let rendered = format!("{:?}", options);
        assert!(rendered.contains("operator"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[PRIVATE KEY]"));
    }

    #[test]
    fn test_watch_item_apply_status() {
        let mut item = WatchItem::new("ns=2;s=Speed");
        assert_eq!(item.name, "ns=2;s=Speed");
        item.apply_status(StatusCode::BAD_WAITING_FOR_INITIAL_DATA);
        assert_eq!(item.severity, "Bad");
        assert_eq!(item.symbolic_name, "BadWaitingForInitialData");
        assert_eq!(item.raw_code, "0x80320000");
    }
}
