//! Error types for the ualink protocol client runtime.
//!
//! Every failure in the runtime core is returned as one of these enums or logged at the
//! point where it happens. All variants are serializable so the HTTP layer can hand them
//! back verbatim.

use crate::types::{StatusCode, TagExportRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using UalinkError as the error type.
pub type Result<T> = std::result::Result<T, UalinkError>;

/// Top-level error type for all ualink operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum UalinkError {
    /// Session establishment and lifecycle errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Errors reported by the protocol layer for a single request
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Address-space traversal errors
    #[error("Browse error: {0}")]
    Browse(#[from] BrowseError),

    /// Write pipeline errors
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// Certificate and secure channel errors
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl UalinkError {
    /// Returns true when the error means there is no live session.
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            UalinkError::Connection(ConnectionError::NotConnected)
                | UalinkError::Browse(BrowseError::NotConnected)
        )
    }
}

/// Errors related to the session lifecycle.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ConnectionError {
    /// No live session
    #[error("not connected")]
    NotConnected,

    /// Session open did not complete before its deadline
    #[error("Connection to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// The server or protocol layer refused the session
    #[error("Connection to {endpoint} rejected: {reason}")]
    Rejected { endpoint: String, reason: String },

    /// Every attempt in the retry budget failed
    #[error("Failed to connect to {endpoint} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    /// The session was closed underneath us
    #[error("Session closed: {reason}")]
    Closed { reason: String },
}

impl ConnectionError {
    /// Creates a timeout error.
    pub fn timeout(endpoint: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            endpoint: endpoint.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Creates a rejection error.
    pub fn rejected(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error is transient and the operation can be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::Timeout { .. } | ConnectionError::Closed { .. }
        )
    }
}

/// Errors returned by a single protocol-layer request.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ProtocolError {
    /// Request did not complete before its deadline
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Server answered with a bad status code
    #[error("{operation} on {node_id} failed: {status}")]
    BadStatus {
        operation: String,
        node_id: String,
        status: StatusCode,
    },

    /// Node id is not known to the server
    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },

    /// The session is no longer usable
    #[error("Session is closed")]
    SessionClosed,

    /// Anything else the transport reports
    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

impl ProtocolError {
    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Creates a bad status error.
    pub fn bad_status(
        operation: impl Into<String>,
        node_id: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self::BadStatus {
            operation: operation.into(),
            node_id: node_id.into(),
            status,
        }
    }

    /// Returns true if the server rejected a value because of its type.
    pub fn is_type_mismatch(&self) -> bool {
        match self {
            ProtocolError::BadStatus { status, .. } => status.is_type_mismatch(),
            _ => false,
        }
    }

    /// Returns true if this is a deadline error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }
}

/// Errors from address-space traversal.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum BrowseError {
    /// No live session
    #[error("not connected")]
    NotConnected,

    /// Browse of a single node failed
    #[error("Browse of {node_id} failed: {reason}")]
    Failed { node_id: String, reason: String },

    /// Tag collection hit its hard deadline; carries what was collected so far
    #[error("export traversal timeout after {timeout_secs}s ({} tags collected)", .partial.len())]
    TraversalTimeout {
        timeout_secs: u64,
        partial: Vec<TagExportRecord>,
    },
}

/// Errors from the typed write pipeline.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum WriteError {
    /// Access level does not include write
    #[error("Node {node_id} is not writable (access level: {access_level})")]
    NotWritable {
        node_id: String,
        access_level: String,
    },

    /// Literal could not be converted to the requested type
    #[error("Cannot convert {literal:?} to {data_type}: {reason}")]
    Conversion {
        data_type: String,
        literal: String,
        reason: String,
    },

    /// Type name the converter does not know
    #[error("unsupported data type: {data_type}")]
    UnsupportedType { data_type: String },

    /// Array element type the converter does not know
    #[error("array write not implemented for data type {data_type}")]
    UnsupportedArrayType { data_type: String },

    /// Server refused the write for a reason other than the value type
    #[error("Write to {node_id} failed: {reason}")]
    Rejected { node_id: String, reason: String },

    /// Every representation on the retry ladder was refused
    #[error("All fallback attempts exhausted for {node_id}: {last_error}")]
    Exhausted { node_id: String, last_error: String },
}

impl WriteError {
    /// Creates a conversion error.
    pub fn conversion(
        data_type: impl Into<String>,
        literal: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Conversion {
            data_type: data_type.into(),
            literal: literal.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors related to certificate material and secure channel options.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum CertificateError {
    /// File is missing or unreadable
    #[error("Failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    /// File could not be written
    #[error("Failed to write {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    /// No usable private key found
    #[error("No usable private key in {path}")]
    NoPrivateKey { path: String },

    /// Key is password protected
    #[error("Encrypted private key in {path} is not supported")]
    EncryptedKey { path: String },

    /// No certificate found
    #[error("No certificate in {path}")]
    NoCertificate { path: String },

    /// Certificate bytes did not parse
    #[error("Invalid certificate: {reason}")]
    InvalidCertificate { reason: String },

    /// Outside the not-before/not-after window
    #[error("Certificate is not valid at this time (valid {not_before} to {not_after})")]
    OutsideValidity { not_before: String, not_after: String },

    /// Public key in the certificate does not belong to the private key
    #[error("Certificate public key does not match private key")]
    KeyMismatch,

    /// Only one of cert/key configured
    #[error("Both certificate and private key must be provided")]
    IncompletePair,

    /// Key generation or signing failed
    #[error("Certificate generation failed: {reason}")]
    GenerationFailed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Failed to load configuration file
    #[error("Failed to load config from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid value for a field
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Unknown security policy name
    #[error("unsupported security policy: {policy}")]
    UnknownSecurityPolicy { policy: String },

    /// Unknown security mode name
    #[error("unsupported security mode: {mode}")]
    UnknownSecurityMode { mode: String },

    /// Policy and mode contradict each other
    #[error("security policy {policy} is incompatible with security mode {mode}")]
    IncompatibleSecurity { policy: String, mode: String },

    /// Identity mode that is not supported
    #[error("unsupported authentication mode: {mode}")]
    UnsupportedAuthMode { mode: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_is_transient() {
        let err = ConnectionError::timeout("opc.tcp://plc:4840", std::time::Duration::from_secs(5));
        assert!(err.is_transient());
        assert!(!ConnectionError::NotConnected.is_transient());
        assert!(err.to_string().contains("5000ms"));
    }

    #[test]
    fn test_type_mismatch_detection() {
        let err = ProtocolError::bad_status("write", "ns=2;s=Tag", StatusCode::BAD_TYPE_MISMATCH);
        assert!(err.is_type_mismatch());

        let err = ProtocolError::bad_status("write", "ns=2;s=Tag", StatusCode::BAD_NOT_WRITABLE);
        assert!(!err.is_type_mismatch());
    }

    #[test]
    fn test_not_connected() {
        let err: UalinkError = ConnectionError::NotConnected.into();
        assert!(err.is_not_connected());
        assert_eq!(err.to_string(), "Connection error: not connected");
    }

    #[test]
    fn test_error_serialization() {
        let err: UalinkError = WriteError::UnsupportedType {
            data_type: "Guid".to_string(),
        }
        .into();
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"Write\""));
        assert!(json.contains("Guid"));
    }

    #[test]
    fn test_traversal_timeout_message() {
        let err = BrowseError::TraversalTimeout {
            timeout_secs: 30,
            partial: vec![TagExportRecord::default()],
        };
        assert!(err.to_string().starts_with("export traversal timeout"));
        assert!(err.to_string().contains("1 tags"));
    }
}
