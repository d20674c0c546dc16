//! Request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use ualink_hub::ClientId;

// ============================================================================
// Read / Write
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub node_id: String,

    /// Type hint; the server's declared type wins when it has one
    pub data_type: String,

    /// Literal to convert, e.g. `42`, `[1, 2]`, `en|Hello`, `0xCAFE`
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteAccepted {
    pub status: String,
}

impl WriteAccepted {
    pub fn sent() -> Self {
        Self {
            status: "write request sent".to_string(),
        }
    }
}

// ============================================================================
// Export
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    /// Anything other than `csv` means JSON.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "csv" => ExportFormat::Csv,
            _ => ExportFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FolderExportQuery {
    pub node_id: Option<String>,
    pub recursive: Option<String>,
    pub format: Option<String>,
}

impl FolderExportQuery {
    /// Recursive unless given as `false` or `0`.
    pub fn is_recursive(&self) -> bool {
        match self.recursive.as_deref() {
            None | Some("") => true,
            Some(value) => value != "false" && value != "0",
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connected: bool,
    pub state: String,
    pub endpoint: String,
    pub ws_clients: usize,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsClientInfo {
    pub id: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<SocketAddr>,
    pub subscribe_all: bool,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}
