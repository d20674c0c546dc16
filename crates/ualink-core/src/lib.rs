//! # ualink Core
//!
//! Core types, error handling, and configuration for the ualink protocol client runtime.
//!
//! - **Types**: node classes, access levels, status-code decoding, address-space and
//!   watch records, and the `SessionOptions` handed to the protocol layer.
//! - **Values**: the `Variant` write/read payload.
//! - **Errors**: `thiserror` enums for every failure class, serializable for API responses.
//! - **Configuration**: YAML files with `UALINK__*` environment overrides.
//!
//! ## Example
//!
//! ```
//! use ualink_core::types::{AccessLevel, StatusCode};
//!
//! let info = StatusCode(0x8074_0000).decode();
//! assert_eq!(info.symbolic_name, "BadTypeMismatch");
//! assert_eq!(AccessLevel(0x03).to_string(), "Read, Write");
//! ```

pub mod config;
pub mod error;
pub mod types;
pub mod value;

// Re-export commonly used types for convenience
pub use config::{AppConfig, ClientConfig};
pub use error::{Result, UalinkError};
pub use types::{
    AccessLevel, AddressSpaceNode, AttributeId, BroadcastMessage, NodeAttributes, NodeClass,
    SessionOptions, StatusCode, TagExportRecord, WatchItem, ROOT_FOLDER_ID,
};
pub use value::{ArrayValue, DataValue, LocalizedText, Variant};
