//! # ualink-client
//!
//! The protocol seam of the ualink runtime.
//!
//! The runtime never talks to the wire directly. It opens sessions through a
//! [`SessionOpener`] and drives them through [`ProtocolSession`], so any stack that
//! can browse, read, write and monitor can be plugged in:
//!
//! - **Session traits**: `SessionOpener`, `ProtocolSession`, `MonitorHandle`
//! - **Lifecycle state**: connection state machine and per-supervisor metrics
//! - **Retry**: bounded open attempts with per-attempt deadlines and cancellation
//! - **Memory server**: an in-process address space for simulation and tests
//!
//! ## Example
//!
//! ```rust
//! use ualink_client::{MemoryServer, SessionOpener};
//! use ualink_core::types::{SessionOptions, ROOT_FOLDER_ID};
//!
//! # tokio_test::block_on(async {
//! let server = MemoryServer::demo_plant();
//! let session = server
//!     .open("opc.tcp://localhost:4840", &SessionOptions::default())
//!     .await
//!     .unwrap();
//! let refs = session.browse(ROOT_FOLDER_ID).await.unwrap();
//! assert!(!refs.is_empty());
//! # });
//! ```

pub mod memory;
pub mod retry;
pub mod session;
pub mod state;

pub use memory::{MemoryServer, OBJECTS_FOLDER_ID};
pub use retry::{open_with_retry, RetryPolicy};
pub use session::{
    DataChange, MonitorHandle, ProtocolResult, ProtocolSession, ReferenceDescription,
    SessionOpener,
};
pub use state::{ConnectionState, ConnectionStatus, MetricsSnapshot, SessionMetrics};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _policy = RetryPolicy::default();
        let status = ConnectionStatus::new();
        assert_eq!(status.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_open_on_blocking_runtime() {
        let server = MemoryServer::new();
        let opened = tokio_test::block_on(
            server.open("opc.tcp://localhost:4840", &ualink_core::SessionOptions::default()),
        );
        assert!(opened.is_ok());
    }
}
