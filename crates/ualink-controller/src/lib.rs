//! # ualink-controller
//!
//! Supervises one protocol session and everything that hangs off it.
//!
//! - **Lifecycle**: connect with retry, idempotent disconnect, generation tokens
//!   that end every session task together
//! - **Address space**: lazy per-parent browse cache with in-flight dedupe, and
//!   bounded collection of variable nodes for tag export
//! - **Watches**: monitored items, status decoding and the watch-list pump
//! - **Writes**: literal conversion and the type-mismatch retry ladder
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ualink_cert::Provisioner;
//! use ualink_client::MemoryServer;
//! use ualink_controller::Controller;
//! use ualink_core::config::ClientConfig;
//!
//! # tokio_test::block_on(async {
//! let server = MemoryServer::demo_plant();
//! let controller = Controller::new(
//!     ClientConfig::default(),
//!     Arc::new(server),
//!     Provisioner::default(),
//! );
//! controller.connect().await.unwrap();
//! controller.add_watch("ns=2;s=Line1.Speed").await.unwrap();
//! assert_eq!(controller.watch_list()[0].value, "12.5");
//! controller.disconnect().await;
//! # });
//! ```

pub mod address_space;
pub mod attributes;
pub mod controller;
pub mod convert;
pub mod observer;
pub mod watch;
pub mod write;

#[cfg(test)]
mod testing;

pub use address_space::{AddressSpace, BrowseOutcome};
pub use attributes::read_node_attributes;
pub use controller::{Controller, CLOSE_TIMEOUT, WATCH_PUMP_INTERVAL};
pub use convert::{format_value, parse_array, parse_bytestring, parse_literal};
pub use observer::{ControllerObserver, ObserverId, ObserverRegistry};
pub use write::{WriteEngine, FALLBACK_TYPES};
