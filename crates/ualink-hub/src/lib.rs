//! # ualink-hub
//!
//! Fan-out of live data changes to many external subscribers.
//!
//! Producers push into a [`BroadcastSource`] without ever blocking. One coordinating
//! task reads it and copies each message to every client whose filter matches,
//! disconnecting clients whose queue is full. Clients adjust their filter with
//! JSON control messages:
//!
//! ```json
//! {"action": "subscribe", "node_ids": ["ns=2;s=Line1.Speed"]}
//! ```
//!
//! When the session generation ends or the source is rebound, every client is
//! closed and the hub keeps running for the next session.

pub mod broadcast;
pub mod hub;
pub mod message;

pub use broadcast::{BroadcastDrop, BroadcastSource, BROADCAST_CAPACITY};
pub use hub::{
    ClientId, ClientSummary, Hub, HubBackend, HubClient, HubConfig, CLIENT_QUEUE_CAPACITY,
};
pub use message::{ClientFilter, ControlMessage, ControlParseError};
