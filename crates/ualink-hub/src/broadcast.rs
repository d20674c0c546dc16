//! The inbound side of the hub.
//!
//! A `BroadcastSource` is a bounded channel behind an `ArcSwap`. Producers always
//! send into whatever channel is current; `rebind` swaps in a fresh channel and drops
//! the old sender, so a hub reading the old channel sees it close and re-reads the
//! source. Nothing ever needs to restart.

use arc_swap::ArcSwap;
use flume::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use ualink_core::types::BroadcastMessage;

/// Capacity of the inbound broadcast channel.
pub const BROADCAST_CAPACITY: usize = 64;

struct Channel {
    tx: Sender<BroadcastMessage>,
    rx: Receiver<BroadcastMessage>,
}

impl Channel {
    fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = flume::bounded(capacity);
        Arc::new(Self { tx, rx })
    }
}

/// Why a broadcast copy was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastDrop {
    Full,
    Closed,
}

/// Atomically swappable broadcast channel.
pub struct BroadcastSource {
    current: ArcSwap<Channel>,
    capacity: usize,
    epoch: AtomicU64,
}

impl std::fmt::Debug for BroadcastSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSource")
            .field("capacity", &self.capacity)
            .field("epoch", &self.epoch())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for BroadcastSource {
    fn default() -> Self {
        Self::new(BROADCAST_CAPACITY)
    }
}

impl BroadcastSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: ArcSwap::new(Channel::new(capacity)),
            capacity,
            epoch: AtomicU64::new(0),
        }
    }

    /// Queue a copy without blocking.
    pub fn try_send(&self, message: BroadcastMessage) -> Result<(), BroadcastDrop> {
        match self.current.load().tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BroadcastDrop::Full),
            Err(TrySendError::Disconnected(_)) => Err(BroadcastDrop::Closed),
        }
    }

    /// Receiver for the current channel. It disconnects once the source is rebound.
    pub fn receiver(&self) -> Receiver<BroadcastMessage> {
        self.current.load().rx.clone()
    }

    /// Replace the channel with a fresh one, closing the old.
    pub fn rebind(&self) {
        self.current.store(Channel::new(self.capacity));
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "Broadcast source rebound");
    }

    /// Number of rebinds so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Messages queued on the current channel.
    pub fn pending(&self) -> usize {
        self.current.load().rx.len()
    }
}
