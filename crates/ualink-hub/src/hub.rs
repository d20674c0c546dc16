//! Live-data fan-out to external subscribers.
//!
//! A single coordinating task owns the client map. Registration, removal,
//! direct snapshot delivery and listing all go through its command channel, so
//! the map is never shared. A client that cannot keep up is disconnected
//! rather than buffered.

use crate::broadcast::BroadcastSource;
use crate::message::{ClientFilter, ControlMessage};
use async_trait::async_trait;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ualink_core::error::UalinkError;
use ualink_core::types::{BroadcastMessage, NodeAttributes, WatchItem};
use uuid::Uuid;

/// Outbound queue depth per client.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

pub type ClientId = Uuid;

/// What the hub needs from the session side.
#[async_trait]
pub trait HubBackend: Send + Sync + 'static {
    /// Make sure a watch exists for the node.
    async fn add_watch(&self, node_id: &str) -> Result<(), UalinkError>;

    /// Read the formatted attributes of a node.
    async fn read_node_attributes(&self, node_id: &str) -> Result<NodeAttributes, UalinkError>;

    /// Token of the current session generation, if a session exists.
    fn generation(&self) -> Option<CancellationToken>;

    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub client_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: CLIENT_QUEUE_CAPACITY,
        }
    }
}

/// Public view of one registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSummary {
    pub id: ClientId,
    pub subscribe_all: bool,
    pub subscriptions: Vec<String>,
}

enum HubCommand {
    Register {
        id: ClientId,
        outbound: Sender<BroadcastMessage>,
        filter: Arc<RwLock<ClientFilter>>,
    },
    Unregister(ClientId),
    /// One-shot delivery to a single client, dropped when its queue is full
    Direct {
        id: ClientId,
        message: BroadcastMessage,
    },
    List(oneshot::Sender<Vec<ClientSummary>>),
}

struct ClientEntry {
    outbound: Sender<BroadcastMessage>,
    filter: Arc<RwLock<ClientFilter>>,
}

struct HubInner {
    commands: Sender<HubCommand>,
    backend: Arc<dyn HubBackend>,
    source: Arc<BroadcastSource>,
    config: HubConfig,
    client_count: Arc<AtomicUsize>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the running hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.client_count())
            .field("source", &self.inner.source)
            .finish()
    }
}

impl Hub {
    /// Start the coordinating task. Must be called from within a Tokio runtime.
    pub fn spawn(
        backend: Arc<dyn HubBackend>,
        source: Arc<BroadcastSource>,
        config: HubConfig,
    ) -> Self {
        let (commands, command_rx) = flume::unbounded();
        let client_count = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();

        let task = tokio::spawn(run_hub(
            command_rx,
            Arc::clone(&backend),
            Arc::clone(&source),
            Arc::clone(&client_count),
            stop.clone(),
        ));

        Self {
            inner: Arc::new(HubInner {
                commands,
                backend,
                source,
                config,
                client_count,
                stop,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Register a new client with an empty filter.
    pub fn register(&self) -> HubClient {
        let id = Uuid::new_v4();
        let (outbound, receiver) = flume::bounded(self.inner.config.client_queue_capacity);
        let filter = Arc::new(RwLock::new(ClientFilter::default()));

        let _ = self.inner.commands.send(HubCommand::Register {
            id,
            outbound,
            filter: Arc::clone(&filter),
        });
        debug!(client = %id, "Hub client registered");

        HubClient {
            id,
            receiver,
            filter,
            hub: self.clone(),
        }
    }

    pub fn unregister(&self, id: ClientId) {
        let _ = self.inner.commands.send(HubCommand::Unregister(id));
    }

    /// Clients currently registered, as seen by the coordinating task.
    pub async fn clients(&self) -> Vec<ClientSummary> {
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(HubCommand::List(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients().await.into_iter().map(|c| c.id).collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.client_count.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> &Arc<BroadcastSource> {
        &self.inner.source
    }

    pub fn is_backend_connected(&self) -> bool {
        self.inner.backend.is_connected()
    }

    /// Apply a control message on behalf of a client.
    ///
    /// `subscribe` also asks the backend for a watch per id and pushes a
    /// one-shot snapshot of each node to this client.
    pub fn handle_control(&self, client: ClientId, filter: &RwLock<ClientFilter>, message: ControlMessage) {
        filter.write().apply(&message);

        let ControlMessage::Subscribe(node_ids) = message else {
            return;
        };

        for node_id in node_ids {
            let backend = Arc::clone(&self.inner.backend);
            let watch_id = node_id.clone();
            tokio::spawn(async move {
                if let Err(e) = backend.add_watch(&watch_id).await {
                    debug!(node_id = %watch_id, error = %e, "Watch for subscriber not created");
                }
            });

            let backend = Arc::clone(&self.inner.backend);
            let commands = self.inner.commands.clone();
            tokio::spawn(async move {
                match backend.read_node_attributes(&node_id).await {
                    Ok(attributes) => {
                        let _ = commands.send(HubCommand::Direct {
                            id: client,
                            message: WatchItem::from_attributes(&attributes),
                        });
                    }
                    Err(e) => debug!(node_id = %node_id, error = %e, "Snapshot for subscriber not available"),
                }
            });
        }
    }

    /// Stop the coordinating task, closing every client.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// One registered subscriber. Dropping it unregisters the client.
pub struct HubClient {
    id: ClientId,
    receiver: Receiver<BroadcastMessage>,
    filter: Arc<RwLock<ClientFilter>>,
    hub: Hub,
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("id", &self.id)
            .field("filter", &*self.filter.read())
            .finish()
    }
}

impl HubClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Next outbound message; `None` once the hub has closed this client.
    pub async fn recv(&self) -> Option<BroadcastMessage> {
        self.receiver.recv_async().await.ok()
    }

    pub fn receiver(&self) -> Receiver<BroadcastMessage> {
        self.receiver.clone()
    }

    pub fn filter(&self) -> ClientFilter {
        self.filter.read().clone()
    }

    pub fn apply(&self, message: ControlMessage) {
        self.hub.handle_control(self.id, &self.filter, message);
    }

    /// Parse and apply a text control message. Malformed input is logged and ignored.
    pub fn handle_text(&self, text: &str) {
        match ControlMessage::parse(text) {
            Ok(message) => self.apply(message),
            Err(e) => warn!(client = %self.id, error = %e, "Ignoring control message"),
        }
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

async fn generation_ended(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn close_all(clients: &mut HashMap<ClientId, ClientEntry>, reason: &str) {
    if !clients.is_empty() {
        info!(count = clients.len(), reason, "Closing hub clients");
    }
    clients.clear();
}

fn forward(clients: &mut HashMap<ClientId, ClientEntry>, message: BroadcastMessage) {
    let mut dead = Vec::new();
    for (id, client) in clients.iter() {
        if !client.filter.read().matches(&message.node_id) {
            continue;
        }
        match client.outbound.try_send(message.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(client = %id, "Client queue full, disconnecting");
                dead.push(*id);
            }
            Err(TrySendError::Disconnected(_)) => dead.push(*id),
        }
    }
    for id in dead {
        clients.remove(&id);
    }
}

fn handle_command(clients: &mut HashMap<ClientId, ClientEntry>, command: HubCommand) {
    match command {
        HubCommand::Register { id, outbound, filter } => {
            clients.insert(id, ClientEntry { outbound, filter });
        }
        HubCommand::Unregister(id) => {
            if clients.remove(&id).is_some() {
                debug!(client = %id, "Hub client unregistered");
            }
        }
        HubCommand::Direct { id, message } => {
            if let Some(client) = clients.get(&id) {
                let _ = client.outbound.try_send(message);
            }
        }
        HubCommand::List(reply) => {
            let mut summaries: Vec<ClientSummary> = clients
                .iter()
                .map(|(id, client)| {
                    let filter = client.filter.read();
                    let mut subscriptions: Vec<String> = filter.nodes.iter().cloned().collect();
                    subscriptions.sort();
                    ClientSummary {
                        id: *id,
                        subscribe_all: filter.all,
                        subscriptions,
                    }
                })
                .collect();
            summaries.sort_by_key(|s| s.id);
            let _ = reply.send(summaries);
        }
    }
}

async fn run_hub(
    commands: Receiver<HubCommand>,
    backend: Arc<dyn HubBackend>,
    source: Arc<BroadcastSource>,
    client_count: Arc<AtomicUsize>,
    stop: CancellationToken,
) {
    info!("Broadcast hub started");
    let mut clients: HashMap<ClientId, ClientEntry> = HashMap::new();
    let mut watched: Option<CancellationToken> = None;

    loop {
        if watched.as_ref().is_some_and(|t| t.is_cancelled()) {
            close_all(&mut clients, "session generation ended");
            client_count.store(0, Ordering::SeqCst);
            watched = None;
        }
        if watched.is_none() {
            watched = backend.generation().filter(|t| !t.is_cancelled());
        }
        let inbound = source.receiver();

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                close_all(&mut clients, "hub stopped");
                client_count.store(0, Ordering::SeqCst);
                break;
            }
            command = commands.recv_async() => match command {
                Ok(command) => handle_command(&mut clients, command),
                Err(_) => break,
            },
            _ = generation_ended(watched.as_ref()) => {
                close_all(&mut clients, "session generation ended");
            }
            message = inbound.recv_async() => match message {
                Ok(message) => forward(&mut clients, message),
                Err(_) => close_all(&mut clients, "broadcast source closed"),
            },
        }

        client_count.store(clients.len(), Ordering::SeqCst);
    }

    info!("Broadcast hub stopped");
}
