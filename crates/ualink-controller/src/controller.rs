//! Session supervision.
//!
//! The controller owns at most one live session. Every connect cycle gets a
//! fresh generation token; all tasks spawned for that session select on it and
//! end when it is cancelled.

use crate::address_space::{AddressSpace, BROWSE_TIMEOUT, COLLECT_TIMEOUT};
use crate::attributes;
use crate::observer::{ControllerObserver, ObserverId, ObserverRegistry};
use crate::watch::WatchManager;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ualink_cert::Provisioner;
use ualink_client::{
    open_with_retry, ConnectionState, ConnectionStatus, ProtocolSession, RetryPolicy,
    SessionOpener,
};
use ualink_core::config::ClientConfig;
use ualink_core::error::{BrowseError, ConnectionError, UalinkError};
use ualink_core::types::{
    AddressSpaceNode, BroadcastMessage, NodeAttributes, TagExportRecord, ROOT_FOLDER_ID,
};
use ualink_hub::{BroadcastSource, Hub, HubBackend, HubConfig};

/// Period of the watch-list re-emit (about 30 per second).
pub const WATCH_PUMP_INTERVAL: Duration = Duration::from_millis(33);

/// Deadline for a best-effort session close.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Generation {
    id: u64,
    token: CancellationToken,
}

/// Counts a spawned task until it ends.
struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connection lifecycle controller.
pub struct Controller {
    config: RwLock<ClientConfig>,
    opener: Arc<dyn SessionOpener>,
    provisioner: Provisioner,
    status: ConnectionStatus,
    session: RwLock<Option<Arc<dyn ProtocolSession>>>,
    generation: RwLock<Option<Generation>>,
    next_generation: AtomicU64,
    pub(crate) address_space: AddressSpace,
    pub(crate) watches: WatchManager,
    pub(crate) observers: ObserverRegistry,
    broadcast: Arc<BroadcastSource>,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
    live_tasks: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .field("watches", &self.watches.len())
            .field("address_space", &self.address_space)
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

async fn close_session(session: Arc<dyn ProtocolSession>) {
    match tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await {
        Ok(Ok(())) => debug!("Session closed"),
        Ok(Err(e)) => warn!(error = %e, "Session close failed"),
        Err(_) => warn!(timeout_secs = CLOSE_TIMEOUT.as_secs(), "Session close timed out"),
    }
}

impl Controller {
    pub fn new(
        config: ClientConfig,
        opener: Arc<dyn SessionOpener>,
        provisioner: Provisioner,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            opener,
            provisioner,
            status: ConnectionStatus::new(),
            session: RwLock::new(None),
            generation: RwLock::new(None),
            next_generation: AtomicU64::new(0),
            address_space: AddressSpace::new(),
            watches: WatchManager::default(),
            observers: ObserverRegistry::default(),
            broadcast: Arc::new(BroadcastSource::default()),
            shutdown_hook: Mutex::new(None),
            live_tasks: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn ControllerObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Registers the async stop function run first by [`Controller::shutdown`].
    pub fn set_shutdown_hook<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.shutdown_hook.lock() = Some(Box::new(move || Box::pin(hook())));
    }

    pub fn config(&self) -> ClientConfig {
        self.config.read().clone()
    }

    /// Replaces the client configuration. Takes effect on the next connect.
    pub fn set_config(&self, config: ClientConfig) {
        *self.config.write() = config;
    }

    pub fn endpoint(&self) -> String {
        self.config.read().endpoint_url.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected() && self.session.read().is_some()
    }

    /// Token of the current generation, if one exists.
    pub fn generation(&self) -> Option<CancellationToken> {
        self.generation.read().as_ref().map(|g| g.token.clone())
    }

    pub fn broadcast_source(&self) -> &Arc<BroadcastSource> {
        &self.broadcast
    }

    /// Tasks spawned for sessions that have not finished yet.
    pub fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::SeqCst)
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    /// Starts a hub fed by this controller's broadcast source.
    pub fn spawn_hub(self: &Arc<Self>, config: HubConfig) -> Hub {
        Hub::spawn(self.clone(), Arc::clone(&self.broadcast), config)
    }

    pub(crate) fn session(&self) -> Result<Arc<dyn ProtocolSession>, ConnectionError> {
        self.session
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(ConnectionError::NotConnected)
    }

    pub(crate) fn broadcast_item(&self, item: BroadcastMessage) {
        if let Err(reason) = self.broadcast.try_send(item) {
            self.status.metrics().record_broadcast_dropped();
            debug!(?reason, "Broadcast copy dropped");
        }
    }

    /// Spawns `future` under `token`; it is dropped as soon as the token is cancelled.
    pub(crate) fn spawn_tracked<F>(&self, token: &CancellationToken, task: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = TaskGuard::new(Arc::clone(&self.live_tasks));
        let token = token.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!(task, "Task cancelled"),
                _ = future => debug!(task, "Task finished"),
            }
        });
    }

    /// Opens a session, retrying within the configured budget.
    ///
    /// Does nothing while a connect is in progress or a session is live.
    #[instrument(skip(self))]
    pub async fn connect(self: &Arc<Self>) -> Result<(), UalinkError> {
        if let Err(current) = self
            .status
            .transition(&[ConnectionState::Idle], ConnectionState::Connecting)
        {
            debug!(state = %current, "Connect ignored");
            return Ok(());
        }
        self.status.clear_error();

        let id = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let stale = self.generation.write().replace(Generation {
            id,
            token: token.clone(),
        });
        if let Some(stale) = stale {
            stale.token.cancel();
        }

        let config = self.config();
        info!(endpoint = %config.endpoint_url, generation = id, "Connecting");

        let options = match self.provisioner.provision(&config) {
            Ok(options) => options,
            Err(e) => {
                self.fail_connect(id, &e.to_string());
                return Err(e);
            }
        };

        let policy = RetryPolicy::from_config(&config);
        let endpoint = config.endpoint_url.clone();
        let opener = Arc::clone(&self.opener);
        let opened = open_with_retry(&endpoint, &policy, &token, |attempt| {
            let opener = Arc::clone(&opener);
            let endpoint = endpoint.clone();
            let options = options.clone();
            async move {
                debug!(attempt, "Opening session");
                opener.open(&endpoint, &options).await
            }
        })
        .await;

        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                self.status.metrics().record_connect_failure();
                self.fail_connect(id, &e.to_string());
                return Err(e.into());
            }
        };

        *self.session.write() = Some(Arc::clone(&session));
        let promoted = !token.is_cancelled()
            && self
                .status
                .transition(&[ConnectionState::Connecting], ConnectionState::Connected)
                .is_ok();
        if !promoted {
            warn!(generation = id, "Connect superseded, closing new session");
            {
                let mut current = self.session.write();
                if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session)) {
                    *current = None;
                }
            }
            close_session(session).await;
            return Err(ConnectionError::Closed {
                reason: "connect cancelled".to_string(),
            }
            .into());
        }

        self.status.metrics().mark_connected();
        info!(endpoint = %endpoint, generation = id, "Connected");
        self.observers
            .notify(|o| o.on_connection_state_change(true, None));
        self.start_session_tasks(&session, &token);
        Ok(())
    }

    fn fail_connect(&self, id: u64, error: &str) {
        let ours = {
            let mut generation = self.generation.write();
            if generation.as_ref().is_some_and(|g| g.id == id) {
                generation.take()
            } else {
                None
            }
        };
        let Some(generation) = ours else {
            // A disconnect or a newer connect owns the state now.
            debug!(generation = id, error, "Superseded connect failed");
            return;
        };
        generation.token.cancel();
        warn!(generation = id, error, "Connect failed");
        self.status.set_error(error.to_string());
        self.observers
            .notify(|o| o.on_connection_state_change(false, Some(error)));
    }

    fn start_session_tasks(self: &Arc<Self>, session: &Arc<dyn ProtocolSession>, token: &CancellationToken) {
        let controller = Arc::clone(self);
        self.spawn_tracked(token, "watch-pump", async move {
            let mut ticker = tokio::time::interval(WATCH_PUMP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                controller.publish_watch_list();
            }
        });

        let notifications = session.notifications();
        let controller = Arc::clone(self);
        self.spawn_tracked(token, "data-change-dispatcher", async move {
            while let Ok(change) = notifications.recv_async().await {
                controller.handle_data_change(&change.node_id, &change.value, change.status);
            }
            debug!("Notification stream closed");
        });

        let controller = Arc::clone(self);
        self.spawn_tracked(token, "root-browse", async move {
            let _ = controller.browse(ROOT_FOLDER_ID).await;
        });
    }

    /// Tears the session down. Safe to call in any state, any number of times.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let generation = self.generation.write().take();
        let session = self.session.write().take();
        if generation.is_none() && session.is_none() {
            debug!("Already disconnected");
            return;
        }

        self.status.set_state(ConnectionState::Disconnecting);
        info!(endpoint = %self.endpoint(), "Disconnecting");

        if let Some(generation) = generation {
            generation.token.cancel();
        }
        if let Some(session) = session {
            close_session(session).await;
        }

        self.broadcast.rebind();
        self.remove_all_watches().await;
        self.address_space.reset();

        self.status.set_state(ConnectionState::Idle);
        self.status.metrics().mark_disconnected();
        self.observers.notify(|o| {
            o.on_connection_state_change(false, None);
            o.on_address_space_reset();
        });
        info!("Disconnected");
    }

    /// Runs the shutdown hook, if any, then disconnects.
    pub async fn shutdown(&self) {
        let hook = self.shutdown_hook.lock().take();
        if let Some(hook) = hook {
            info!("Stopping API listener");
            hook().await;
        }
        self.disconnect().await;
    }

    pub async fn read_node_attributes(&self, node_id: &str) -> Result<NodeAttributes, UalinkError> {
        let session = self.session()?;
        let attributes = attributes::read_node_attributes(session.as_ref(), node_id).await?;
        self.observers.notify(|o| o.on_node_attributes(&attributes));
        Ok(attributes)
    }

    /// Browses one parent and publishes its children.
    pub async fn browse(&self, parent_id: &str) -> Result<Vec<AddressSpaceNode>, UalinkError> {
        let session = self.session().map_err(|_| BrowseError::NotConnected)?;
        let outcome = self
            .address_space
            .browse(session.as_ref(), parent_id, BROWSE_TIMEOUT)
            .await?;
        if outcome.is_published() {
            self.observers
                .notify(|o| o.on_address_space_update(parent_id));
        }
        Ok(outcome.into_children())
    }

    /// Fire-and-forget browse tied to the current generation.
    pub fn spawn_browse(self: &Arc<Self>, parent_id: &str) {
        let Some(token) = self.generation() else {
            debug!(parent_id, "Browse skipped, not connected");
            return;
        };
        let controller = Arc::clone(self);
        let parent_id = parent_id.to_string();
        self.spawn_tracked(&token, "browse", async move {
            let _ = controller.browse(&parent_id).await;
        });
    }

    pub fn children(&self, parent_id: &str) -> Option<Vec<AddressSpaceNode>> {
        self.address_space.children(parent_id)
    }

    pub fn node(&self, node_id: &str) -> Option<AddressSpaceNode> {
        self.address_space.node(node_id)
    }

    pub fn has_been_browsed(&self, node_id: &str) -> bool {
        self.address_space.has_been_browsed(node_id)
    }

    pub fn is_browsing(&self, node_id: &str) -> bool {
        self.address_space.is_browsing(node_id)
    }

    /// Variable nodes under `parent_id` (root when empty) for tag export.
    pub async fn collect_variable_nodes(
        &self,
        parent_id: &str,
        recursive: bool,
    ) -> Result<Vec<TagExportRecord>, BrowseError> {
        let session = self.session().map_err(|_| BrowseError::NotConnected)?;
        self.address_space
            .collect_variable_nodes(session.as_ref(), parent_id, recursive, COLLECT_TIMEOUT)
            .await
    }
}

#[async_trait]
impl HubBackend for Controller {
    async fn add_watch(&self, node_id: &str) -> Result<(), UalinkError> {
        Controller::add_watch(self, node_id).await
    }

    async fn read_node_attributes(&self, node_id: &str) -> Result<NodeAttributes, UalinkError> {
        Controller::read_node_attributes(self, node_id).await
    }

    fn generation(&self) -> Option<CancellationToken> {
        Controller::generation(self)
    }

    fn is_connected(&self) -> bool {
        Controller::is_connected(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{controller, test_config, wait_until, RecordingObserver};
    use ualink_client::{MemoryServer, OBJECTS_FOLDER_ID};

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let server = MemoryServer::demo_plant();
        let controller = controller(&server);
        let observer = Arc::new(RecordingObserver::default());
        controller.add_observer(observer.clone());

        controller.connect().await.unwrap();
        assert!(controller.is_connected());
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(controller.generation().is_some());
        assert_eq!(observer.states(), vec![(true, None)]);

        // The root folder is browsed as soon as the session is up
        wait_until(|| controller.has_been_browsed(ROOT_FOLDER_ID)).await;
        assert_eq!(controller.children(ROOT_FOLDER_ID).unwrap()[0].node_id, OBJECTS_FOLDER_ID);
        assert!(observer.updates().contains(&ROOT_FOLDER_ID.to_string()));

        let token = controller.generation().unwrap();
        controller.disconnect().await;
        assert!(token.is_cancelled());
        assert!(!controller.is_connected());
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert!(!controller.has_been_browsed(ROOT_FOLDER_ID));
        assert_eq!(server.open_sessions(), 0);
        assert_eq!(observer.resets(), 1);
        assert_eq!(observer.states().last(), Some(&(false, None)));
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_connected() {
        let server = MemoryServer::demo_plant();
        let controller = controller(&server);
        controller.connect().await.unwrap();
        controller.connect().await.unwrap();
        assert_eq!(server.open_calls(), 1);
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let server = MemoryServer::demo_plant();
        server.fail_next_opens(2);
        let controller = controller(&server);

        controller.connect().await.unwrap();
        assert_eq!(server.open_calls(), 3);
        assert!(controller.is_connected());
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_exhaustion_reports_error() {
        let server = MemoryServer::demo_plant();
        server.fail_next_opens(10);
        let controller = controller(&server);
        let observer = Arc::new(RecordingObserver::default());
        controller.add_observer(observer.clone());

        let err = controller.connect().await.unwrap_err();
        assert!(matches!(
            err,
            UalinkError::Connection(ConnectionError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert!(controller.generation().is_none());
        assert_eq!(controller.status().metrics().connect_failures(), 1);

        let states = observer.states();
        assert_eq!(states.len(), 1);
        assert!(!states[0].0);
        assert!(states[0].1.as_deref().unwrap_or_default().contains("BadServerNotConnected"));

        // Disconnecting after a failed connect is a no-op
        controller.disconnect().await;
        assert_eq!(observer.resets(), 0);
    }

    #[tokio::test]
    async fn test_connect_timeout_per_attempt() {
        let server = MemoryServer::demo_plant();
        server.set_open_delay(Duration::from_secs(5));
        let config = test_config()
            .with_retry(2, Duration::from_millis(10))
            .with_connect_timeout(Duration::from_millis(50));
        let controller = Controller::new(
            config,
            Arc::new(server.clone()),
            Provisioner::new(Default::default()),
        );

        let err = controller.connect().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(server.open_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_security_fails_before_open() {
        let server = MemoryServer::demo_plant();
        let controller = Controller::new(
            test_config().with_security("None", "SignAndEncrypt"),
            Arc::new(server.clone()),
            Provisioner::new(Default::default()),
        );

        let err = controller.connect().await.unwrap_err();
        assert!(matches!(err, UalinkError::Config(_)));
        assert_eq!(server.open_calls(), 0);
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_connecting() {
        let server = MemoryServer::demo_plant();
        server.set_open_delay(Duration::from_millis(300));
        let controller = controller(&server);

        let connecting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.connect().await })
        };
        wait_until(|| controller.state() == ConnectionState::Connecting).await;
        controller.disconnect().await;

        assert!(connecting.await.unwrap().is_err());
        assert!(!controller.is_connected());
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = MemoryServer::demo_plant();
        let controller = controller(&server);
        controller.disconnect().await;

        controller.connect().await.unwrap();
        controller.disconnect().await;
        controller.disconnect().await;
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_no_task_leaks_over_cycles() {
        let server = MemoryServer::demo_plant();
        let controller = controller(&server);

        for _ in 0..5 {
            controller.connect().await.unwrap();
            controller.add_watch("ns=2;s=Line1.Speed").await.unwrap();
            controller.spawn_browse(OBJECTS_FOLDER_ID);
            assert!(controller.live_tasks() >= 2);
            controller.disconnect().await;
            wait_until(|| controller.live_tasks() == 0).await;
        }

        assert_eq!(server.open_sessions(), 0);
        assert_eq!(server.monitors_active(), 0);
        assert_eq!(server.monitors_released(), 5);
    }

    #[tokio::test]
    async fn test_disconnect_closes_broadcast_source() {
        let server = MemoryServer::demo_plant();
        let controller = controller(&server);
        controller.connect().await.unwrap();

        let inbound = controller.broadcast_source().receiver();
        controller.disconnect().await;
        assert!(inbound.recv_async().await.is_err());
        assert_eq!(controller.broadcast_source().epoch(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_runs_hook_first() {
        let server = MemoryServer::demo_plant();
        let controller = controller(&server);
        controller.connect().await.unwrap();

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let watched = controller.clone();
        controller.set_shutdown_hook(move || async move {
            // Still connected while the listener stops
            assert!(watched.is_connected());
            flag.store(true, Ordering::SeqCst);
        });

        controller.shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_collect_requires_session() {
        let server = MemoryServer::demo_plant();
        let controller = controller(&server);
        assert!(matches!(
            controller.collect_variable_nodes("", true).await,
            Err(BrowseError::NotConnected)
        ));
        assert!(controller.browse(ROOT_FOLDER_ID).await.unwrap_err().is_not_connected());
    }
}
