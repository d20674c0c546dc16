use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Lifecycle state of the session supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No session and no attempt in progress
    #[default]
    Idle,
    /// Attempting to open a session
    Connecting,
    /// Session is live
    Connected,
    /// Tearing the session down
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Counters for one supervisor over its whole lifetime
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// Sessions opened successfully
    sessions_opened: Arc<AtomicU64>,
    /// Failed session-open attempts
    connect_failures: Arc<AtomicU64>,
    /// Notifications received
    data_changes: Arc<AtomicU64>,
    /// Broadcast copies dropped because the hub queue was full
    broadcasts_dropped: Arc<AtomicU64>,
    /// Writes accepted by the server
    writes_succeeded: Arc<AtomicU64>,
    /// Writes that failed after the whole retry ladder
    writes_failed: Arc<AtomicU64>,
    /// When the current session was opened
    connected_at: Arc<parking_lot::RwLock<Option<SystemTime>>>,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            sessions_opened: Arc::new(AtomicU64::new(0)),
            connect_failures: Arc::new(AtomicU64::new(0)),
            data_changes: Arc::new(AtomicU64::new(0)),
            broadcasts_dropped: Arc::new(AtomicU64::new(0)),
            writes_succeeded: Arc::new(AtomicU64::new(0)),
            writes_failed: Arc::new(AtomicU64::new(0)),
            connected_at: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_data_change(&self) {
        self.data_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast_dropped(&self) {
        self.broadcasts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, succeeded: bool) {
        if succeeded {
            self.writes_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.writes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mark a session as established
    pub fn mark_connected(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        *self.connected_at.write() = Some(SystemTime::now());
    }

    /// Mark the session as gone
    pub fn mark_disconnected(&self) {
        *self.connected_at.write() = None;
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    pub fn data_changes(&self) -> u64 {
        self.data_changes.load(Ordering::Relaxed)
    }

    pub fn broadcasts_dropped(&self) -> u64 {
        self.broadcasts_dropped.load(Ordering::Relaxed)
    }

    pub fn connection_duration(&self) -> Option<Duration> {
        self.connected_at.read().and_then(|t| t.elapsed().ok())
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened(),
            connect_failures: self.connect_failures(),
            data_changes: self.data_changes(),
            broadcasts_dropped: self.broadcasts_dropped(),
            writes_succeeded: self.writes_succeeded.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            connected_at: *self.connected_at.read(),
        }
    }
}

/// Snapshot of session metrics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub connect_failures: u64,
    pub data_changes: u64,
    pub broadcasts_dropped: u64,
    pub writes_succeeded: u64,
    pub writes_failed: u64,
    pub connected_at: Option<SystemTime>,
}

/// Combined lifecycle state, last error and metrics
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    state: Arc<parking_lot::RwLock<ConnectionState>>,
    metrics: SessionMetrics,
    error_message: Arc<parking_lot::RwLock<Option<String>>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(parking_lot::RwLock::new(ConnectionState::Idle)),
            metrics: SessionMetrics::new(),
            error_message: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Moves to `next` only when the current state is one of `from`.
    ///
    /// Returns the state that was observed.
    pub fn transition(&self, from: &[ConnectionState], next: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        let mut state = self.state.write();
        let current = *state;
        if from.contains(&current) {
            *state = next;
            Ok(current)
        } else {
            Err(current)
        }
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Record the error of a failed connect and fall back to Idle
    pub fn set_error(&self, error: String) {
        *self.error_message.write() = Some(error);
        self.set_state(ConnectionState::Idle);
    }

    pub fn clear_error(&self) {
        *self.error_message.write() = None;
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(ConnectionState::Idle.to_string(), "Idle");
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = SessionMetrics::new();

        metrics.mark_connected();
        metrics.record_connect_failure();
        metrics.record_data_change();
        metrics.record_data_change();
        metrics.record_broadcast_dropped();
        metrics.record_write(true);
        metrics.record_write(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_opened, 1);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.data_changes, 2);
        assert_eq!(snapshot.broadcasts_dropped, 1);
        assert_eq!(snapshot.writes_succeeded, 1);
        assert_eq!(snapshot.writes_failed, 1);
        assert!(snapshot.connected_at.is_some());

        metrics.mark_disconnected();
        assert!(metrics.connection_duration().is_none());
    }

    #[test]
    fn test_transition_guards() {
        let status = ConnectionStatus::new();

        let idle_only = [ConnectionState::Idle];
        assert_eq!(
            status.transition(&idle_only, ConnectionState::Connecting),
            Ok(ConnectionState::Idle)
        );
        assert_eq!(
            status.transition(&idle_only, ConnectionState::Connecting),
            Err(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_connection_status() {
        let status = ConnectionStatus::new();

        assert_eq!(status.state(), ConnectionState::Idle);
        assert!(!status.is_connected());

        status.set_state(ConnectionState::Connected);
        assert!(status.is_connected());

        status.set_error("Test error".to_string());
        assert_eq!(status.state(), ConnectionState::Idle);
        assert_eq!(status.error_message(), Some("Test error".to_string()));
    }
}
