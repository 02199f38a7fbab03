//! Connection registry: maps a username to its single live WebSocket connection.
//!
//! Last-connect-wins: registering a username that already has a connection
//! replaces the mapping and hands the displaced entry back to the caller, who
//! decides what to do with the orphaned socket. A later `unregister` from the
//! displaced connection is a no-op so a stale disconnect can never clear a
//! newer registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

/// Outbound queue depth per connection. Events past this are dropped
/// (best-effort push), never buffered elsewhere.
const OUTBOUND_BUFFER: usize = 64;

/// Per-connection state: sender feeding the socket's send pump, close signal,
/// last ping time for the idle timeout.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub conn_id: u64,
    pub username: String,
    pub tx: mpsc::Sender<String>,
    /// Signalled when the registry supersedes this connection or the service
    /// shuts down; the socket task breaks its loop on it.
    pub close: Notify,
    /// Unix timestamp (seconds) when we last received a ping from the client.
    pub last_ping_at: AtomicU64,
    pub connected_at: DateTime<Utc>,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of live connections, one per username. All operations take the
/// same lock, so a snapshot can never observe a torn register/unregister.
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<String, Arc<ConnectionEntry>>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a connection for `username`, replacing any prior mapping.
    /// Returns the new entry, the receiver for the socket's send pump, and
    /// the displaced prior entry if this register superseded one.
    pub fn register(
        &self,
        username: &str,
    ) -> (
        Arc<ConnectionEntry>,
        mpsc::Receiver<String>,
        Option<Arc<ConnectionEntry>>,
    ) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let entry = Arc::new(ConnectionEntry {
            conn_id,
            username: username.to_string(),
            tx,
            close: Notify::new(),
            last_ping_at: AtomicU64::new(now_secs()),
            connected_at: Utc::now(),
        });
        let displaced = self
            .inner
            .lock()
            .insert(username.to_string(), entry.clone());
        (entry, rx, displaced)
    }

    /// Remove the mapping for `username` if `conn_id` is still its current
    /// connection. Returns whether the removal was effective; a stale
    /// disconnect from a superseded connection returns false and leaves the
    /// newer registration intact.
    pub fn unregister(&self, username: &str, conn_id: u64) -> bool {
        let mut map = self.inner.lock();
        match map.get(username) {
            Some(entry) if entry.conn_id == conn_id => {
                map.remove(username);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, username: &str) -> Option<Arc<ConnectionEntry>> {
        self.inner.lock().get(username).cloned()
    }

    /// Point-in-time username -> conn_id view, atomic with respect to
    /// concurrent register/unregister calls.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.inner
            .lock()
            .iter()
            .map(|(u, e)| (u.clone(), e.conn_id))
            .collect()
    }

    /// All live entries, for fan-out. Cloned out so the lock is not held
    /// while events are queued.
    pub fn entries(&self) -> Vec<Arc<ConnectionEntry>> {
        self.inner.lock().values().cloned().collect()
    }

    /// Clear the registry and return every entry that was live, for shutdown
    /// draining.
    pub fn drain(&self) -> Vec<Arc<ConnectionEntry>> {
        self.inner.lock().drain().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
