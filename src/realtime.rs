//! Realtime coordinator: owns the connection registry, fans presence
//! transitions out to live connections, relays typing and message events,
//! and keeps the durable online/last-seen flags in sync.
//!
//! Constructed once at process start and injected through `AppState`.
//! Broadcasts always happen before the corresponding store write; the store
//! write is fire-and-forget and a failure leaves the durable flag
//! transiently stale, never blocks or cancels the fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::events::{EventBus, PublishedEvent, Scope, ServerEvent};
use crate::registry::{ConnectionEntry, ConnectionRegistry};
use crate::store::{ChatStore, MessageRecord};

pub struct RealtimeService {
    registry: ConnectionRegistry,
    bus: EventBus,
    store: Arc<dyn ChatStore>,
    accepting: AtomicBool,
}

impl RealtimeService {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            bus: EventBus::new(),
            store,
            accepting: AtomicBool::new(true),
        }
    }

    /// Observe the outbound event stream without affecting delivery.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PublishedEvent> {
        self.bus.subscribe()
    }

    /// Register a connection for `username`. Returns None when the service
    /// is draining. On supersession the displaced connection is told to
    /// close and no duplicate online broadcast is sent; the online
    /// transition only fires when the username was previously absent.
    pub fn connect(
        &self,
        username: &str,
    ) -> Option<(Arc<ConnectionEntry>, mpsc::Receiver<String>)> {
        if !self.accepting.load(Ordering::Acquire) {
            tracing::debug!(username, "connect rejected, service draining");
            return None;
        }
        let (entry, rx, displaced) = self.registry.register(username);
        match displaced {
            Some(old) => {
                tracing::debug!(
                    username,
                    old_conn = old.conn_id,
                    new_conn = entry.conn_id,
                    "connection superseded, closing prior socket"
                );
                old.close.notify_one();
            }
            None => {
                tracing::info!(username, conn_id = entry.conn_id, "user connected");
                self.broadcast(
                    ServerEvent::PresenceOnline {
                        username: username.to_string(),
                        conn_id: entry.conn_id,
                    },
                    Some(username),
                );
                self.persist_online(username.to_string(), entry.conn_id);
            }
        }
        Some((entry, rx))
    }

    /// Handle a socket closing. A stale disconnect from a superseded
    /// connection is a no-op; an effective one broadcasts offline to
    /// everyone and stamps last-seen in the store.
    pub fn disconnect(&self, username: &str, conn_id: u64) {
        if !self.registry.unregister(username, conn_id) {
            tracing::debug!(username, conn_id, "stale disconnect ignored");
            return;
        }
        tracing::info!(username, conn_id, "user disconnected");
        self.broadcast(
            ServerEvent::PresenceOffline {
                username: username.to_string(),
            },
            None,
        );
        let store = Arc::clone(&self.store);
        let username = username.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.set_user_offline(&username, Utc::now()).await {
                tracing::warn!(%username, error = %e, "failed to persist offline presence");
            }
        });
    }

    /// Forward a typing start/stop to the recipient, or silently drop it
    /// when they are not connected. Never persisted, never queued.
    pub fn relay_typing(&self, from: &str, to: &str, started: bool) {
        let event = if started {
            ServerEvent::TypingStarted { from: from.to_string() }
        } else {
            ServerEvent::TypingStopped { from: from.to_string() }
        };
        self.send_to(to, event);
    }

    /// Push a persisted message to its receiver if connected. The sender
    /// never gets a push for its own message; it already has it from the
    /// submit response.
    pub fn push_message(&self, message: &MessageRecord) {
        self.send_to(&message.receiver, ServerEvent::MessageNew(message.clone()));
    }

    /// Tell `partner` that `viewer` has seen their messages, if online.
    pub fn push_seen(&self, viewer: &str, partner: &str) {
        self.send_to(
            partner,
            ServerEvent::MessagesSeen {
                from: viewer.to_string(),
                by: viewer.to_string(),
            },
        );
    }

    /// Tell every connection the user list changed.
    pub fn broadcast_users_changed(&self) {
        self.broadcast(ServerEvent::UsersChanged, None);
    }

    /// Live presence view, atomic with respect to concurrent connects and
    /// disconnects.
    pub fn online_snapshot(&self) -> std::collections::HashMap<String, u64> {
        self.registry.snapshot()
    }

    /// Stop accepting registrations and drain every live connection.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let drained = self.registry.drain();
        tracing::info!(connections = drained.len(), "realtime service draining");
        for entry in drained {
            entry.close.notify_one();
        }
    }

    fn persist_online(&self, username: String, conn_id: u64) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.set_user_online(&username, conn_id as i64).await {
                tracing::warn!(%username, error = %e, "failed to persist online presence");
            }
        });
    }

    /// Queue a frame on every live connection, optionally skipping one
    /// username. Full or closed queues are logged and skipped; delivery is
    /// best-effort.
    fn broadcast(&self, event: ServerEvent, skip: Option<&str>) {
        let frame = match serde_json::to_string(&event) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("serialize event: {e}");
                return;
            }
        };
        for entry in self.registry.entries() {
            if skip == Some(entry.username.as_str()) {
                continue;
            }
            if entry.tx.try_send(frame.clone()).is_err() {
                tracing::debug!(
                    username = entry.username.as_str(),
                    conn_id = entry.conn_id,
                    "broadcast try_send failed"
                );
            }
        }
        let scope = match skip {
            Some(u) => Scope::AllExcept(u.to_string()),
            None => Scope::All,
        };
        self.bus.publish(scope, event);
    }

    /// Queue a frame for a single username. Returns whether it was queued;
    /// an absent or unreachable recipient is a drop, not an error.
    fn send_to(&self, target: &str, event: ServerEvent) -> bool {
        let Some(entry) = self.registry.lookup(target) else {
            tracing::debug!(target, "push dropped, recipient not connected");
            return false;
        };
        let frame = match serde_json::to_string(&event) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("serialize event: {e}");
                return false;
            }
        };
        if entry.tx.try_send(frame).is_err() {
            tracing::debug!(target, conn_id = entry.conn_id, "push try_send failed");
            return false;
        }
        self.bus.publish(Scope::User(target.to_string()), event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;

    async fn service_with_users(users: &[&str]) -> (Arc<RealtimeService>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for u in users {
            store.seed_user(u).await;
        }
        let svc = Arc::new(RealtimeService::new(
            Arc::clone(&store) as Arc<dyn ChatStore>
        ));
        (svc, store)
    }

    fn parse(frame: String) -> Value {
        serde_json::from_str(&frame).unwrap()
    }

    async fn next_frame(rx: &mut Receiver<String>) -> Value {
        parse(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap())
    }

    fn assert_empty(rx: &mut Receiver<String>) {
        assert!(rx.try_recv().is_err(), "expected no queued frames");
    }

    /// Poll the store until the predicate holds; presence persistence is
    /// fire-and-forget so the durable flag is eventually consistent.
    async fn eventually(mut pred: impl FnMut() -> bool) {
        for _ in 0..100 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn online_broadcast_reaches_others_but_not_self() {
        let (svc, store) = service_with_users(&["alice", "bob"]).await;
        let (_bob, mut bob_rx) = svc.connect("bob").unwrap();
        let (alice, mut alice_rx) = svc.connect("alice").unwrap();

        let frame = next_frame(&mut bob_rx).await;
        assert_eq!(frame["type"], "presence:online");
        assert_eq!(frame["payload"]["username"], "alice");
        assert_eq!(frame["payload"]["connId"], alice.conn_id);
        assert_empty(&mut alice_rx);

        eventually(|| store.online_flag("alice") == Some(true)).await;
        assert_eq!(store.conn_ref_of("alice"), Some(alice.conn_id as i64));
    }

    #[tokio::test]
    async fn supersession_closes_old_connection_without_rebroadcast() {
        let (svc, _store) = service_with_users(&["alice", "bob"]).await;
        let (_bob, mut bob_rx) = svc.connect("bob").unwrap();
        let (old, mut old_rx) = svc.connect("alice").unwrap();
        let _ = next_frame(&mut bob_rx).await; // alice online

        let (new, _new_rx) = svc.connect("alice").unwrap();
        assert_ne!(old.conn_id, new.conn_id);

        // The displaced connection is told to close...
        timeout(Duration::from_secs(1), old.close.notified())
            .await
            .expect("displaced connection should be signalled");
        // ...and nobody sees a duplicate online event.
        assert_empty(&mut bob_rx);
        assert_empty(&mut old_rx);
    }

    #[tokio::test]
    async fn disconnect_broadcasts_offline_and_stamps_last_seen() {
        let (svc, store) = service_with_users(&["alice", "bob"]).await;
        let (alice, _alice_rx) = svc.connect("alice").unwrap();
        let (_bob, mut bob_rx) = svc.connect("bob").unwrap();
        eventually(|| store.online_flag("alice") == Some(true)).await;

        svc.disconnect("alice", alice.conn_id);

        let frame = next_frame(&mut bob_rx).await;
        assert_eq!(frame["type"], "presence:offline");
        assert_eq!(frame["payload"]["username"], "alice");

        eventually(|| store.online_flag("alice") == Some(false)).await;
        assert!(store.last_seen_of("alice").is_some());
        assert_eq!(store.conn_ref_of("alice"), None);
    }

    #[tokio::test]
    async fn stale_disconnect_emits_nothing() {
        let (svc, _store) = service_with_users(&["alice", "bob"]).await;
        let (_bob, mut bob_rx) = svc.connect("bob").unwrap();
        let (old, _old_rx) = svc.connect("alice").unwrap();
        let _ = next_frame(&mut bob_rx).await;
        let (new, _new_rx) = svc.connect("alice").unwrap();

        // The superseded socket reports its disconnect late.
        svc.disconnect("alice", old.conn_id);

        assert_empty(&mut bob_rx);
        assert_eq!(svc.online_snapshot()["alice"], new.conn_id);
    }

    #[tokio::test]
    async fn typing_relay_forwards_or_drops() {
        let (svc, _store) = service_with_users(&["alice", "bob"]).await;
        let (_alice, mut alice_rx) = svc.connect("alice").unwrap();
        let (_bob, mut bob_rx) = svc.connect("bob").unwrap();
        let _ = next_frame(&mut alice_rx).await; // bob online

        svc.relay_typing("alice", "bob", true);
        let frame = next_frame(&mut bob_rx).await;
        assert_eq!(frame["type"], "typing:started");
        assert_eq!(frame["payload"]["from"], "alice");

        svc.relay_typing("alice", "bob", false);
        let frame = next_frame(&mut bob_rx).await;
        assert_eq!(frame["type"], "typing:stopped");

        // Offline recipient: accepted and dropped, no error, nothing queued.
        svc.relay_typing("alice", "carol", true);
        assert_empty(&mut bob_rx);
        assert_empty(&mut alice_rx);
    }

    #[tokio::test]
    async fn message_push_targets_receiver_only() {
        let (svc, store) = service_with_users(&["alice", "bob"]).await;
        let (_alice, mut alice_rx) = svc.connect("alice").unwrap();
        let (_bob, mut bob_rx) = svc.connect("bob").unwrap();
        let _ = next_frame(&mut alice_rx).await; // bob online

        let msg = store.create_message("alice", "bob", "hi").await.unwrap();
        svc.push_message(&msg);

        let frame = next_frame(&mut bob_rx).await;
        assert_eq!(frame["type"], "message:new");
        assert_eq!(frame["payload"]["text"], "hi");
        assert_eq!(frame["payload"]["sender"], "alice");
        assert_empty(&mut alice_rx);
    }

    #[tokio::test]
    async fn seen_push_skips_offline_partner() {
        let (svc, _store) = service_with_users(&["alice", "bob"]).await;
        let (_bob, mut bob_rx) = svc.connect("bob").unwrap();

        svc.push_seen("bob", "alice"); // alice offline: dropped
        assert_empty(&mut bob_rx);

        let (_alice, mut alice_rx) = svc.connect("alice").unwrap();
        let _ = next_frame(&mut bob_rx).await; // alice online
        svc.push_seen("bob", "alice");
        let frame = next_frame(&mut alice_rx).await;
        assert_eq!(frame["type"], "messages:seen");
        assert_eq!(frame["payload"]["from"], "bob");
        assert_eq!(frame["payload"]["by"], "bob");
    }

    #[tokio::test]
    async fn users_changed_reaches_everyone() {
        let (svc, _store) = service_with_users(&["alice", "bob"]).await;
        let (_alice, mut alice_rx) = svc.connect("alice").unwrap();
        let (_bob, mut bob_rx) = svc.connect("bob").unwrap();
        let _ = next_frame(&mut alice_rx).await; // bob online

        svc.broadcast_users_changed();
        assert_eq!(next_frame(&mut alice_rx).await["type"], "users:changed");
        assert_eq!(next_frame(&mut bob_rx).await["type"], "users:changed");
    }

    #[tokio::test]
    async fn bus_subscribers_observe_the_stream() {
        let (svc, _store) = service_with_users(&["alice", "bob"]).await;
        let mut sub_a = svc.subscribe();
        let mut sub_b = svc.subscribe();

        let (_alice, _alice_rx) = svc.connect("alice").unwrap();

        for sub in [&mut sub_a, &mut sub_b] {
            let published = timeout(Duration::from_secs(1), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(published.scope, Scope::AllExcept("alice".into()));
            assert!(matches!(published.event, ServerEvent::PresenceOnline { .. }));
        }
    }

    #[tokio::test]
    async fn shutdown_drains_and_rejects_new_connections() {
        let (svc, _store) = service_with_users(&["alice", "bob"]).await;
        let (alice, _alice_rx) = svc.connect("alice").unwrap();

        svc.shutdown();

        timeout(Duration::from_secs(1), alice.close.notified())
            .await
            .expect("drained connection should be signalled");
        assert!(svc.online_snapshot().is_empty());
        assert!(svc.connect("bob").is_none());
    }
}
