//! Wire protocol for the realtime channel, plus a multi-subscriber event bus.
//!
//! Frames are JSON `{"type": "<event name>", "payload": {...}}` strings in
//! both directions; payload-less events carry only the type.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::MessageRecord;

/// Server -> client events. Variant names map to the wire event names.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    /// A user was created; clients refetch the full user list.
    #[serde(rename = "users:changed")]
    UsersChanged,
    #[serde(rename = "message:new")]
    MessageNew(MessageRecord),
    #[serde(rename = "presence:online")]
    PresenceOnline {
        username: String,
        #[serde(rename = "connId")]
        conn_id: u64,
    },
    #[serde(rename = "presence:offline")]
    PresenceOffline { username: String },
    #[serde(rename = "typing:started")]
    TypingStarted { from: String },
    #[serde(rename = "typing:stopped")]
    TypingStopped { from: String },
    #[serde(rename = "messages:seen")]
    MessagesSeen { from: String, by: String },
}

/// Client -> server frames over the socket. Everything else a client sends
/// is ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "typing:start")]
    TypingStart { to: String },
    #[serde(rename = "typing:stop")]
    TypingStop { to: String },
    #[serde(rename = "ping")]
    Ping,
}

/// Who an outbound event was addressed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    All,
    AllExcept(String),
    User(String),
}

/// An event as published on the bus, with its destination scope.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub scope: Scope,
    pub event: ServerEvent,
}

/// Capacity of the bus channel; subscribers that lag past this skip events
/// (broadcast::error::RecvError::Lagged).
const BUS_CAPACITY: usize = 1024;

/// Multi-subscriber observation channel: every outbound event is published
/// here in addition to being delivered to its target connection(s), so any
/// number of independent consumers can watch the stream without clobbering
/// each other.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PublishedEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Publish to all subscribers. No subscribers is fine.
    pub fn publish(&self, scope: Scope, event: ServerEvent) {
        let _ = self.sender.send(PublishedEvent { scope, event });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn sample_message() -> MessageRecord {
        MessageRecord {
            id: 42,
            sender: "alice".into(),
            receiver: "bob".into(),
            text: "hi".into(),
            created_at: Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap(),
            seen: false,
        }
    }

    #[test]
    fn server_events_use_wire_names() {
        let v = serde_json::to_value(ServerEvent::UsersChanged).unwrap();
        assert_eq!(v, json!({"type": "users:changed"}));

        let v = serde_json::to_value(ServerEvent::MessageNew(sample_message())).unwrap();
        assert_eq!(v["type"], "message:new");
        assert_eq!(v["payload"]["sender"], "alice");
        assert_eq!(v["payload"]["text"], "hi");
        // i64 ids go over the wire as strings for JS clients.
        assert_eq!(v["payload"]["id"], "42");
        assert!(v["payload"]["createdAt"].is_string());

        let v = serde_json::to_value(ServerEvent::MessagesSeen {
            from: "bob".into(),
            by: "bob".into(),
        })
        .unwrap();
        assert_eq!(v, json!({"type": "messages:seen", "payload": {"from": "bob", "by": "bob"}}));
    }

    #[test]
    fn client_frames_parse() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"type":"typing:start","payload":{"to":"bob"}}"#).unwrap();
        assert_eq!(ev, ClientEvent::TypingStart { to: "bob".into() });

        let ev: ClientEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ev, ClientEvent::Ping);

        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"message:new"}"#).is_err());
    }

    #[tokio::test]
    async fn bus_delivers_to_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Scope::All, ServerEvent::UsersChanged);

        assert_eq!(a.recv().await.unwrap().event, ServerEvent::UsersChanged);
        assert_eq!(b.recv().await.unwrap().event, ServerEvent::UsersChanged);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Scope::All, ServerEvent::UsersChanged);
    }
}
