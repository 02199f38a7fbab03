//! Persistence seam. The realtime core only touches messages and users
//! through [`ChatStore`], a narrow interface over the durable store:
//! find-by-pair history, recent partners with unseen counts, bulk mark-seen,
//! and the online/last-seen presence flags. [`pg::PgStore`] is the production
//! implementation.

pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// An identity in the request does not resolve.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// A uniqueness rule was violated (duplicate username).
    #[error("{0}")]
    Conflict(&'static str),
    /// The store itself failed; durable-write callers surface this as a
    /// server error, presence paths log and move on.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Canonical persisted message, joined with sender/receiver usernames.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageRecord {
    #[serde(with = "crate::serde_i64_string")]
    pub id: i64,
    pub sender: String,
    pub receiver: String,
    pub text: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub seen: bool,
}

/// Durable user record, without credentials.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub username: String,
    /// Durable online flag; may lag the registry while a presence write is
    /// in flight. The user-list endpoint overrides it from the live snapshot.
    pub online: bool,
    #[serde(rename = "lastSeen")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// A conversation partner annotated with the count of their messages the
/// user has not yet seen.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PartnerSummary {
    pub username: String,
    pub unseen: i64,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_user(&self, username: &str, password_hash: &str)
        -> Result<UserRecord, StoreError>;

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Password hash for login verification, None when the user is unknown.
    async fn credentials(&self, username: &str) -> Result<Option<String>, StoreError>;

    async fn update_password(&self, username: &str, password_hash: &str)
        -> Result<bool, StoreError>;

    /// Users matching the optional case-insensitive substring filter.
    async fn list_users(&self, filter: Option<&str>) -> Result<Vec<UserRecord>, StoreError>;

    /// Durable side of a presence online transition: set the flag and record
    /// the connection reference.
    async fn set_user_online(&self, username: &str, conn_ref: i64) -> Result<(), StoreError>;

    /// Durable side of a presence offline transition: clear the flag and the
    /// connection reference, stamp last-seen.
    async fn set_user_offline(
        &self,
        username: &str,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Persist a new message with `seen = false` and a server-assigned
    /// creation time. Fails with NotFound when either identity is unknown,
    /// persisting nothing.
    async fn create_message(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> Result<MessageRecord, StoreError>;

    /// All messages between the pair, ascending by creation time. Side
    /// effect: unseen messages sent by `user2` to `user1` are marked seen
    /// (history view implies read). The returned records reflect the state
    /// before the update, matching what the viewer fetched.
    async fn pair_history(
        &self,
        user1: &str,
        user2: &str,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Distinct conversation partners of `username`, most recent interaction
    /// first, each with its unseen count.
    async fn recent_partners(&self, username: &str) -> Result<Vec<PartnerSummary>, StoreError>;

    /// Bulk-mark messages from `partner` to `viewer` as seen. Idempotent;
    /// returns the number of rows that actually flipped false -> true.
    async fn mark_seen(&self, viewer: &str, partner: &str) -> Result<usize, StoreError>;
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    async fn store_with_users(users: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for u in users {
            store.seed_user(u).await;
        }
        store
    }

    #[tokio::test]
    async fn mark_seen_is_idempotent() {
        let store = store_with_users(&["alice", "bob"]).await;
        store.create_message("alice", "bob", "one").await.unwrap();
        store.create_message("alice", "bob", "two").await.unwrap();

        assert_eq!(store.mark_seen("bob", "alice").await.unwrap(), 2);
        assert_eq!(store.mark_seen("bob", "alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn seen_never_reverts() {
        let store = store_with_users(&["alice", "bob"]).await;
        store.create_message("alice", "bob", "hi").await.unwrap();
        store.mark_seen("bob", "alice").await.unwrap();

        // Another fetch and another mark-seen must leave the flag set.
        let history = store.pair_history("bob", "alice").await.unwrap();
        assert!(history.iter().all(|m| m.seen));
        assert_eq!(store.mark_seen("bob", "alice").await.unwrap(), 0);
        let history = store.pair_history("bob", "alice").await.unwrap();
        assert!(history.iter().all(|m| m.seen));
    }

    #[tokio::test]
    async fn unknown_receiver_persists_nothing() {
        let store = store_with_users(&["alice"]).await;
        let err = store.create_message("alice", "nobody", "hi").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn history_is_ascending_and_marks_partner_messages_seen() {
        let store = store_with_users(&["alice", "bob"]).await;
        store.create_message("alice", "bob", "first").await.unwrap();
        store.create_message("bob", "alice", "second").await.unwrap();
        store.create_message("alice", "bob", "third").await.unwrap();

        // Bob views his conversation with Alice.
        let history = store.pair_history("bob", "alice").await.unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
        // The fetched rows show the pre-fetch state.
        assert!(!history[0].seen);

        // Alice's messages to Bob are now seen; Bob's message to Alice is not.
        assert_eq!(store.mark_seen("bob", "alice").await.unwrap(), 0);
        assert_eq!(store.mark_seen("alice", "bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recent_partners_ordered_with_unseen_counts() {
        let store = store_with_users(&["carol", "dave", "erin"]).await;
        store.create_message("dave", "carol", "d1").await.unwrap();
        store.create_message("erin", "carol", "e1").await.unwrap();
        store.create_message("erin", "carol", "e2").await.unwrap();

        let partners = store.recent_partners("carol").await.unwrap();
        assert_eq!(
            partners,
            vec![
                PartnerSummary { username: "erin".into(), unseen: 2 },
                PartnerSummary { username: "dave".into(), unseen: 1 },
            ]
        );

        // Viewing Erin's thread clears her count but not Dave's.
        store.pair_history("carol", "erin").await.unwrap();
        let partners = store.recent_partners("carol").await.unwrap();
        assert_eq!(partners[0], PartnerSummary { username: "erin".into(), unseen: 0 });
        assert_eq!(partners[1], PartnerSummary { username: "dave".into(), unseen: 1 });
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let store = store_with_users(&["alice"]).await;
        let err = store.create_user("alice", "hash").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
