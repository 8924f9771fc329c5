//! Short-TTL presence layer.
//!
//! Holds live session descriptors, per-user session sets, a bounded message
//! cache, and the token → user mapping used by request auth. Everything here
//! may lapse independently of the History Store; readers reconstruct from
//! history on a miss. The in-memory implementation leans on `moka`'s
//! time-to-idle policy so any access refreshes a key's TTL, matching the
//! refresh-on-access contract.

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::session::domain::{MessageRecord, SessionDescriptor};
use crate::session::error::SessionResult;

/// A token's resolved identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSession {
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl TokenSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            issued_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Short-lived key/value + set store for live session state.
///
/// Write failures here are non-fatal to callers: the History Store stays
/// authoritative and reads fall back to it.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn put_descriptor(&self, descriptor: &SessionDescriptor) -> SessionResult<()>;
    async fn get_descriptor(&self, session_id: &str) -> SessionResult<Option<SessionDescriptor>>;
    async fn remove_descriptor(&self, session_id: &str) -> SessionResult<()>;

    async fn add_user_session(&self, user_id: &str, session_id: &str) -> SessionResult<()>;
    async fn remove_user_session(&self, user_id: &str, session_id: &str) -> SessionResult<()>;
    async fn user_sessions(&self, user_id: &str) -> SessionResult<Vec<String>>;

    async fn push_cached_message(&self, message: &MessageRecord) -> SessionResult<()>;
    async fn cached_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> SessionResult<Vec<MessageRecord>>;
    /// Replace the whole cached list (used when rehydrating from history).
    async fn replace_cached_messages(
        &self,
        session_id: &str,
        messages: Vec<MessageRecord>,
    ) -> SessionResult<()>;

    /// Drop a session's descriptor and message cache.
    async fn clear_session(&self, session_id: &str) -> SessionResult<()>;

    async fn put_token(&self, token: &str, session: &TokenSession) -> SessionResult<()>;
    async fn get_token(&self, token: &str) -> SessionResult<Option<TokenSession>>;
    async fn revoke_token(&self, token: &str) -> SessionResult<()>;
}

/// In-process presence store backed by TTL caches.
pub struct MemoryPresenceStore {
    descriptors: Cache<String, SessionDescriptor>,
    user_sets: Cache<String, Vec<String>>,
    messages: Cache<String, Vec<MessageRecord>>,
    tokens: Cache<String, TokenSession>,
    // Serializes read-modify-write updates on user_sets and messages.
    write_lock: Mutex<()>,
}

impl MemoryPresenceStore {
    pub fn new(session_ttl: Duration, message_ttl: Duration) -> Self {
        Self {
            descriptors: Cache::builder().time_to_idle(session_ttl).build(),
            user_sets: Cache::builder().time_to_idle(session_ttl).build(),
            messages: Cache::builder().time_to_live(message_ttl).build(),
            tokens: Cache::builder().time_to_idle(session_ttl).build(),
            write_lock: Mutex::new(()),
        }
    }

    /// Force a key out, simulating a TTL lapse. Test hook.
    pub async fn evict_descriptor(&self, session_id: &str) {
        self.descriptors.invalidate(session_id).await;
    }

    /// Flush pending cache maintenance so expirations become observable.
    pub async fn run_pending_tasks(&self) {
        self.descriptors.run_pending_tasks().await;
        self.user_sets.run_pending_tasks().await;
        self.messages.run_pending_tasks().await;
        self.tokens.run_pending_tasks().await;
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn put_descriptor(&self, descriptor: &SessionDescriptor) -> SessionResult<()> {
        self.descriptors
            .insert(descriptor.session_id.clone(), descriptor.clone())
            .await;
        Ok(())
    }

    async fn get_descriptor(&self, session_id: &str) -> SessionResult<Option<SessionDescriptor>> {
        Ok(self.descriptors.get(session_id).await)
    }

    async fn remove_descriptor(&self, session_id: &str) -> SessionResult<()> {
        self.descriptors.invalidate(session_id).await;
        Ok(())
    }

    async fn add_user_session(&self, user_id: &str, session_id: &str) -> SessionResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut set = self.user_sets.get(user_id).await.unwrap_or_default();
        if !set.iter().any(|s| s == session_id) {
            set.push(session_id.to_string());
        }
        self.user_sets.insert(user_id.to_string(), set).await;
        Ok(())
    }

    async fn remove_user_session(&self, user_id: &str, session_id: &str) -> SessionResult<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(mut set) = self.user_sets.get(user_id).await {
            set.retain(|s| s != session_id);
            self.user_sets.insert(user_id.to_string(), set).await;
        }
        Ok(())
    }

    async fn user_sessions(&self, user_id: &str) -> SessionResult<Vec<String>> {
        Ok(self.user_sets.get(user_id).await.unwrap_or_default())
    }

    async fn push_cached_message(&self, message: &MessageRecord) -> SessionResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut list = self
            .messages
            .get(&message.session_id)
            .await
            .unwrap_or_default();
        list.push(message.clone());
        self.messages.insert(message.session_id.clone(), list).await;
        Ok(())
    }

    async fn cached_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> SessionResult<Vec<MessageRecord>> {
        let list = self.messages.get(session_id).await.unwrap_or_default();
        Ok(list.into_iter().skip(offset).take(limit).collect())
    }

    async fn replace_cached_messages(
        &self,
        session_id: &str,
        messages: Vec<MessageRecord>,
    ) -> SessionResult<()> {
        let _guard = self.write_lock.lock().await;
        self.messages.insert(session_id.to_string(), messages).await;
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> SessionResult<()> {
        self.descriptors.invalidate(session_id).await;
        self.messages.invalidate(session_id).await;
        Ok(())
    }

    async fn put_token(&self, token: &str, session: &TokenSession) -> SessionResult<()> {
        self.tokens.insert(token.to_string(), session.clone()).await;
        Ok(())
    }

    async fn get_token(&self, token: &str) -> SessionResult<Option<TokenSession>> {
        Ok(self.tokens.get(token).await)
    }

    async fn revoke_token(&self, token: &str) -> SessionResult<()> {
        self.tokens.invalidate(token).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::domain::MessageRole;

    fn store() -> MemoryPresenceStore {
        MemoryPresenceStore::new(Duration::from_secs(60), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn descriptor_round_trip_and_removal() {
        let store = store();
        let desc = SessionDescriptor::new("alice", "s1", "w1");
        store.put_descriptor(&desc).await.unwrap();
        assert!(store.get_descriptor("s1").await.unwrap().is_some());

        store.remove_descriptor("s1").await.unwrap();
        assert!(store.get_descriptor("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_set_is_deduplicated() {
        let store = store();
        store.add_user_session("alice", "s1").await.unwrap();
        store.add_user_session("alice", "s1").await.unwrap();
        store.add_user_session("alice", "s2").await.unwrap();

        let set = store.user_sessions("alice").await.unwrap();
        assert_eq!(set, vec!["s1", "s2"]);

        store.remove_user_session("alice", "s1").await.unwrap();
        assert_eq!(store.user_sessions("alice").await.unwrap(), vec!["s2"]);
    }

    #[tokio::test]
    async fn cached_messages_paginate_in_order() {
        let store = store();
        for i in 0..5 {
            let msg = MessageRecord::new("s1", MessageRole::User, format!("m{}", i));
            store.push_cached_message(&msg).await.unwrap();
        }
        let page = store.cached_messages("s1", 2, 1).await.unwrap();
        assert_eq!(page[0].content, "m1");
        assert_eq!(page[1].content, "m2");
    }

    #[tokio::test]
    async fn clear_session_drops_descriptor_and_cache() {
        let store = store();
        store
            .put_descriptor(&SessionDescriptor::new("alice", "s1", "w1"))
            .await
            .unwrap();
        store
            .push_cached_message(&MessageRecord::new("s1", MessageRole::User, "x"))
            .await
            .unwrap();

        store.clear_session("s1").await.unwrap();
        assert!(store.get_descriptor("s1").await.unwrap().is_none());
        assert!(store.cached_messages("s1", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn descriptor_lapses_after_ttl() {
        let store = MemoryPresenceStore::new(Duration::from_millis(50), Duration::from_secs(60));
        store
            .put_descriptor(&SessionDescriptor::new("alice", "s1", "w1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        store.run_pending_tasks().await;
        assert!(store.get_descriptor("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_round_trip_and_revoke() {
        let store = store();
        store
            .put_token("tok-1", &TokenSession::new("alice"))
            .await
            .unwrap();
        let session = store.get_token("tok-1").await.unwrap().unwrap();
        assert_eq!(session.user_id, "alice");

        store.revoke_token("tok-1").await.unwrap();
        assert!(store.get_token("tok-1").await.unwrap().is_none());
    }
}
