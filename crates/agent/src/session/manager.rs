//! Session lifecycle: create, lookup-with-refresh, soft-delete, restore.
//!
//! The History Store is authoritative; the Presence Store is a TTL'd
//! mirror. A presence miss is not an error; it triggers restoration from
//! history. A history write failure during create is fatal to the create
//! call; presence write failures are logged and swallowed.

use std::sync::Arc;
use time::OffsetDateTime;

use crate::config::SessionSettings;
use crate::session::domain::{
    EffectiveStatus, SessionDescriptor, SessionStatus, derive_thread_id,
};
use crate::session::error::{SessionError, SessionResult};
use crate::session::history::HistoryStore;
use crate::session::presence::PresenceStore;

pub struct SessionManager {
    history: Arc<dyn HistoryStore>,
    presence: Arc<dyn PresenceStore>,
    #[allow(dead_code)]
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        presence: Arc<dyn PresenceStore>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            history,
            presence,
            settings,
        }
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.presence
    }

    /// Create a fresh session for a user. The window id is client-chosen;
    /// absent one, a fresh id is generated.
    pub async fn create(
        &self,
        user_id: &str,
        window_id: Option<&str>,
    ) -> SessionResult<SessionDescriptor> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let window_id = window_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let descriptor = SessionDescriptor::new(user_id, &session_id, &window_id);
        debug_assert_eq!(descriptor.thread_id, derive_thread_id(user_id, &session_id));

        // Authoritative write first; its failure fails the create.
        self.history.save_session(&descriptor).await?;

        if let Err(e) = self.presence.put_descriptor(&descriptor).await {
            log::warn!("presence write failed for session {}: {}", session_id, e);
        }
        if let Err(e) = self.presence.add_user_session(user_id, &session_id).await {
            log::warn!("presence user-set update failed for {}: {}", user_id, e);
        }

        log::info!(
            "created session {} for user {} (window {})",
            session_id,
            user_id,
            window_id
        );
        Ok(descriptor)
    }

    /// Look up a session. Presence hit refreshes the TTL; a miss restores
    /// from history when the session is still `available`.
    pub async fn get(&self, session_id: &str) -> SessionResult<Option<SessionDescriptor>> {
        if let Some(descriptor) = self.presence.get_descriptor(session_id).await? {
            return Ok(Some(descriptor));
        }
        self.restore(session_id).await
    }

    async fn restore(&self, session_id: &str) -> SessionResult<Option<SessionDescriptor>> {
        let Some(descriptor) = self.history.get_session(session_id).await? else {
            return Ok(None);
        };
        if descriptor.status != SessionStatus::Available {
            return Ok(None);
        }

        if let Err(e) = self.presence.put_descriptor(&descriptor).await {
            log::warn!("presence rehydrate failed for {}: {}", session_id, e);
        }
        if let Err(e) = self
            .presence
            .add_user_session(&descriptor.user_id, session_id)
            .await
        {
            log::warn!("presence user-set rehydrate failed for {}: {}", session_id, e);
        }
        log::info!("restored session {} from history", session_id);
        Ok(Some(descriptor))
    }

    /// Merge-patch the descriptor's context map and refresh both stores.
    pub async fn update_context(
        &self,
        session_id: &str,
        patch: serde_json::Value,
    ) -> SessionResult<SessionDescriptor> {
        let mut descriptor = self
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        descriptor.merge_context(patch);
        descriptor.last_activity = OffsetDateTime::now_utc();

        self.history
            .update_context(session_id, &descriptor.context)
            .await?;
        if let Err(e) = self.presence.put_descriptor(&descriptor).await {
            log::warn!("presence context refresh failed for {}: {}", session_id, e);
        }
        Ok(descriptor)
    }

    /// Bump `last_activity` in both stores.
    pub async fn touch(&self, session_id: &str) -> SessionResult<()> {
        let now = OffsetDateTime::now_utc();
        self.history.touch_session(session_id, now).await?;
        if let Some(mut descriptor) = self.presence.get_descriptor(session_id).await? {
            descriptor.last_activity = now;
            let _ = self.presence.put_descriptor(&descriptor).await;
        }
        Ok(())
    }

    /// Remove the session from presence; archive (default) marks history
    /// `deleted`, otherwise the record is physically removed.
    pub async fn delete(&self, session_id: &str, archive: bool) -> SessionResult<()> {
        let owner = self
            .history
            .get_session(session_id)
            .await?
            .map(|d| d.user_id);

        self.presence.clear_session(session_id).await.ok();
        if let Some(user_id) = &owner {
            self.presence
                .remove_user_session(user_id, session_id)
                .await
                .ok();
        }

        if archive {
            self.history
                .set_status(session_id, SessionStatus::Deleted, Some(OffsetDateTime::now_utc()))
                .await?;
        } else {
            self.history.remove_session(session_id).await?;
        }
        log::info!(
            "deleted session {} (archive={})",
            session_id,
            archive
        );
        Ok(())
    }

    /// Enumerate the user's live set, dropping stale entries as they are
    /// discovered. Falls back to history when the presence set is empty.
    pub async fn list_user(&self, user_id: &str) -> SessionResult<Vec<SessionDescriptor>> {
        let ids = self.presence.user_sessions(user_id).await?;
        if ids.is_empty() {
            return self.history.list_user_sessions(user_id, false).await;
        }

        let mut descriptors = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await? {
                Some(descriptor) if descriptor.user_id == user_id => descriptors.push(descriptor),
                _ => {
                    // Stale set entry; reconcile lazily.
                    self.presence.remove_user_session(user_id, &id).await.ok();
                }
            }
        }
        Ok(descriptors)
    }

    /// Derived display state: presence × history.
    pub async fn effective_status(&self, session_id: &str) -> SessionResult<Option<EffectiveStatus>> {
        let present = self.presence.get_descriptor(session_id).await?.is_some();
        let Some(stored) = self.history.get_session(session_id).await? else {
            return Ok(None);
        };
        Ok(Some(match (present, stored.status) {
            (_, SessionStatus::Deleted) => EffectiveStatus::Deleted,
            (true, SessionStatus::Available) => EffectiveStatus::Active,
            (false, SessionStatus::Available) => EffectiveStatus::Inactive,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::presence::MemoryPresenceStore;
    use crate::session::sqlite::SqliteHistoryStore;
    use std::time::Duration;

    fn manager() -> (SessionManager, Arc<MemoryPresenceStore>) {
        let history = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let presence = Arc::new(MemoryPresenceStore::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        let manager = SessionManager::new(
            history,
            presence.clone() as Arc<dyn PresenceStore>,
            SessionSettings::default(),
        );
        (manager, presence)
    }

    // ── Create / get ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_then_get_returns_same_descriptor() {
        let (manager, _) = manager();
        let created = manager.create("alice", Some("w1")).await.unwrap();

        let fetched = manager.get(&created.session_id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "alice");
        assert_eq!(fetched.window_id, "w1");
        assert_eq!(fetched.thread_id, created.thread_id);
        assert_eq!(
            fetched.thread_id,
            derive_thread_id("alice", &created.session_id)
        );
    }

    #[tokio::test]
    async fn create_generates_window_id_when_absent() {
        let (manager, _) = manager();
        let created = manager.create("alice", None).await.unwrap();
        assert!(!created.window_id.is_empty());
    }

    #[tokio::test]
    async fn get_unknown_session_returns_none() {
        let (manager, _) = manager();
        assert!(manager.get("missing").await.unwrap().is_none());
    }

    // ── Restoration ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn presence_lapse_restores_from_history() {
        let (manager, presence) = manager();
        let created = manager.create("alice", None).await.unwrap();

        presence.evict_descriptor(&created.session_id).await;
        assert_eq!(
            manager
                .effective_status(&created.session_id)
                .await
                .unwrap()
                .unwrap(),
            EffectiveStatus::Inactive
        );

        // First get rehydrates, second is a presence hit.
        let restored = manager.get(&created.session_id).await.unwrap().unwrap();
        assert_eq!(restored.session_id, created.session_id);
        assert_eq!(
            manager
                .effective_status(&created.session_id)
                .await
                .unwrap()
                .unwrap(),
            EffectiveStatus::Active
        );
        assert!(
            presence
                .get_descriptor(&created.session_id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn deleted_session_is_not_restorable() {
        let (manager, _) = manager();
        let created = manager.create("alice", None).await.unwrap();
        manager.delete(&created.session_id, true).await.unwrap();

        assert!(manager.get(&created.session_id).await.unwrap().is_none());
        assert_eq!(
            manager
                .effective_status(&created.session_id)
                .await
                .unwrap()
                .unwrap(),
            EffectiveStatus::Deleted
        );
    }

    #[tokio::test]
    async fn hard_delete_removes_history_record() {
        let (manager, _) = manager();
        let created = manager.create("alice", None).await.unwrap();
        manager.delete(&created.session_id, false).await.unwrap();

        assert!(
            manager
                .effective_status(&created.session_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    // ── Context ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn update_context_merges_and_persists() {
        let (manager, presence) = manager();
        let created = manager.create("alice", None).await.unwrap();

        manager
            .update_context(&created.session_id, serde_json::json!({"lang": "en"}))
            .await
            .unwrap();
        let updated = manager
            .update_context(&created.session_id, serde_json::json!({"tz": "UTC"}))
            .await
            .unwrap();
        assert_eq!(updated.context["lang"], "en");
        assert_eq!(updated.context["tz"], "UTC");

        // Survives a presence lapse via the history copy.
        presence.evict_descriptor(&created.session_id).await;
        let restored = manager.get(&created.session_id).await.unwrap().unwrap();
        assert_eq!(restored.context["lang"], "en");
    }

    // ── Listing ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_user_drops_stale_set_entries() {
        let (manager, presence) = manager();
        let keep = manager.create("alice", None).await.unwrap();
        let gone = manager.create("alice", None).await.unwrap();

        // Simulate a session whose backing record vanished entirely.
        manager.history.remove_session(&gone.session_id).await.unwrap();
        presence.evict_descriptor(&gone.session_id).await;

        let listed = manager.list_user("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, keep.session_id);

        let set = presence.user_sessions("alice").await.unwrap();
        assert_eq!(set, vec![keep.session_id.clone()]);
    }

    // ── Failure semantics ──────────────────────────────────────────────────

    #[tokio::test]
    async fn history_write_failure_is_fatal_to_create() {
        let mut history = crate::test_utils::MockHistoryStore::new();
        history
            .expect_save_session()
            .returning(|_| Err(SessionError::Storage("disk full".into())));
        let presence = Arc::new(MemoryPresenceStore::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        let manager = SessionManager::new(
            Arc::new(history),
            presence,
            SessionSettings::default(),
        );

        let err = manager.create("alice", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Storage(_)));
    }

    #[tokio::test]
    async fn presence_write_failure_is_non_fatal_to_create() {
        struct BrokenPresence;

        #[async_trait::async_trait]
        impl PresenceStore for BrokenPresence {
            async fn put_descriptor(&self, _d: &crate::session::SessionDescriptor) -> crate::session::SessionResult<()> {
                Err(SessionError::Storage("presence down".into()))
            }
            async fn get_descriptor(&self, _id: &str) -> crate::session::SessionResult<Option<crate::session::SessionDescriptor>> {
                Ok(None)
            }
            async fn remove_descriptor(&self, _id: &str) -> crate::session::SessionResult<()> {
                Ok(())
            }
            async fn add_user_session(&self, _u: &str, _s: &str) -> crate::session::SessionResult<()> {
                Err(SessionError::Storage("presence down".into()))
            }
            async fn remove_user_session(&self, _u: &str, _s: &str) -> crate::session::SessionResult<()> {
                Ok(())
            }
            async fn user_sessions(&self, _u: &str) -> crate::session::SessionResult<Vec<String>> {
                Ok(vec![])
            }
            async fn push_cached_message(&self, _m: &crate::session::MessageRecord) -> crate::session::SessionResult<()> {
                Err(SessionError::Storage("presence down".into()))
            }
            async fn cached_messages(&self, _s: &str, _l: usize, _o: usize) -> crate::session::SessionResult<Vec<crate::session::MessageRecord>> {
                Ok(vec![])
            }
            async fn replace_cached_messages(&self, _s: &str, _m: Vec<crate::session::MessageRecord>) -> crate::session::SessionResult<()> {
                Ok(())
            }
            async fn clear_session(&self, _s: &str) -> crate::session::SessionResult<()> {
                Ok(())
            }
            async fn put_token(&self, _t: &str, _s: &crate::session::TokenSession) -> crate::session::SessionResult<()> {
                Ok(())
            }
            async fn get_token(&self, _t: &str) -> crate::session::SessionResult<Option<crate::session::TokenSession>> {
                Ok(None)
            }
            async fn revoke_token(&self, _t: &str) -> crate::session::SessionResult<()> {
                Ok(())
            }
        }

        let history = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let manager = SessionManager::new(
            history.clone(),
            Arc::new(BrokenPresence),
            SessionSettings::default(),
        );

        // Create succeeds despite the presence layer being down; the
        // authoritative record exists and the session is restorable.
        let created = manager.create("alice", None).await.unwrap();
        let fetched = manager.get(&created.session_id).await.unwrap().unwrap();
        assert_eq!(fetched.session_id, created.session_id);
    }

    #[tokio::test]
    async fn list_user_falls_back_to_history_when_set_empty() {
        let (manager, presence) = manager();
        let created = manager.create("alice", None).await.unwrap();
        presence.remove_user_session("alice", &created.session_id).await.unwrap();
        presence.evict_descriptor(&created.session_id).await;

        let listed = manager.list_user("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, created.session_id);
    }
}
