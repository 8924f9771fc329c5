//! Mock implementations for testing

use async_trait::async_trait;
use mockall::mock;
use serde_json::Value;
use time::OffsetDateTime;

use crate::session::domain::{MessageRecord, SessionDescriptor, SessionStatus};
use crate::session::error::SessionResult;
use crate::session::history::{HistoryStats, HistoryStore};

// ============================================================================
// MockHistoryStore
// ============================================================================

mock! {
    pub HistoryStore {}

    #[async_trait]
    impl HistoryStore for HistoryStore {
        async fn save_session(&self, descriptor: &SessionDescriptor) -> SessionResult<()>;
        async fn get_session(&self, session_id: &str) -> SessionResult<Option<SessionDescriptor>>;
        async fn update_context<'a, 'b, 'c>(
            &'a self,
            session_id: &'b str,
            context: &'c Value,
        ) -> SessionResult<()>;
        async fn touch_session(&self, session_id: &str, at: OffsetDateTime) -> SessionResult<()>;
        async fn set_status(
            &self,
            session_id: &str,
            status: SessionStatus,
            deleted_at: Option<OffsetDateTime>,
        ) -> SessionResult<()>;
        async fn remove_session(&self, session_id: &str) -> SessionResult<()>;
        async fn list_user_sessions(
            &self,
            user_id: &str,
            include_deleted: bool,
        ) -> SessionResult<Vec<SessionDescriptor>>;
        async fn save_message(&self, message: &MessageRecord) -> SessionResult<()>;
        async fn get_messages(
            &self,
            session_id: &str,
            limit: usize,
            offset: usize,
        ) -> SessionResult<Vec<MessageRecord>>;
        async fn recent_messages(
            &self,
            session_id: &str,
            limit: usize,
        ) -> SessionResult<Vec<MessageRecord>>;
        async fn search_messages<'a, 'b, 'c>(
            &'a self,
            user_id: &'b str,
            query: &'c str,
            limit: usize,
        ) -> SessionResult<Vec<MessageRecord>>;
        async fn get_message(&self, message_id: &str) -> SessionResult<Option<MessageRecord>>;
        async fn stats(&self) -> SessionResult<HistoryStats>;
    }
}
