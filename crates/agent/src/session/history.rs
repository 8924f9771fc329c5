//! Generic storage interface for durable session persistence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::session::domain::{MessageRecord, SessionDescriptor, SessionStatus};
use crate::session::error::SessionResult;

/// Aggregate counts for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    pub sessions: u64,
    pub messages: u64,
}

/// Durable, append-mostly record of sessions and messages.
///
/// ## Thread safety & session isolation
///
/// Implementations MUST guarantee strict session isolation:
/// - every query is scoped by session id; operations on one session never
///   affect another,
/// - concurrent operations on different sessions do not block each other
///   beyond the backing store's own serialization,
/// - within one session, write order equals conversation order.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert or replace a session descriptor (authoritative write).
    async fn save_session(&self, descriptor: &SessionDescriptor) -> SessionResult<()>;

    /// Fetch a session descriptor by id, regardless of status.
    async fn get_session(&self, session_id: &str) -> SessionResult<Option<SessionDescriptor>>;

    /// Update the free-form context map.
    async fn update_context(&self, session_id: &str, context: &Value) -> SessionResult<()>;

    /// Bump `last_activity` (monotonically non-decreasing).
    async fn touch_session(&self, session_id: &str, at: OffsetDateTime) -> SessionResult<()>;

    /// Set the durable status; `deleted_at` accompanies `Deleted`.
    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        deleted_at: Option<OffsetDateTime>,
    ) -> SessionResult<()>;

    /// Physically remove a session and its messages.
    async fn remove_session(&self, session_id: &str) -> SessionResult<()>;

    /// List a user's sessions, optionally including soft-deleted ones.
    async fn list_user_sessions(
        &self,
        user_id: &str,
        include_deleted: bool,
    ) -> SessionResult<Vec<SessionDescriptor>>;

    /// Append a message. Fails the whole call on storage error; no partial
    /// write is left behind.
    async fn save_message(&self, message: &MessageRecord) -> SessionResult<()>;

    /// Messages of a session in insertion order, paginated.
    async fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> SessionResult<Vec<MessageRecord>>;

    /// The most recent `limit` messages of a session, in insertion order.
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> SessionResult<Vec<MessageRecord>>;

    /// Case-insensitive substring search over a user's messages.
    async fn search_messages(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> SessionResult<Vec<MessageRecord>>;

    /// Fetch a single message by id.
    async fn get_message(&self, message_id: &str) -> SessionResult<Option<MessageRecord>>;

    /// Aggregate counts.
    async fn stats(&self) -> SessionResult<HistoryStats>;
}
