//! SQLite-backed [`HistoryStore`].
//!
//! One bundled connection behind a mutex; every call hops onto the blocking
//! pool via `spawn_blocking`. Timestamps are stored as unix nanoseconds so
//! insertion order and range queries never depend on string formats.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::session::domain::{MessageRecord, MessageRole, SessionDescriptor, SessionStatus};
use crate::session::error::{SessionError, SessionResult};
use crate::session::history::{HistoryStats, HistoryStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id    TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    window_id     TEXT NOT NULL,
    thread_id     TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,
    context       TEXT NOT NULL DEFAULT '{}',
    status        TEXT NOT NULL DEFAULT 'available',
    deleted_at    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

CREATE TABLE IF NOT EXISTS messages (
    message_id  TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    metadata    TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp);
"#;

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> SessionResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Ephemeral store, used by tests and `db_path = ":memory:"` deployments.
    pub fn in_memory() -> SessionResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> SessionResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> SessionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> SessionResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| SessionError::Storage(format!("blocking task failed: {}", e)))?
    }
}

fn ns(at: OffsetDateTime) -> i64 {
    at.unix_timestamp_nanos() as i64
}

fn from_ns(ns: i64) -> SessionResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ns as i128)
        .map_err(|e| SessionError::Storage(format!("bad timestamp in store: {}", e)))
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<(SessionDescriptor, i64, i64, Option<i64>)> {
    let context: String = row.get("context")?;
    let status: String = row.get("status")?;
    let descriptor = SessionDescriptor {
        session_id: row.get("session_id")?,
        user_id: row.get("user_id")?,
        window_id: row.get("window_id")?,
        thread_id: row.get("thread_id")?,
        created_at: OffsetDateTime::UNIX_EPOCH,
        last_activity: OffsetDateTime::UNIX_EPOCH,
        context: serde_json::from_str(&context).unwrap_or(Value::Null),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Available),
        deleted_at: None,
    };
    Ok((
        descriptor,
        row.get("created_at")?,
        row.get("last_activity")?,
        row.get("deleted_at")?,
    ))
}

fn finish_session(
    parts: (SessionDescriptor, i64, i64, Option<i64>),
) -> SessionResult<SessionDescriptor> {
    let (mut descriptor, created, last, deleted) = parts;
    descriptor.created_at = from_ns(created)?;
    descriptor.last_activity = from_ns(last)?;
    descriptor.deleted_at = deleted.map(from_ns).transpose()?;
    Ok(descriptor)
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<(MessageRecord, i64)> {
    let role: String = row.get("role")?;
    let metadata: String = row.get("metadata")?;
    let record = MessageRecord {
        message_id: row.get("message_id")?,
        session_id: row.get("session_id")?,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::User),
        content: row.get("content")?,
        timestamp: OffsetDateTime::UNIX_EPOCH,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    };
    Ok((record, row.get("timestamp")?))
}

fn finish_message(parts: (MessageRecord, i64)) -> SessionResult<MessageRecord> {
    let (mut record, ts) = parts;
    record.timestamp = from_ns(ts)?;
    Ok(record)
}

const SESSION_COLUMNS: &str =
    "session_id, user_id, window_id, thread_id, created_at, last_activity, context, status, deleted_at";
const MESSAGE_COLUMNS: &str = "message_id, session_id, role, content, timestamp, metadata";

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn save_session(&self, descriptor: &SessionDescriptor) -> SessionResult<()> {
        let d = descriptor.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions \
                 (session_id, user_id, window_id, thread_id, created_at, last_activity, context, status, deleted_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    d.session_id,
                    d.user_id,
                    d.window_id,
                    d.thread_id,
                    ns(d.created_at),
                    ns(d.last_activity),
                    serde_json::to_string(&d.context)?,
                    d.status.as_str(),
                    d.deleted_at.map(ns),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> SessionResult<Option<SessionDescriptor>> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let parts = conn
                .query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                    params![id],
                    row_to_session,
                )
                .optional()?;
            parts.map(finish_session).transpose()
        })
        .await
    }

    async fn update_context(&self, session_id: &str, context: &Value) -> SessionResult<()> {
        let id = session_id.to_string();
        let context = serde_json::to_string(context)?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions SET context = ?2 WHERE session_id = ?1",
                params![id, context],
            )?;
            if updated == 0 {
                return Err(SessionError::SessionNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn touch_session(&self, session_id: &str, at: OffsetDateTime) -> SessionResult<()> {
        let id = session_id.to_string();
        let at = ns(at);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET last_activity = MAX(last_activity, ?2) WHERE session_id = ?1",
                params![id, at],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        deleted_at: Option<OffsetDateTime>,
    ) -> SessionResult<()> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions SET status = ?2, deleted_at = ?3 WHERE session_id = ?1",
                params![id, status.as_str(), deleted_at.map(ns)],
            )?;
            if updated == 0 {
                return Err(SessionError::SessionNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn remove_session(&self, session_id: &str) -> SessionResult<()> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn list_user_sessions(
        &self,
        user_id: &str,
        include_deleted: bool,
    ) -> SessionResult<Vec<SessionDescriptor>> {
        let user = user_id.to_string();
        self.with_conn(move |conn| {
            let sql = if include_deleted {
                format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1 \
                     ORDER BY last_activity DESC"
                )
            } else {
                format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1 \
                     AND status = 'available' ORDER BY last_activity DESC"
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![user], row_to_session)?;
            rows.map(|r| finish_session(r?)).collect()
        })
        .await
    }

    async fn save_message(&self, message: &MessageRecord) -> SessionResult<()> {
        let m = message.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (message_id, session_id, role, content, timestamp, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    m.message_id,
                    m.session_id,
                    m.role.as_str(),
                    m.content,
                    ns(m.timestamp),
                    serde_json::to_string(&m.metadata)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> SessionResult<Vec<MessageRecord>> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1 \
                 ORDER BY timestamp ASC, rowid ASC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![id, limit as i64, offset as i64], row_to_message)?;
            rows.map(|r| finish_message(r?)).collect()
        })
        .await
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> SessionResult<Vec<MessageRecord>> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1 \
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![id, limit as i64], row_to_message)?;
            let mut messages: Vec<MessageRecord> =
                rows.map(|r| finish_message(r?)).collect::<SessionResult<_>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn search_messages(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> SessionResult<Vec<MessageRecord>> {
        let user = user_id.to_string();
        let needle = query.to_lowercase();
        self.with_conn(move |conn| {
            // instr() instead of LIKE so user input is never a pattern.
            let mut stmt = conn.prepare(&format!(
                "SELECT m.message_id, m.session_id, m.role, m.content, m.timestamp, m.metadata \
                 FROM messages m JOIN sessions s ON m.session_id = s.session_id \
                 WHERE s.user_id = ?1 AND s.status = 'available' \
                 AND instr(lower(m.content), ?2) > 0 \
                 ORDER BY m.timestamp DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![user, needle, limit as i64], row_to_message)?;
            rows.map(|r| finish_message(r?)).collect()
        })
        .await
    }

    async fn get_message(&self, message_id: &str) -> SessionResult<Option<MessageRecord>> {
        let id = message_id.to_string();
        self.with_conn(move |conn| {
            let parts = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1"),
                    params![id],
                    row_to_message,
                )
                .optional()?;
            parts.map(finish_message).transpose()
        })
        .await
    }

    async fn stats(&self) -> SessionResult<HistoryStats> {
        self.with_conn(|conn| {
            let sessions: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
            let messages: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
            Ok(HistoryStats {
                sessions: sessions as u64,
                messages: messages as u64,
            })
        })
        .await
    }
}
