//! Session and message domain records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Stable memory key for the agent bound to a session.
///
/// A pure function of `(user_id, session_id)`; it never changes over the
/// session's lifetime.
pub fn derive_thread_id(user_id: &str, session_id: &str) -> String {
    format!("{}_{}", user_id, session_id)
}

/// Durable status of a session in the History Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Available,
    Deleted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Available => "available",
            SessionStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(SessionStatus::Available),
            "deleted" => Some(SessionStatus::Deleted),
            _ => None,
        }
    }
}

/// Effective session state, derived from presence × history. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveStatus {
    /// Present in the Presence Store and `available` in history.
    Active,
    /// Absent from the Presence Store but restorable from history.
    Inactive,
    /// Soft-deleted in history; not restorable.
    Deleted,
}

/// A live or persisted session descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub user_id: String,
    /// Client-chosen sub-identifier; a user may hold several windows.
    pub window_id: String,
    /// Derived memory key, equal to `derive_thread_id(user_id, session_id)`.
    pub thread_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    /// Free-form context map, merge-patched by clients.
    #[serde(default)]
    pub context: Value,
    pub status: SessionStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl SessionDescriptor {
    pub fn new(user_id: &str, session_id: &str, window_id: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            window_id: window_id.to_string(),
            thread_id: derive_thread_id(user_id, session_id),
            created_at: now,
            last_activity: now,
            context: Value::Object(Default::default()),
            status: SessionStatus::Available,
            deleted_at: None,
        }
    }

    /// Shallow merge-patch into the context map. Non-object patches replace
    /// the map wholesale.
    pub fn merge_context(&mut self, patch: Value) {
        match (&mut self.context, patch) {
            (Value::Object(current), Value::Object(incoming)) => {
                for (key, value) in incoming {
                    if value.is_null() {
                        current.remove(&key);
                    } else {
                        current.insert(key, value);
                    }
                }
            }
            (slot, other) => *slot = other,
        }
    }
}

/// Role of a persisted conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// An append-only conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub metadata: Value,
}

impl MessageRecord {
    pub fn new(session_id: &str, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.into(),
            timestamp: OffsetDateTime::now_utc(),
            metadata: Value::Object(Default::default()),
        }
    }
}
