//! Session and history layer.
//!
//! Two stored facts determine a session's effective state: whether the
//! History Store (durable, authoritative) carries it as `available` or
//! `deleted`, and whether the Presence Store (short-TTL) currently holds a
//! live descriptor. Everything else is derived.

pub mod domain;
pub mod error;
pub mod history;
pub mod manager;
pub mod presence;
pub mod sqlite;

pub use domain::{
    EffectiveStatus, MessageRecord, MessageRole, SessionDescriptor, SessionStatus,
    derive_thread_id,
};
pub use error::{SessionError, SessionResult};
pub use history::{HistoryStats, HistoryStore};
pub use manager::SessionManager;
pub use presence::{MemoryPresenceStore, PresenceStore, TokenSession};
pub use sqlite::SqliteHistoryStore;
