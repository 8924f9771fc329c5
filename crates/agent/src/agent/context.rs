//! Transient per-session execution state.
//!
//! The context registry is strictly in-memory for the duration of a turn;
//! durable session state lives in the History/Presence stores. Invariant:
//! a context is `WaitingPermission` iff its pending list is non-empty.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Execution state of a session's current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Running,
    WaitingPermission,
    Paused,
    Completed,
    Error,
}

/// Snapshot of a session's execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub session_id: String,
    pub state: ExecutionState,
    /// Request ids of in-flight pending tool executions.
    pub pending_requests: Vec<String>,
    pub status_message: String,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ExecutionContext {
    fn new(session_id: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            session_id: session_id.to_string(),
            state: ExecutionState::Idle,
            pending_requests: Vec::new(),
            status_message: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Contexts older than this with no activity are swept away.
const STALE_AFTER: time::Duration = time::Duration::minutes(30);

/// Registry of per-session execution contexts.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<String, ExecutionContext>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-or-create the context for a session.
    pub fn ensure(&self, session_id: &str) -> ExecutionContext {
        let mut contexts = self.contexts.lock();
        contexts
            .entry(session_id.to_string())
            .or_insert_with(|| ExecutionContext::new(session_id))
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<ExecutionContext> {
        self.contexts.lock().get(session_id).cloned()
    }

    /// Transition a session's state, recording an optional status message
    /// or error.
    pub fn update_state(
        &self,
        session_id: &str,
        state: ExecutionState,
        message: Option<&str>,
        error: Option<&str>,
    ) {
        let mut contexts = self.contexts.lock();
        let context = contexts
            .entry(session_id.to_string())
            .or_insert_with(|| ExecutionContext::new(session_id));
        context.state = state;
        context.updated_at = OffsetDateTime::now_utc();
        if let Some(message) = message {
            context.status_message = message.to_string();
        }
        if let Some(error) = error {
            context.error = Some(error.to_string());
        }
        log::debug!("session {} execution state -> {:?}", session_id, state);
    }

    /// Record an in-flight pending execution; the session enters
    /// `WaitingPermission`.
    pub fn push_pending(&self, session_id: &str, request_id: &str) {
        let mut contexts = self.contexts.lock();
        let context = contexts
            .entry(session_id.to_string())
            .or_insert_with(|| ExecutionContext::new(session_id));
        context.pending_requests.push(request_id.to_string());
        context.state = ExecutionState::WaitingPermission;
        context.updated_at = OffsetDateTime::now_utc();
    }

    /// Resolve one pending execution. When the list empties, the session
    /// returns to `Running`.
    pub fn resolve_pending(&self, session_id: &str, request_id: &str) {
        let mut contexts = self.contexts.lock();
        if let Some(context) = contexts.get_mut(session_id) {
            context.pending_requests.retain(|id| id != request_id);
            if context.pending_requests.is_empty()
                && context.state == ExecutionState::WaitingPermission
            {
                context.state = ExecutionState::Running;
            }
            context.updated_at = OffsetDateTime::now_utc();
        }
    }

    /// Last-resort fallback for tool calls that arrive without a session id:
    /// usable only when exactly one session is currently `Running`.
    pub fn sole_running_session(&self) -> Option<String> {
        let contexts = self.contexts.lock();
        let mut running = contexts
            .values()
            .filter(|c| c.state == ExecutionState::Running)
            .map(|c| c.session_id.clone());
        let first = running.next()?;
        match running.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    pub fn remove(&self, session_id: &str) {
        self.contexts.lock().remove(session_id);
    }

    /// Drop contexts idle past the staleness window; returns how many went.
    pub fn sweep_stale(&self) -> usize {
        let cutoff = OffsetDateTime::now_utc() - STALE_AFTER;
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, c| c.updated_at > cutoff || !c.pending_requests.is_empty());
        before - contexts.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_idle_context() {
        let registry = ContextRegistry::new();
        let context = registry.ensure("s1");
        assert_eq!(context.state, ExecutionState::Idle);
        assert!(context.pending_requests.is_empty());
    }

    #[test]
    fn waiting_permission_iff_pending_nonempty() {
        let registry = ContextRegistry::new();
        registry.update_state("s1", ExecutionState::Running, None, None);

        registry.push_pending("s1", "r1");
        registry.push_pending("s1", "r2");
        assert_eq!(
            registry.get("s1").unwrap().state,
            ExecutionState::WaitingPermission
        );

        registry.resolve_pending("s1", "r1");
        assert_eq!(
            registry.get("s1").unwrap().state,
            ExecutionState::WaitingPermission
        );

        registry.resolve_pending("s1", "r2");
        let context = registry.get("s1").unwrap();
        assert_eq!(context.state, ExecutionState::Running);
        assert!(context.pending_requests.is_empty());
    }

    #[test]
    fn error_transition_records_message() {
        let registry = ContextRegistry::new();
        registry.update_state("s1", ExecutionState::Error, Some("turn failed"), Some("boom"));
        let context = registry.get("s1").unwrap();
        assert_eq!(context.state, ExecutionState::Error);
        assert_eq!(context.status_message, "turn failed");
        assert_eq!(context.error.as_deref(), Some("boom"));
    }

    #[test]
    fn sole_running_session_requires_exactly_one() {
        let registry = ContextRegistry::new();
        assert_eq!(registry.sole_running_session(), None);

        registry.update_state("s1", ExecutionState::Running, None, None);
        assert_eq!(registry.sole_running_session(), Some("s1".to_string()));

        registry.update_state("s2", ExecutionState::Running, None, None);
        assert_eq!(registry.sole_running_session(), None);

        registry.update_state("s2", ExecutionState::Completed, None, None);
        assert_eq!(registry.sole_running_session(), Some("s1".to_string()));
    }

    #[test]
    fn sweep_spares_contexts_with_pending_requests() {
        let registry = ContextRegistry::new();
        registry.push_pending("s1", "r1");
        {
            // Backdate past the staleness window.
            let mut contexts = registry.contexts.lock();
            contexts.get_mut("s1").unwrap().updated_at =
                OffsetDateTime::now_utc() - time::Duration::hours(2);
        }
        assert_eq!(registry.sweep_stale(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sweep_removes_stale_idle_contexts() {
        let registry = ContextRegistry::new();
        registry.ensure("s1");
        {
            let mut contexts = registry.contexts.lock();
            contexts.get_mut("s1").unwrap().updated_at =
                OffsetDateTime::now_utc() - time::Duration::hours(2);
        }
        assert_eq!(registry.sweep_stale(), 1);
        assert!(registry.is_empty());
    }
}
