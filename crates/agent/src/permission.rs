//! Consent state machine for tool executions.
//!
//! A medium/high-risk tool call parks here as a [`PendingToolExecution`]
//! until the user's decision arrives out-of-band or the deadline passes.
//! Each request carries a single-shot resume signal; the first decision
//! wins, repeats observe the terminal state. A periodic sweep forces
//! `expired` on overdue requests so no waiter outlives its deadline by more
//! than one sweep interval.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::config::PermissionSettings;
use crate::error::{AgentError, AgentResult};
use crate::tools::RiskLevel;

/// Terminal-or-pending status of one consent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Approved => "approved",
            PendingStatus::Rejected => "rejected",
            PendingStatus::Expired => "expired",
            PendingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PendingStatus::Pending)
    }
}

/// What a parked tool call resumes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

/// A suspended tool call awaiting user consent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingToolExecution {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    /// Sanitized display snapshot; never reused as call arguments.
    pub parameters: serde_json::Value,
    pub risk_level: RiskLevel,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
    pub status: PendingStatus,
}

struct PendingEntry {
    record: PendingToolExecution,
    resume: Option<oneshot::Sender<PermissionOutcome>>,
}

/// How long resolved records stay visible for idempotent repeat decisions.
const RESOLVED_RETENTION: Duration = Duration::from_secs(600);

pub struct PermissionCoordinator {
    settings: PermissionSettings,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl PermissionCoordinator {
    pub fn new(settings: PermissionSettings) -> Self {
        Self {
            settings,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PermissionSettings {
        &self.settings
    }

    /// Park a new consent request. Returns the record (for event emission)
    /// and the single-shot resume signal the caller awaits.
    pub fn begin(
        &self,
        session_id: &str,
        tool_name: &str,
        parameters: serde_json::Value,
        risk_level: RiskLevel,
        timeout: Option<u64>,
    ) -> (PendingToolExecution, oneshot::Receiver<PermissionOutcome>) {
        let timeout = self.settings.effective_timeout(timeout);
        let now = OffsetDateTime::now_utc();
        let record = PendingToolExecution {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            parameters,
            risk_level,
            created_at: now,
            deadline: now + timeout,
            status: PendingStatus::Pending,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            record.request_id.clone(),
            PendingEntry {
                record: record.clone(),
                resume: Some(tx),
            },
        );
        log::info!(
            "permission requested: session={} tool={} request={} risk={:?}",
            session_id,
            tool_name,
            record.request_id,
            risk_level
        );
        (record, rx)
    }

    /// Apply a user decision. The first decision wins; a repeat yields
    /// `PermissionResolved` (HTTP 410). The decision must address the same
    /// session the request was created under.
    pub fn decide(
        &self,
        session_id: &str,
        request_id: &str,
        approved: bool,
    ) -> AgentResult<PendingStatus> {
        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(request_id)
            .ok_or_else(|| AgentError::PermissionNotFound {
                request_id: request_id.to_string(),
            })?;

        if entry.record.session_id != session_id {
            return Err(AgentError::WrongUser {
                session_id: session_id.to_string(),
            });
        }
        if entry.record.status.is_terminal() {
            return Err(AgentError::PermissionResolved {
                request_id: request_id.to_string(),
                status: entry.record.status.as_str().to_string(),
            });
        }

        let (status, outcome) = if approved {
            (PendingStatus::Approved, PermissionOutcome::Approved)
        } else {
            (PendingStatus::Rejected, PermissionOutcome::Rejected)
        };
        entry.record.status = status;
        if let Some(tx) = entry.resume.take() {
            let _ = tx.send(outcome);
        }
        log::info!(
            "permission decision: request={} -> {}",
            request_id,
            status.as_str()
        );
        Ok(status)
    }

    /// Force-expire a single request (used by the waiter when its own
    /// deadline elapses before the sweep notices).
    pub fn expire(&self, request_id: &str) {
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(request_id)
            && entry.record.status == PendingStatus::Pending
        {
            entry.record.status = PendingStatus::Expired;
            if let Some(tx) = entry.resume.take() {
                let _ = tx.send(PermissionOutcome::Expired);
            }
        }
    }

    /// Expire every overdue pending request, returning the records that
    /// flipped so the caller can emit cancellation events. Also prunes
    /// resolved records past the retention window.
    pub fn sweep_expired(&self) -> Vec<PendingToolExecution> {
        let now = OffsetDateTime::now_utc();
        let mut flipped = Vec::new();
        let mut pending = self.pending.lock();

        for entry in pending.values_mut() {
            if entry.record.status == PendingStatus::Pending && now > entry.record.deadline {
                entry.record.status = PendingStatus::Expired;
                if let Some(tx) = entry.resume.take() {
                    let _ = tx.send(PermissionOutcome::Expired);
                }
                flipped.push(entry.record.clone());
            }
        }

        let retention = time::Duration::try_from(RESOLVED_RETENTION).unwrap_or(time::Duration::minutes(10));
        pending.retain(|_, entry| {
            entry.record.status == PendingStatus::Pending
                || now - entry.record.created_at < retention
        });

        if !flipped.is_empty() {
            log::info!("expired {} overdue permission requests", flipped.len());
        }
        flipped
    }

    /// Cancel everything pending for a session (external chat cancellation
    /// or session teardown). Returns the cancelled records.
    pub fn cancel_session(&self, session_id: &str) -> Vec<PendingToolExecution> {
        let mut cancelled = Vec::new();
        let mut pending = self.pending.lock();
        for entry in pending.values_mut() {
            if entry.record.session_id == session_id
                && entry.record.status == PendingStatus::Pending
            {
                entry.record.status = PendingStatus::Cancelled;
                if let Some(tx) = entry.resume.take() {
                    let _ = tx.send(PermissionOutcome::Cancelled);
                }
                cancelled.push(entry.record.clone());
            }
        }
        cancelled
    }

    /// Still-pending requests for a session, oldest first.
    pub fn pending_for(&self, session_id: &str) -> Vec<PendingToolExecution> {
        let pending = self.pending.lock();
        let mut list: Vec<_> = pending
            .values()
            .filter(|e| {
                e.record.session_id == session_id && e.record.status == PendingStatus::Pending
            })
            .map(|e| e.record.clone())
            .collect();
        list.sort_by_key(|r| r.created_at);
        list
    }

    /// Current status of a request id, if still retained.
    pub fn status_of(&self, request_id: &str) -> Option<PendingStatus> {
        self.pending
            .lock()
            .get(request_id)
            .map(|e| e.record.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> PermissionCoordinator {
        PermissionCoordinator::new(PermissionSettings::default())
    }

    fn begin(
        c: &PermissionCoordinator,
        session: &str,
    ) -> (PendingToolExecution, oneshot::Receiver<PermissionOutcome>) {
        c.begin(
            session,
            "srv::write_file",
            serde_json::json!({"path": "/tmp/x"}),
            RiskLevel::Medium,
            None,
        )
    }

    // ── Decisions ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn approve_resumes_waiter_with_approved() {
        let c = coordinator();
        let (record, rx) = begin(&c, "s1");

        let status = c.decide("s1", &record.request_id, true).unwrap();
        assert_eq!(status, PendingStatus::Approved);
        assert_eq!(rx.await.unwrap(), PermissionOutcome::Approved);
    }

    #[tokio::test]
    async fn reject_resumes_waiter_with_rejected() {
        let c = coordinator();
        let (record, rx) = begin(&c, "s1");

        c.decide("s1", &record.request_id, false).unwrap();
        assert_eq!(rx.await.unwrap(), PermissionOutcome::Rejected);
        assert_eq!(c.status_of(&record.request_id), Some(PendingStatus::Rejected));
    }

    #[tokio::test]
    async fn second_decision_observes_terminal_state() {
        let c = coordinator();
        let (record, _rx) = begin(&c, "s1");

        c.decide("s1", &record.request_id, true).unwrap();
        let err = c.decide("s1", &record.request_id, false).unwrap_err();
        assert!(matches!(
            err,
            AgentError::PermissionResolved { ref status, .. } if status == "approved"
        ));
        assert_eq!(err.http_status(), 410);
    }

    #[tokio::test]
    async fn decision_for_wrong_session_is_rejected() {
        let c = coordinator();
        let (record, _rx) = begin(&c, "s1");

        let err = c.decide("s2", &record.request_id, true).unwrap_err();
        assert!(matches!(err, AgentError::WrongUser { .. }));
        // The request stays pending; the right session can still decide.
        assert_eq!(c.status_of(&record.request_id), Some(PendingStatus::Pending));
    }

    #[tokio::test]
    async fn unknown_request_id_is_not_found() {
        let c = coordinator();
        let err = c.decide("s1", "ghost", true).unwrap_err();
        assert!(matches!(err, AgentError::PermissionNotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_decisions_exactly_one_wins() {
        let c = std::sync::Arc::new(coordinator());
        let (record, _rx) = begin(&c, "s1");

        let mut handles = Vec::new();
        for approved in [true, false] {
            let c = c.clone();
            let id = record.request_id.clone();
            handles.push(tokio::spawn(async move { c.decide("s1", &id, approved) }));
        }
        let results: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(AgentError::PermissionResolved { .. })
        )));
    }

    // ── Expiry ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn expire_resumes_waiter_with_expired() {
        let c = coordinator();
        let (record, rx) = begin(&c, "s1");

        c.expire(&record.request_id);
        assert_eq!(rx.await.unwrap(), PermissionOutcome::Expired);
        assert_eq!(c.status_of(&record.request_id), Some(PendingStatus::Expired));
    }

    #[tokio::test]
    async fn expire_after_decision_is_a_no_op() {
        let c = coordinator();
        let (record, _rx) = begin(&c, "s1");
        c.decide("s1", &record.request_id, true).unwrap();
        c.expire(&record.request_id);
        assert_eq!(c.status_of(&record.request_id), Some(PendingStatus::Approved));
    }

    #[tokio::test]
    async fn sweep_flips_only_overdue_requests() {
        let mut settings = PermissionSettings::default();
        settings.max_timeout_seconds = 300;
        let c = PermissionCoordinator::new(settings);

        // One request that is already overdue, one with a long deadline.
        let (overdue, rx) = c.begin("s1", "srv::a", serde_json::json!({}), RiskLevel::High, Some(1));
        {
            let mut pending = c.pending.lock();
            pending.get_mut(&overdue.request_id).unwrap().record.deadline =
                OffsetDateTime::now_utc() - time::Duration::seconds(5);
        }
        let (fresh, _rx2) = c.begin("s1", "srv::b", serde_json::json!({}), RiskLevel::Medium, Some(120));

        let flipped = c.sweep_expired();
        assert_eq!(flipped.len(), 1);
        assert_eq!(flipped[0].request_id, overdue.request_id);
        assert_eq!(rx.await.unwrap(), PermissionOutcome::Expired);
        assert_eq!(c.status_of(&fresh.request_id), Some(PendingStatus::Pending));
    }

    // ── Session-scoped operations ──────────────────────────────────────────

    #[tokio::test]
    async fn pending_for_lists_only_this_sessions_pending() {
        let c = coordinator();
        let (a, _rxa) = begin(&c, "s1");
        let (_b, _rxb) = begin(&c, "s2");
        let (done, _rxc) = begin(&c, "s1");
        c.decide("s1", &done.request_id, true).unwrap();

        let listed = c.pending_for("s1");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_id, a.request_id);
    }

    #[tokio::test]
    async fn cancel_session_unblocks_all_waiters() {
        let c = coordinator();
        let (_a, rxa) = begin(&c, "s1");
        let (_b, rxb) = begin(&c, "s1");
        let (other, _rxo) = begin(&c, "s2");

        let cancelled = c.cancel_session("s1");
        assert_eq!(cancelled.len(), 2);
        assert_eq!(rxa.await.unwrap(), PermissionOutcome::Cancelled);
        assert_eq!(rxb.await.unwrap(), PermissionOutcome::Cancelled);
        assert_eq!(c.status_of(&other.request_id), Some(PendingStatus::Pending));
    }

    #[tokio::test]
    async fn timeout_is_clamped_to_configured_maximum() {
        let c = coordinator();
        let (record, _rx) = c.begin("s1", "t", serde_json::json!({}), RiskLevel::High, Some(100_000));
        let wait = record.deadline - record.created_at;
        assert!(wait <= time::Duration::seconds(300));
    }
}
