//! Per-tool invocation wrapper.
//!
//! The adapter presents one `call` to the agent loop and owns the whole
//! per-call protocol: session resolution, risk gating through the
//! permission coordinator, lifecycle event emission, and result shaping.
//! The outcome is a three-armed result consumed explicitly by the caller;
//! user cancellation is not an error.

use serde_json::Value;
use std::sync::Arc;

use crate::agent::context::ContextRegistry;
use crate::events::{SessionEventKind, ToolExecutionStatus};
use crate::permission::{PermissionCoordinator, PermissionOutcome};
use crate::stream::StreamCoordinator;
use crate::tools::display::sanitize_parameters;
use crate::tools::shape::shape_for_llm;
use crate::tools::{RiskLevel, ToolDescriptor, ToolTransport};

/// Why a call was cancelled instead of executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Rejected,
    Timeout,
    Cancelled,
}

impl CancelReason {
    fn as_error_str(&self) -> Option<&'static str> {
        match self {
            CancelReason::Rejected => None,
            CancelReason::Timeout => Some("timeout"),
            CancelReason::Cancelled => Some("cancelled"),
        }
    }
}

/// Tagged result of one tool call.
#[derive(Debug)]
pub enum ToolOutcome {
    /// The tool ran; `shaped` is the LLM-facing text, `raw` the structured
    /// payload for event emission.
    Completed { shaped: String, raw: Value },
    /// Consent was denied, timed out, or the session was cancelled.
    Cancelled { reason: CancelReason },
    /// The remote tool or its transport failed.
    Failed { error: String },
}

impl ToolOutcome {
    /// The message fed back to the LLM so the conversation can continue.
    pub fn llm_text(&self, tool_name: &str) -> String {
        match self {
            ToolOutcome::Completed { shaped, .. } => shaped.clone(),
            ToolOutcome::Cancelled { .. } => cancellation_marker(tool_name),
            ToolOutcome::Failed { error } => {
                format!("Tool '{}' failed: {}", tool_name, error)
            }
        }
    }
}

/// Marker returned to the LLM for denied or timed-out calls. Identical for
/// both so the model handles them uniformly.
pub fn cancellation_marker(tool_name: &str) -> String {
    format!(
        "Tool '{}' was not executed because the user declined or the permission request timed out. Continue without its output.",
        tool_name
    )
}

/// Shared handles every adapter call needs.
pub struct ToolRuntime {
    pub coordinator: Arc<StreamCoordinator>,
    pub permissions: Arc<PermissionCoordinator>,
    pub contexts: Arc<ContextRegistry>,
}

/// Session context travelling with a tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolCallContext {
    pub session_id: Option<String>,
}

impl ToolCallContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
        }
    }
}

/// Uniform "call this tool" surface bound to one remote tool.
pub struct ToolAdapter {
    descriptor: ToolDescriptor,
    transport: Arc<dyn ToolTransport>,
    runtime: Arc<ToolRuntime>,
}

impl ToolAdapter {
    pub fn new(
        descriptor: ToolDescriptor,
        transport: Arc<dyn ToolTransport>,
        runtime: Arc<ToolRuntime>,
    ) -> Self {
        Self {
            descriptor,
            transport,
            runtime,
        }
    }

    /// Fully-qualified tool name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    pub fn server_id(&self) -> &str {
        &self.descriptor.server_id
    }

    pub fn risk(&self) -> RiskLevel {
        self.descriptor.risk
    }

    pub fn chat_tool(&self) -> parley::chat::Tool {
        self.descriptor.to_chat_tool()
    }

    /// Resolve the session this call belongs to. Falls back to scanning
    /// the execution contexts for the sole running session. Inherently a
    /// last resort, so it is logged loudly.
    fn resolve_session(&self, ctx: &ToolCallContext) -> Option<String> {
        if let Some(session_id) = &ctx.session_id {
            return Some(session_id.clone());
        }
        match self.runtime.contexts.sole_running_session() {
            Some(session_id) => {
                log::info!(
                    "tool '{}': recovered session {} from execution contexts",
                    self.descriptor.name,
                    session_id
                );
                Some(session_id)
            }
            None => None,
        }
    }

    /// Execute the per-call protocol.
    pub async fn call(&self, args: Value, ctx: &ToolCallContext) -> ToolOutcome {
        let name = self.descriptor.name.clone();
        let session_id = self.resolve_session(ctx);

        let Some(session_id) = session_id else {
            // No session to gate on: proceed ungated, but leave a trace.
            log::warn!(
                "tool '{}' called without a session id; executing without consent gating",
                name
            );
            let request_id = uuid::Uuid::new_v4().to_string();
            return self.execute(None, &request_id, args).await;
        };

        if !self.descriptor.risk.requires_consent() {
            let request_id = uuid::Uuid::new_v4().to_string();
            return self.execute(Some(&session_id), &request_id, args).await;
        }

        // Consent-gated path.
        let display = sanitize_parameters(&args);
        let (record, resume) = self.runtime.permissions.begin(
            &session_id,
            &name,
            display.clone(),
            self.descriptor.risk,
            None,
        );
        let request_id = record.request_id.clone();
        self.runtime.contexts.push_pending(&session_id, &request_id);

        self.runtime.coordinator.publish(
            &session_id,
            SessionEventKind::ToolPermissionRequest {
                request_id: request_id.clone(),
                tool_name: name.clone(),
                parameters: display,
                risk_level: self.descriptor.risk,
            },
        );
        self.publish_status(&session_id, &request_id, ToolExecutionStatus::Waiting, None, None);

        let wait = record.deadline - record.created_at;
        let wait = std::time::Duration::try_from(wait).unwrap_or_default();
        let outcome = match tokio::time::timeout(wait, resume).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped (coordinator pruned the entry): treat as cancelled.
            Ok(Err(_)) => PermissionOutcome::Cancelled,
            Err(_) => {
                self.runtime.permissions.expire(&request_id);
                PermissionOutcome::Expired
            }
        };
        self.runtime
            .contexts
            .resolve_pending(&session_id, &request_id);

        match outcome {
            PermissionOutcome::Approved => {
                self.execute(Some(&session_id), &request_id, args).await
            }
            PermissionOutcome::Rejected => {
                self.cancel(&session_id, &request_id, CancelReason::Rejected)
            }
            PermissionOutcome::Expired => {
                self.cancel(&session_id, &request_id, CancelReason::Timeout)
            }
            PermissionOutcome::Cancelled => {
                self.cancel(&session_id, &request_id, CancelReason::Cancelled)
            }
        }
    }

    fn cancel(&self, session_id: &str, request_id: &str, reason: CancelReason) -> ToolOutcome {
        self.publish_status(
            session_id,
            request_id,
            ToolExecutionStatus::Cancelled,
            None,
            reason.as_error_str().map(str::to_string),
        );
        log::info!(
            "tool '{}' cancelled ({:?}) for session {}",
            self.descriptor.name,
            reason,
            session_id
        );
        ToolOutcome::Cancelled { reason }
    }

    async fn execute(
        &self,
        session_id: Option<&str>,
        request_id: &str,
        args: Value,
    ) -> ToolOutcome {
        if let Some(session_id) = session_id {
            self.publish_status(
                session_id,
                request_id,
                ToolExecutionStatus::Executing,
                None,
                None,
            );
        }

        match self
            .transport
            .call_tool(&self.descriptor.tool, args)
            .await
        {
            Ok(raw) => {
                let is_error = raw
                    .get("is_error")
                    .or_else(|| raw.get("isError"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if is_error {
                    let error = shape_for_llm(&raw);
                    if let Some(session_id) = session_id {
                        self.publish_status(
                            session_id,
                            request_id,
                            ToolExecutionStatus::Failed,
                            None,
                            Some(error.clone()),
                        );
                    }
                    return ToolOutcome::Failed { error };
                }

                let shaped = shape_for_llm(&raw);
                if let Some(session_id) = session_id {
                    self.publish_status(
                        session_id,
                        request_id,
                        ToolExecutionStatus::Completed,
                        Some(raw.clone()),
                        None,
                    );
                }
                ToolOutcome::Completed { shaped, raw }
            }
            Err(e) => {
                let error = e.to_string();
                if let Some(session_id) = session_id {
                    self.publish_status(
                        session_id,
                        request_id,
                        ToolExecutionStatus::Failed,
                        None,
                        Some(error.clone()),
                    );
                }
                ToolOutcome::Failed { error }
            }
        }
    }

    fn publish_status(
        &self,
        session_id: &str,
        request_id: &str,
        status: ToolExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        self.runtime.coordinator.publish(
            session_id,
            SessionEventKind::ToolExecutionStatus {
                request_id: request_id.to_string(),
                tool_name: self.descriptor.name.clone(),
                status,
                result,
                error,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::ExecutionState;
    use crate::config::PermissionSettings;
    use crate::error::{AgentError, AgentResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct ScriptedTransport {
        result: AgentResult<Value>,
    }

    #[async_trait]
    impl ToolTransport for ScriptedTransport {
        async fn call_tool(&self, _tool: &str, _args: Value) -> AgentResult<Value> {
            match &self.result {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(e.clone()),
            }
        }
    }

    fn runtime() -> Arc<ToolRuntime> {
        Arc::new(ToolRuntime {
            coordinator: Arc::new(StreamCoordinator::new(100)),
            permissions: Arc::new(PermissionCoordinator::new(PermissionSettings {
                default_timeout_seconds: 1,
                max_timeout_seconds: 300,
                sweep_interval_seconds: 30,
            })),
            contexts: Arc::new(ContextRegistry::new()),
        })
    }

    fn adapter(risk: RiskLevel, runtime: Arc<ToolRuntime>, result: AgentResult<Value>) -> ToolAdapter {
        ToolAdapter::new(
            ToolDescriptor {
                name: "srv::probe".into(),
                tool: "probe".into(),
                server_id: "srv".into(),
                description: "probe".into(),
                input_schema: json!({"type": "object"}),
                risk,
            },
            Arc::new(ScriptedTransport { result }),
            runtime,
        )
    }

    fn statuses(events: &[crate::events::SessionEvent]) -> Vec<ToolExecutionStatus> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                SessionEventKind::ToolExecutionStatus { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    // ── Low risk ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn low_risk_executes_without_pending_execution() {
        let rt = runtime();
        let mut sub = rt.coordinator.subscribe("s1");
        let adapter = adapter(
            RiskLevel::Low,
            rt.clone(),
            Ok(json!({"content": [{"type": "text", "text": "14:00"}]})),
        );

        let outcome = adapter
            .call(json!({}), &ToolCallContext::for_session("s1"))
            .await;
        match outcome {
            ToolOutcome::Completed { shaped, .. } => assert_eq!(shaped, "14:00"),
            other => panic!("unexpected outcome {:?}", other),
        }

        // No permission events; executing then completed.
        let mut events = Vec::new();
        while let Some(e) = sub.try_next() {
            events.push(e);
        }
        assert!(
            !events
                .iter()
                .any(|e| matches!(e.kind, SessionEventKind::ToolPermissionRequest { .. }))
        );
        assert_eq!(
            statuses(&events),
            vec![ToolExecutionStatus::Executing, ToolExecutionStatus::Completed]
        );
        assert!(rt.permissions.pending_for("s1").is_empty());
    }

    // ── Consent path ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn medium_risk_waits_then_executes_on_approval() {
        let rt = runtime();
        let mut sub = rt.coordinator.subscribe("s1");
        rt.contexts.update_state("s1", ExecutionState::Running, None, None);
        let adapter = adapter(
            RiskLevel::Medium,
            rt.clone(),
            Ok(json!({"content": [{"type": "text", "text": "written"}]})),
        );

        let rt2 = rt.clone();
        let approver = tokio::spawn(async move {
            // Wait for the pending request to appear, then approve it.
            for _ in 0..50 {
                let pending = rt2.permissions.pending_for("s1");
                if let Some(record) = pending.first() {
                    rt2.permissions
                        .decide("s1", &record.request_id, true)
                        .unwrap();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("permission request never appeared");
        });

        let outcome = adapter
            .call(json!({"path": "/tmp/x"}), &ToolCallContext::for_session("s1"))
            .await;
        approver.await.unwrap();

        assert!(matches!(outcome, ToolOutcome::Completed { .. }));

        let mut events = Vec::new();
        while let Some(e) = sub.try_next() {
            events.push(e);
        }
        assert!(
            events
                .iter()
                .any(|e| matches!(e.kind, SessionEventKind::ToolPermissionRequest { .. }))
        );
        assert_eq!(
            statuses(&events),
            vec![
                ToolExecutionStatus::Waiting,
                ToolExecutionStatus::Executing,
                ToolExecutionStatus::Completed,
            ]
        );
        // Context returned to running once the pending list drained.
        assert_eq!(
            rt.contexts.get("s1").unwrap().state,
            ExecutionState::Running
        );
    }

    #[tokio::test]
    async fn rejection_returns_cancellation_marker() {
        let rt = runtime();
        let mut sub = rt.coordinator.subscribe("s1");
        let adapter = adapter(RiskLevel::High, rt.clone(), Ok(json!({})));

        let rt2 = rt.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                if let Some(record) = rt2.permissions.pending_for("s1").first() {
                    rt2.permissions
                        .decide("s1", &record.request_id, false)
                        .unwrap();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        let outcome = adapter
            .call(json!({}), &ToolCallContext::for_session("s1"))
            .await;
        match &outcome {
            ToolOutcome::Cancelled { reason } => assert_eq!(*reason, CancelReason::Rejected),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(outcome.llm_text("srv::probe").contains("was not executed"));

        let mut events = Vec::new();
        while let Some(e) = sub.try_next() {
            events.push(e);
        }
        assert_eq!(
            statuses(&events),
            vec![ToolExecutionStatus::Waiting, ToolExecutionStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn timeout_expires_the_pending_execution() {
        let rt = runtime();
        let mut sub = rt.coordinator.subscribe("s1");
        let adapter = adapter(RiskLevel::Medium, rt.clone(), Ok(json!({})));

        // Nobody decides; the 1-second default timeout fires.
        let outcome = adapter
            .call(json!({}), &ToolCallContext::for_session("s1"))
            .await;
        assert!(matches!(
            outcome,
            ToolOutcome::Cancelled {
                reason: CancelReason::Timeout
            }
        ));

        let mut events = Vec::new();
        while let Some(e) = sub.try_next() {
            events.push(e);
        }
        let cancelled = events.iter().find_map(|e| match &e.kind {
            SessionEventKind::ToolExecutionStatus {
                status: ToolExecutionStatus::Cancelled,
                error,
                request_id,
                ..
            } => Some((error.clone(), request_id.clone())),
            _ => None,
        });
        let (error, request_id) = cancelled.expect("cancelled event");
        assert_eq!(error.as_deref(), Some("timeout"));
        assert_eq!(
            rt.permissions.status_of(&request_id),
            Some(crate::permission::PendingStatus::Expired)
        );
    }

    // ── Failure path ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn transport_failure_emits_failed_status() {
        let rt = runtime();
        let mut sub = rt.coordinator.subscribe("s1");
        let adapter = adapter(
            RiskLevel::Low,
            rt.clone(),
            Err(AgentError::ToolExecution {
                tool_name: "srv::probe".into(),
                reason: "connection reset".into(),
            }),
        );

        let outcome = adapter
            .call(json!({}), &ToolCallContext::for_session("s1"))
            .await;
        match &outcome {
            ToolOutcome::Failed { error } => assert!(error.contains("connection reset")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(outcome.llm_text("srv::probe").starts_with("Tool 'srv::probe' failed"));

        let mut events = Vec::new();
        while let Some(e) = sub.try_next() {
            events.push(e);
        }
        assert_eq!(
            statuses(&events),
            vec![ToolExecutionStatus::Executing, ToolExecutionStatus::Failed]
        );
    }

    #[tokio::test]
    async fn mcp_error_flag_counts_as_failure() {
        let rt = runtime();
        let adapter = adapter(
            RiskLevel::Low,
            rt.clone(),
            Ok(json!({"content": [{"type": "text", "text": "boom"}], "is_error": true})),
        );
        let outcome = adapter
            .call(json!({}), &ToolCallContext::for_session("s1"))
            .await;
        assert!(matches!(outcome, ToolOutcome::Failed { .. }));
    }

    // ── Session resolution ─────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_session_executes_ungated() {
        let rt = runtime();
        let adapter = adapter(
            RiskLevel::High,
            rt.clone(),
            Ok(json!({"content": [{"type": "text", "text": "ran"}]})),
        );

        // High risk, but no session id anywhere: proceeds without consent.
        let outcome = adapter.call(json!({}), &ToolCallContext::default()).await;
        assert!(matches!(outcome, ToolOutcome::Completed { .. }));
        assert!(rt.permissions.pending_for("s1").is_empty());
    }

    #[tokio::test]
    async fn fallback_recovers_sole_running_session() {
        let rt = runtime();
        rt.contexts.update_state("solo", ExecutionState::Running, None, None);
        let adapter = adapter(RiskLevel::Medium, rt.clone(), Ok(json!({})));

        let rt2 = rt.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                if let Some(record) = rt2.permissions.pending_for("solo").first() {
                    rt2.permissions
                        .decide("solo", &record.request_id, true)
                        .unwrap();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        let outcome = adapter.call(json!({}), &ToolCallContext::default()).await;
        assert!(matches!(outcome, ToolOutcome::Completed { .. }));
    }
}
