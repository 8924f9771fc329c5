//! Per-session event model.
//!
//! [`SessionEventKind`] is the wire format: a tagged JSON object with a
//! `type` field, serialized one-per-line on the chat response and as SSE
//! `data:` payloads on the push channel. [`SessionEvent`] wraps a kind with
//! the per-session sequence number and timestamp used by subscribers to
//! assert FIFO delivery.

use serde::{Deserialize, Serialize};

use crate::tools::RiskLevel;

/// Assistant-content classification. Advisory: it may change how a
/// subscriber prefixes a fragment but never suppresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentPhase {
    Thinking,
    Response,
    Default,
}

/// Lifecycle states of a single tool execution as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStatus {
    Waiting,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    Start {
        session_id: String,
    },
    Content {
        content: String,
        phase: ContentPhase,
    },
    ToolPermissionRequest {
        request_id: String,
        tool_name: String,
        parameters: serde_json::Value,
        risk_level: RiskLevel,
    },
    ToolExecutionStatus {
        request_id: String,
        tool_name: String,
        status: ToolExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        code: String,
        content: String,
    },
    Heartbeat {
        timestamp: i64,
    },
    End {
        session_id: String,
    },
}

impl SessionEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEventKind::End { .. } | SessionEventKind::Error { .. })
    }
}

/// An event as observed on a session's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Per-session sequence number, strictly increasing in emission order.
    pub seq: u64,
    pub timestamp: i64,
    pub session_id: String,
    pub kind: SessionEventKind,
}
