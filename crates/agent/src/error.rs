//! Structured error type for the agent runtime.
//!
//! Every variant carries typed context and maps to a stable machine-readable
//! wire code (`category/sub_code`) plus an HTTP status via [`AgentError::code`]
//! and [`AgentError::http_status`]. Handlers serialize errors as
//! `{"code": "...", "message": "..."}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error type for the agent runtime.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AgentError {
    // --- Input ---
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    // --- Auth / permission ---
    #[error("missing or invalid authentication token")]
    Unauthenticated,

    #[error("session {session_id} does not belong to the caller")]
    WrongUser { session_id: String },

    // --- Tool layer ---
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("tool server not found: {server_id}")]
    ToolServerNotFound { server_id: String },

    #[error("tool server '{server_id}' rejected: {reason}")]
    ToolServerInvalid { server_id: String, reason: String },

    #[error("tool server '{server_id}' connection failed: {reason}")]
    ToolServerConnect { server_id: String, reason: String },

    #[error("tool '{tool_name}' execution failed: {reason}")]
    ToolExecution { tool_name: String, reason: String },

    // --- Permission state machine ---
    #[error("permission request not found: {request_id}")]
    PermissionNotFound { request_id: String },

    #[error("permission request {request_id} already resolved as {status}")]
    PermissionResolved { request_id: String, status: String },

    // --- Provider / LLM ---
    #[error("provider error: {0}")]
    Provider(String),

    // --- Storage ---
    #[error("history store failure: {0}")]
    Storage(String),

    // --- Serialization ---
    #[error("serialization error: {0}")]
    Serialization(String),

    // --- Generic internal ---
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable machine-readable code: `category/sub_code`.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidRequest { .. } => "input/invalid_request",
            AgentError::SessionNotFound { .. } => "input/session_not_found",
            AgentError::Unauthenticated => "auth/missing_token",
            AgentError::WrongUser { .. } => "auth/wrong_user",
            AgentError::UnknownTool { .. } => "tool/unknown_tool",
            AgentError::ToolServerNotFound { .. } => "tool/server_not_found",
            AgentError::ToolServerInvalid { .. } => "tool/server_invalid",
            AgentError::ToolServerConnect { .. } => "tool/server_connect",
            AgentError::ToolExecution { .. } => "tool/execution_failed",
            AgentError::PermissionNotFound { .. } => "permission/not_found",
            AgentError::PermissionResolved { .. } => "permission/already_resolved",
            AgentError::Provider(_) => "llm/provider_failure",
            AgentError::Storage(_) => "storage/history_failure",
            AgentError::Serialization(_) => "internal/serialization",
            AgentError::Internal(_) => "internal/error",
        }
    }

    /// HTTP status used when the error surfaces on a non-streaming endpoint.
    pub fn http_status(&self) -> u16 {
        match self {
            AgentError::InvalidRequest { .. } => 400,
            AgentError::Unauthenticated => 401,
            AgentError::WrongUser { .. } => 403,
            AgentError::SessionNotFound { .. }
            | AgentError::UnknownTool { .. }
            | AgentError::ToolServerNotFound { .. }
            | AgentError::PermissionNotFound { .. } => 404,
            AgentError::ToolServerInvalid { .. } => 400,
            AgentError::PermissionResolved { .. } => 410,
            AgentError::ToolServerConnect { .. } => 502,
            AgentError::Provider(_) => 502,
            _ => 500,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<parley::LLMError> for AgentError {
    fn from(e: parley::LLMError) -> Self {
        AgentError::Provider(e.to_string())
    }
}

impl From<crate::session::error::SessionError> for AgentError {
    fn from(e: crate::session::error::SessionError) -> Self {
        use crate::session::error::SessionError;
        match e {
            SessionError::SessionNotFound(id) => AgentError::SessionNotFound { session_id: id },
            SessionError::Storage(msg) => AgentError::Storage(msg),
            other => AgentError::Internal(other.to_string()),
        }
    }
}
