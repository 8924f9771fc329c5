//! Tool-server administration endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::AgentResult;
use crate::server::auth::AuthedUser;
use crate::session::HistoryStore;
use crate::server::state::AppState;
use crate::tools::adapter::{ToolAdapter, ToolCallContext, ToolOutcome};
use crate::tools::{ToolServerInfo, ToolServerSpec, qualified_name};

pub async fn register(
    State(state): State<AppState>,
    _user: AuthedUser,
    Json(spec): Json<ToolServerSpec>,
) -> AgentResult<Json<serde_json::Value>> {
    let server_id = spec.id.clone();
    let tools = state.registry.register(spec).await?;
    // Sessions already bound to this id (e.g. re-registration after a
    // catalog change) pick up the fresh adapters.
    let reloaded = state.agents.reload_for_server(&server_id);
    Ok(Json(serde_json::json!({
        "id": server_id,
        "tools": tools,
        "reloaded_sessions": reloaded,
    })))
}

pub async fn unregister(
    State(state): State<AppState>,
    _user: AuthedUser,
    Path(server_id): Path<String>,
) -> AgentResult<Json<serde_json::Value>> {
    state.registry.unregister(&server_id)?;
    let reloaded = state.agents.reload_for_server(&server_id);
    Ok(Json(serde_json::json!({
        "id": server_id,
        "removed": true,
        "reloaded_sessions": reloaded,
    })))
}

pub async fn list(
    State(state): State<AppState>,
    _user: AuthedUser,
) -> AgentResult<Json<Vec<ToolServerInfo>>> {
    Ok(Json(state.registry.list()))
}

#[derive(Debug, Deserialize, Default)]
pub struct ExecuteParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Direct tool invocation (admin/debug). The same permission rules apply:
/// with a session id attached, medium/high-risk calls still wait for
/// consent through the normal pending-execution path.
pub async fn execute(
    State(state): State<AppState>,
    _user: AuthedUser,
    Path((server_id, tool)): Path<(String, String)>,
    Query(params): Query<ExecuteParams>,
    Json(request): Json<ExecuteRequest>,
) -> AgentResult<Json<serde_json::Value>> {
    let qualified = qualified_name(&server_id, &tool);

    let descriptor = state
        .registry
        .descriptor(&qualified)
        .ok_or_else(|| crate::error::AgentError::UnknownTool {
            tool_name: qualified.clone(),
        })?;
    let (_, transport) = state
        .registry
        .tools_for(&[server_id.clone()])
        .into_iter()
        .find(|(d, _)| d.name == qualified)
        .ok_or_else(|| crate::error::AgentError::UnknownTool {
            tool_name: qualified.clone(),
        })?;

    let adapter = ToolAdapter::new(descriptor, transport, Arc::clone(&state.tool_runtime));
    let ctx = ToolCallContext {
        session_id: params.session_id,
    };
    let outcome = adapter.call(request.arguments, &ctx).await;

    let body = match outcome {
        ToolOutcome::Completed { shaped, raw } => serde_json::json!({
            "tool": qualified,
            "status": "completed",
            "result": raw,
            "text": shaped,
        }),
        ToolOutcome::Cancelled { reason } => serde_json::json!({
            "tool": qualified,
            "status": "cancelled",
            "reason": format!("{:?}", reason).to_lowercase(),
        }),
        ToolOutcome::Failed { error } => serde_json::json!({
            "tool": qualified,
            "status": "failed",
            "error": error,
        }),
    };
    Ok(Json(body))
}

pub async fn agent_stats(
    State(state): State<AppState>,
    _user: AuthedUser,
) -> AgentResult<Json<serde_json::Value>> {
    let history = state.sessions.history().stats().await?;
    Ok(Json(serde_json::json!({
        "agents": state.agents.stats(),
        "agent_sessions": state.agents.list_sessions(),
        "history": history,
        "dropped_events": state.coordinator.dropped_events(),
    })))
}
