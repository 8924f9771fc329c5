//! Session endpoints: create, list, delete, history, search, status, and
//! per-session tool-server management.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{AgentError, AgentResult};
use crate::events::{SessionEventKind, ToolExecutionStatus};
use crate::server::auth::{AuthedUser, authorize_session};
use crate::server::state::AppState;
use crate::session::{
    EffectiveStatus, HistoryStore, MessageRecord, PresenceStore, SessionDescriptor,
};

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub window_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub window_id: String,
    pub thread_id: String,
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<CreateSessionRequest>,
) -> AgentResult<Json<CreateSessionResponse>> {
    let descriptor = state
        .sessions
        .create(&user.user_id, request.window_id.as_deref())
        .await?;
    Ok(Json(CreateSessionResponse {
        session_id: descriptor.session_id,
        window_id: descriptor.window_id,
        thread_id: descriptor.thread_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub descriptor: SessionDescriptor,
    pub effective_status: EffectiveStatus,
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthedUser,
) -> AgentResult<Json<Vec<SessionView>>> {
    let descriptors = state.sessions.list_user(&user.user_id).await?;
    let mut views = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let effective_status = state
            .sessions
            .effective_status(&descriptor.session_id)
            .await?
            .unwrap_or(EffectiveStatus::Inactive);
        views.push(SessionView {
            descriptor,
            effective_status,
        });
    }
    Ok(Json(views))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteParams {
    #[serde(default)]
    pub hard: bool,
}

pub async fn delete(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> AgentResult<Json<serde_json::Value>> {
    authorize_session(&state, &user, &session_id).await?;

    // Unblock any suspended tool calls before tearing the session down.
    for record in state.permissions.cancel_session(&session_id) {
        state.contexts.resolve_pending(&session_id, &record.request_id);
        state.coordinator.publish(
            &session_id,
            SessionEventKind::ToolExecutionStatus {
                request_id: record.request_id.clone(),
                tool_name: record.tool_name.clone(),
                status: ToolExecutionStatus::Cancelled,
                result: None,
                error: Some("cancelled".to_string()),
            },
        );
    }
    state.agents.release(&session_id);
    state.sessions.delete(&session_id, !params.hard).await?;

    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "deleted": true,
        "hard": params.hard,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn history(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> AgentResult<Json<Vec<MessageRecord>>> {
    authorize_session(&state, &user, &session_id).await?;

    // Presence cache first; the durable store answers a cold cache and
    // repopulates it for the next reader.
    let cached = state
        .sessions
        .presence()
        .cached_messages(&session_id, params.limit, params.offset)
        .await
        .unwrap_or_default();
    if !cached.is_empty() {
        return Ok(Json(cached));
    }

    let messages = state
        .sessions
        .history()
        .get_messages(&session_id, params.limit, params.offset)
        .await?;
    if params.offset == 0 && !messages.is_empty() {
        let _ = state
            .sessions
            .presence()
            .replace_cached_messages(&session_id, messages.clone())
            .await;
    }
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    20
}

pub async fn search(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(params): Query<SearchParams>,
) -> AgentResult<Json<Vec<MessageRecord>>> {
    if params.q.trim().is_empty() {
        return Err(AgentError::InvalidRequest {
            reason: "query must be non-empty".into(),
        });
    }
    let hits = state
        .sessions
        .history()
        .search_messages(&user.user_id, &params.q, params.limit)
        .await?;
    Ok(Json(hits))
}

/// Merge-patch the session's free-form context map.
pub async fn update_context(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
    Json(patch): Json<serde_json::Value>,
) -> AgentResult<Json<SessionDescriptor>> {
    authorize_session(&state, &user, &session_id).await?;
    let descriptor = state.sessions.update_context(&session_id, patch).await?;
    Ok(Json(descriptor))
}

pub async fn status(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
) -> AgentResult<Json<serde_json::Value>> {
    authorize_session(&state, &user, &session_id).await?;
    let effective = state.sessions.effective_status(&session_id).await?;
    let execution = state.contexts.get(&session_id);
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "effective_status": effective,
        "execution": execution,
        "pending_permissions": state.permissions.pending_for(&session_id),
    })))
}

// ── Per-session tool-server management ─────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SetToolServersRequest {
    pub server_ids: Vec<String>,
}

pub async fn set_tool_servers(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
    Json(request): Json<SetToolServersRequest>,
) -> AgentResult<Json<serde_json::Value>> {
    authorize_session(&state, &user, &session_id).await?;
    let server_ids: HashSet<String> = request.server_ids.into_iter().collect();
    state.agents.set_tool_servers(&session_id, server_ids)?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "server_ids": state.agents.tool_servers(&session_id)?,
    })))
}

pub async fn add_tool_server(
    State(state): State<AppState>,
    user: AuthedUser,
    Path((session_id, server_id)): Path<(String, String)>,
) -> AgentResult<Json<serde_json::Value>> {
    authorize_session(&state, &user, &session_id).await?;
    if !state.registry.contains(&server_id) {
        return Err(AgentError::ToolServerNotFound { server_id });
    }
    state.agents.add_tool_server(&session_id, &server_id)?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "server_ids": state.agents.tool_servers(&session_id)?,
    })))
}

pub async fn remove_tool_server(
    State(state): State<AppState>,
    user: AuthedUser,
    Path((session_id, server_id)): Path<(String, String)>,
) -> AgentResult<Json<serde_json::Value>> {
    authorize_session(&state, &user, &session_id).await?;
    state.agents.remove_tool_server(&session_id, &server_id)?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "server_ids": state.agents.tool_servers(&session_id)?,
    })))
}
