//! Permission decision endpoint.
//!
//! Resolves a pending tool execution by `(session_id, request_id)`. The
//! first decision wins; repeats observe 410 Gone through the error mapping.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use crate::error::AgentResult;
use crate::server::auth::{AuthedUser, authorize_session};
use crate::server::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn decide(
    State(state): State<AppState>,
    user: AuthedUser,
    Path((session_id, request_id)): Path<(String, String)>,
    Json(request): Json<DecisionRequest>,
) -> AgentResult<Json<serde_json::Value>> {
    authorize_session(&state, &user, &session_id).await?;

    let status = state
        .permissions
        .decide(&session_id, &request_id, request.approved)?;
    if let Some(reason) = &request.reason {
        log::info!(
            "permission decision for {} carried reason: {}",
            request_id,
            reason
        );
    }

    Ok(Json(serde_json::json!({
        "request_id": request_id,
        "status": status,
    })))
}

pub async fn pending(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
) -> AgentResult<Json<serde_json::Value>> {
    authorize_session(&state, &user, &session_id).await?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "pending": state.permissions.pending_for(&session_id),
    })))
}
