//! Request authentication.
//!
//! Bearer tokens resolve to user identities through the presence store's
//! token map. Ownership of a session is checked before any state mutation;
//! a wrong-user request never starts a turn.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::{AgentError, AgentResult};
use crate::server::state::AppState;
use crate::session::{PresenceStore, SessionDescriptor};

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
}

impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = AgentError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AgentError::Unauthenticated)?;

        let session = state
            .sessions
            .presence()
            .get_token(token)
            .await
            .map_err(AgentError::from)?
            .ok_or(AgentError::Unauthenticated)?;

        Ok(AuthedUser {
            user_id: session.user_id,
        })
    }
}

/// Resolve a session and verify the caller owns it.
pub async fn authorize_session(
    state: &AppState,
    user: &AuthedUser,
    session_id: &str,
) -> AgentResult<SessionDescriptor> {
    let descriptor = state
        .sessions
        .get(session_id)
        .await
        .map_err(AgentError::from)?
        .ok_or_else(|| AgentError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
    if descriptor.user_id != user.user_id {
        return Err(AgentError::WrongUser {
            session_id: session_id.to_string(),
        });
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::test_utils::ScriptedProviderFactory;
    use std::sync::Arc;

    fn state() -> AppState {
        let history = Arc::new(crate::session::SqliteHistoryStore::in_memory().unwrap());
        let presence = Arc::new(crate::session::MemoryPresenceStore::new(
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(3600),
        ));
        AppState::assemble(
            Settings::default(),
            history,
            presence,
            Arc::new(ScriptedProviderFactory::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn wrong_user_is_rejected_before_any_mutation() {
        let state = state();
        let descriptor = state.sessions.create("alice", None).await.unwrap();

        let mallory = AuthedUser {
            user_id: "mallory".to_string(),
        };
        let err = authorize_session(&state, &mallory, &descriptor.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::WrongUser { .. }));
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn owner_is_authorized() {
        let state = state();
        let descriptor = state.sessions.create("alice", None).await.unwrap();
        let alice = AuthedUser {
            user_id: "alice".to_string(),
        };
        let resolved = authorize_session(&state, &alice, &descriptor.session_id)
            .await
            .unwrap();
        assert_eq!(resolved.session_id, descriptor.session_id);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = state();
        let alice = AuthedUser {
            user_id: "alice".to_string(),
        };
        let err = authorize_session(&state, &alice, "ghost").await.unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound { .. }));
    }
}
