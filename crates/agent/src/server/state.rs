//! Composition root.
//!
//! Every long-lived service is constructed once here and carried into
//! request handlers through axum state. Nothing is resolved through
//! globals; handlers reach collaborators only through this struct.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use parley::LLMParams;
use parley::providers::{ProviderFactory, ProviderRegistry};

use crate::agent::context::ContextRegistry;
use crate::agent::instance::{AgentProfile, TurnDeps};
use crate::agent::manager::AgentManager;
use crate::classify::ContentClassifier;
use crate::config::Settings;
use crate::error::{AgentError, AgentResult};
use crate::events::{SessionEventKind, ToolExecutionStatus};
use crate::permission::PermissionCoordinator;
use crate::session::{
    HistoryStore, MemoryPresenceStore, PresenceStore, SessionManager, SqliteHistoryStore,
    TokenSession,
};
use crate::stream::StreamCoordinator;
use crate::tools::{ToolRuntime, ToolServerRegistry};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: Arc<SessionManager>,
    pub agents: Arc<AgentManager>,
    pub registry: Arc<ToolServerRegistry>,
    pub permissions: Arc<PermissionCoordinator>,
    pub coordinator: Arc<StreamCoordinator>,
    pub contexts: Arc<ContextRegistry>,
    pub tool_runtime: Arc<ToolRuntime>,
}

impl AppState {
    /// Wire the default deployment: SQLite history, in-memory presence,
    /// HTTP LLM providers.
    pub fn build(settings: Settings) -> AgentResult<Self> {
        let history: Arc<dyn HistoryStore> = if settings.history.db_path == ":memory:" {
            Arc::new(SqliteHistoryStore::in_memory().map_err(AgentError::from)?)
        } else {
            Arc::new(
                SqliteHistoryStore::open(&settings.history.db_path).map_err(AgentError::from)?,
            )
        };
        let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new(
            settings.session.timeout(),
            settings.history.message_cache_ttl(),
        ));
        Self::assemble(settings, history, presence, Arc::new(ProviderRegistry::new()))
    }

    /// Wire with explicit stores and provider factory (tests, embedders).
    pub fn assemble(
        settings: Settings,
        history: Arc<dyn HistoryStore>,
        presence: Arc<dyn PresenceStore>,
        providers: Arc<dyn ProviderFactory>,
    ) -> AgentResult<Self> {
        let settings = Arc::new(settings);
        let sessions = Arc::new(SessionManager::new(
            history,
            presence,
            settings.session.clone(),
        ));
        let coordinator = Arc::new(StreamCoordinator::new(
            settings.stream.subscriber_queue_size,
        ));
        let contexts = Arc::new(ContextRegistry::new());
        let permissions = Arc::new(PermissionCoordinator::new(settings.permission.clone()));
        let registry = Arc::new(ToolServerRegistry::new(settings.tools.default_risk));
        let tool_runtime = Arc::new(ToolRuntime {
            coordinator: coordinator.clone(),
            permissions: permissions.clone(),
            contexts: contexts.clone(),
        });
        let deps = Arc::new(TurnDeps {
            sessions: sessions.clone(),
            coordinator: coordinator.clone(),
            contexts: contexts.clone(),
            classifier: ContentClassifier::default(),
            llm: settings.llm.clone(),
        });
        let agents = Arc::new(AgentManager::new(
            settings.agent_manager.clone(),
            providers,
            registry.clone(),
            tool_runtime.clone(),
            deps,
        ));

        Ok(Self {
            settings,
            sessions,
            agents,
            registry,
            permissions,
            coordinator,
            contexts,
            tool_runtime,
        })
    }

    /// Resolve the LLM binding for a chat request, honoring per-request
    /// provider/model overrides over the configured defaults.
    pub fn profile_for(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> AgentResult<AgentProfile> {
        let (provider_id, block) = self.settings.provider_settings(provider);
        let model_id = model
            .map(str::to_string)
            .or_else(|| block.model.clone())
            .ok_or_else(|| AgentError::InvalidRequest {
                reason: format!("no model configured for provider '{}'", provider_id),
            })?;

        let mut params = LLMParams::new()
            .provider(provider_id.clone())
            .model(model_id.clone());
        if let Some(base_url) = &block.base_url {
            params = params.base_url(base_url.clone());
        }
        if let Some(temperature) = block.temperature {
            params = params.temperature(temperature);
        }
        if let Some(streaming) = block.streaming {
            params = params.streaming(streaming);
        }
        if let Some(vision) = block.vision {
            params = params.vision(vision);
        }
        if let Some(api_key_env) = &block.api_key_env {
            params = params.parameter("api_key_env", api_key_env.clone());
        }

        Ok(AgentProfile {
            provider: provider_id,
            model: model_id,
            params,
        })
    }

    /// Mint a bearer token for a user (bootstrap/dev path; production
    /// deployments front this with their own identity layer).
    pub async fn issue_token(&self, user_id: &str) -> AgentResult<String> {
        let token = uuid::Uuid::new_v4().to_string();
        self.sessions
            .presence()
            .put_token(&token, &TokenSession::new(user_id))
            .await
            .map_err(AgentError::from)?;
        Ok(token)
    }

    /// Spawn the periodic maintenance tasks: agent eviction and the
    /// permission-expiry sweep.
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![self.agents.spawn_sweeper()];

        let permissions = self.permissions.clone();
        let coordinator = self.coordinator.clone();
        let contexts = self.contexts.clone();
        let interval = self.settings.permission.sweep_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for record in permissions.sweep_expired() {
                    contexts.resolve_pending(&record.session_id, &record.request_id);
                    coordinator.publish(
                        &record.session_id,
                        SessionEventKind::ToolExecutionStatus {
                            request_id: record.request_id.clone(),
                            tool_name: record.tool_name.clone(),
                            status: ToolExecutionStatus::Cancelled,
                            result: None,
                            error: Some("timeout".to_string()),
                        },
                    );
                }
            }
        }));

        handles
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::Json(serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmSettings, ProviderSettings};

    fn settings_with_provider() -> Settings {
        let mut llm = LlmSettings {
            default_provider: "openai".to_string(),
            ..Default::default()
        };
        llm.providers.insert(
            "openai".to_string(),
            ProviderSettings {
                model: Some("gpt-4o-mini".to_string()),
                temperature: Some(0.2),
                api_key_env: Some("OPENAI_API_KEY".to_string()),
                ..Default::default()
            },
        );
        Settings {
            llm,
            ..Default::default()
        }
    }

    fn state() -> AppState {
        let mut settings = settings_with_provider();
        settings.history.db_path = ":memory:".to_string();
        AppState::build(settings).unwrap()
    }

    #[tokio::test]
    async fn profile_for_uses_configured_defaults() {
        let state = state();
        let profile = state.profile_for(None, None).unwrap();
        assert_eq!(profile.provider, "openai");
        assert_eq!(profile.model, "gpt-4o-mini");
        assert_eq!(profile.params.temperature, Some(0.2));
    }

    #[tokio::test]
    async fn profile_for_honors_overrides() {
        let state = state();
        let profile = state.profile_for(None, Some("gpt-4o")).unwrap();
        assert_eq!(profile.model, "gpt-4o");

        // Unconfigured provider without a model is an input error.
        let err = state.profile_for(Some("mystery"), None).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn issue_token_round_trips_through_presence() {
        let state = state();
        let token = state.issue_token("alice").await.unwrap();
        let resolved = state
            .sessions
            .presence()
            .get_token(&token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.user_id, "alice");
    }

    #[test]
    fn error_response_carries_stable_code() {
        let response = AgentError::SessionNotFound {
            session_id: "s1".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
