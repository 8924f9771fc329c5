//! HTTP surface of the runtime.
//!
//! # Module structure
//!
//! - [`state`]: composition root ([`AppState`]) and error → response mapping
//! - [`auth`]: bearer-token extraction and session-ownership checks
//! - [`chat`]: the streaming chat endpoint (NDJSON)
//! - [`sessions`]: session lifecycle, history, search, tool-set management
//! - [`permissions`]: permission decisions and pending listings
//! - [`tools`]: tool-server administration and direct execution
//! - [`sse`]: the per-session server-push channel

pub mod auth;
pub mod chat;
pub mod permissions;
pub mod sessions;
pub mod sse;
pub mod tools;

mod state;

pub use state::AppState;

use axum::Router;
use axum::routing::{delete, get, post, put};
use tower_http::cors::CorsLayer;

/// Assemble the full route table over an [`AppState`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat::chat))
        .route("/sessions", post(sessions::create).get(sessions::list))
        .route("/sessions/search", get(sessions::search))
        .route("/sessions/{session_id}", delete(sessions::delete))
        .route("/sessions/{session_id}/history", get(sessions::history))
        .route(
            "/sessions/{session_id}/context",
            axum::routing::patch(sessions::update_context),
        )
        .route("/sessions/{session_id}/status", get(sessions::status))
        .route(
            "/sessions/{session_id}/permissions",
            get(permissions::pending),
        )
        .route(
            "/sessions/{session_id}/permissions/{request_id}",
            post(permissions::decide),
        )
        .route("/sessions/{session_id}/events", get(sse::events))
        .route(
            "/sessions/{session_id}/tool-servers",
            put(sessions::set_tool_servers),
        )
        .route(
            "/sessions/{session_id}/tool-servers/{server_id}",
            post(sessions::add_tool_server).delete(sessions::remove_tool_server),
        )
        .route("/tool-servers", post(tools::register).get(tools::list))
        .route("/tool-servers/{server_id}", delete(tools::unregister))
        .route(
            "/tool-servers/{server_id}/tools/{tool}/execute",
            post(tools::execute),
        )
        .route("/agents/stats", get(tools::agent_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The runtime's HTTP server.
pub struct AgentServer {
    state: AppState,
}

impl AgentServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let _background = self.state.start_background_tasks();
        let app = router(self.state);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("parley agent listening on http://{}", addr);
        axum::serve(listener, app).await?;
        Ok(())
    }
}
