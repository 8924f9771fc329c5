//! Streaming chat endpoint.
//!
//! One NDJSON object per line: `start`, coalesced `content` fragments, tool
//! lifecycle events, then `end` (or a terminal `error`). The handler
//! subscribes to the session's stream before spawning the turn so no event
//! can be missed, and the response body is fed straight from the bounded
//! subscriber queue.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::Response;
use serde::Deserialize;

use crate::agent::instance::Attachment;
use crate::error::{AgentError, AgentResult};
use crate::events::{ContentPhase, SessionEventKind};
use crate::server::auth::{AuthedUser, authorize_session};
use crate::server::state::AppState;
use crate::stream::EventSubscriber;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default = "default_enable_tools")]
    pub enable_tools: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_enable_tools() -> bool {
    true
}

pub async fn chat(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<ChatRequest>,
) -> AgentResult<Response> {
    if request.message.trim().is_empty() {
        return Err(AgentError::InvalidRequest {
            reason: "message must be non-empty".into(),
        });
    }

    let descriptor = authorize_session(&state, &user, &request.session_id).await?;
    let profile = state.profile_for(request.provider.as_deref(), request.model.as_deref())?;
    let instance = state.agents.acquire(&descriptor, profile)?;

    // Subscribe before the turn starts so the `start` event is observed.
    let subscriber = state.coordinator.subscribe(&descriptor.session_id);

    tokio::spawn(async move {
        let _ = instance
            .run_turn(&request.message, &request.attachments, request.enable_tools)
            .await;
    });

    let body = Body::from_stream(ndjson_stream(subscriber));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| AgentError::Internal(e.to_string()))
}

/// Coalesces content fragments until they reach a minimum size or hit a
/// sentence boundary, so the wire does not carry one event per token.
#[derive(Default)]
pub struct ContentCoalescer {
    buffer: String,
    phase: Option<ContentPhase>,
}

/// Flush once the buffer reaches this many characters.
const FLUSH_CHARS: usize = 5;

const SENTENCE_DELIMITERS: &[char] = &['.', '!', '?', '\n', '。', '！', '？'];

impl ContentCoalescer {
    /// Add a fragment; returns any content events ready for the wire.
    pub fn push(&mut self, content: &str, phase: ContentPhase) -> Vec<SessionEventKind> {
        let mut out = Vec::new();
        if let Some(buffered) = self.phase
            && buffered != phase
            && let Some(flushed) = self.flush()
        {
            out.push(flushed);
        }

        self.phase = Some(phase);
        self.buffer.push_str(content);

        if self.buffer.chars().count() >= FLUSH_CHARS
            || self.buffer.contains(SENTENCE_DELIMITERS)
        {
            if let Some(flushed) = self.flush() {
                out.push(flushed);
            }
        }
        out
    }

    /// Drain whatever is buffered.
    pub fn flush(&mut self) -> Option<SessionEventKind> {
        if self.buffer.is_empty() {
            return None;
        }
        let content = std::mem::take(&mut self.buffer);
        let phase = self.phase.take().unwrap_or(ContentPhase::Default);
        Some(SessionEventKind::Content { content, phase })
    }
}

fn line(kind: &SessionEventKind) -> String {
    let mut json = serde_json::to_string(kind).unwrap_or_else(|_| "{}".to_string());
    json.push('\n');
    json
}

/// Serialize a session's events as NDJSON lines, coalescing content and
/// terminating after `end` or a terminal `error`.
fn ndjson_stream(
    subscriber: EventSubscriber,
) -> impl futures_util::Stream<Item = Result<String, std::convert::Infallible>> {
    struct StreamState {
        subscriber: EventSubscriber,
        coalescer: ContentCoalescer,
        queued: std::collections::VecDeque<String>,
        done: bool,
    }

    let state = StreamState {
        subscriber,
        coalescer: ContentCoalescer::default(),
        queued: std::collections::VecDeque::new(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(next) = state.queued.pop_front() {
                return Some((Ok(next), state));
            }
            if state.done {
                return None;
            }
            match state.subscriber.next().await {
                Some(event) => match event.kind {
                    SessionEventKind::Content { content, phase } => {
                        for flushed in state.coalescer.push(&content, phase) {
                            state.queued.push_back(line(&flushed));
                        }
                    }
                    kind => {
                        // Any non-content event flushes buffered text first
                        // so ordering is preserved on the wire.
                        if let Some(flushed) = state.coalescer.flush() {
                            state.queued.push_back(line(&flushed));
                        }
                        if kind.is_terminal() {
                            state.done = true;
                        }
                        state.queued.push_back(line(&kind));
                    }
                },
                None => {
                    if let Some(flushed) = state.coalescer.flush() {
                        state.queued.push_back(line(&flushed));
                    }
                    state.done = true;
                }
            }
        }
    })
}
