//! One agent instance per session.
//!
//! An instance binds one chat provider to a tool set and a thread-scoped
//! memory key, and runs one conversational turn at a time: replay budgeted
//! history, drive the provider's stream, dispatch tool calls through their
//! adapters, and persist the finished assistant message post-hoc.

use futures_util::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use parley::chat::{ChatMessage, ChatProvider, ImageMime, StreamChunk, Tool};
use parley::{LLMParams, model};

use crate::agent::context::{ContextRegistry, ExecutionState};
use crate::classify::ContentClassifier;
use crate::config::LlmSettings;
use crate::error::AgentResult;
use crate::events::SessionEventKind;
use crate::session::{HistoryStore, MessageRecord, MessageRole, PresenceStore, SessionManager};
use crate::stream::StreamCoordinator;
use crate::tools::{ToolAdapter, ToolCallContext};

/// Safety cap on LLM↔tool rounds within one turn.
const MAX_TOOL_ROUNDS: usize = 25;

/// Marker appended when a replayed message is cut to fit the budget.
const TRUNCATION_MARKER: &str = "... [truncated]";

/// The LLM binding an instance was created with. Any difference forces
/// recreation; the binding is never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub provider: String,
    pub model: String,
    pub params: LLMParams,
}

/// An inbound attachment (base64 payload or URL).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Long-lived collaborators shared by all instances.
pub struct TurnDeps {
    pub sessions: Arc<SessionManager>,
    pub coordinator: Arc<StreamCoordinator>,
    pub contexts: Arc<ContextRegistry>,
    pub classifier: ContentClassifier,
    pub llm: LlmSettings,
}

pub struct AgentInstance {
    session_id: String,
    thread_id: String,
    profile: AgentProfile,
    provider: Arc<dyn ChatProvider>,
    tools: RwLock<HashMap<String, Arc<ToolAdapter>>>,
    deps: Arc<TurnDeps>,
}

impl AgentInstance {
    pub fn new(
        session_id: &str,
        thread_id: &str,
        profile: AgentProfile,
        provider: Arc<dyn ChatProvider>,
        adapters: Vec<Arc<ToolAdapter>>,
        deps: Arc<TurnDeps>,
    ) -> Self {
        let instance = Self {
            session_id: session_id.to_string(),
            thread_id: thread_id.to_string(),
            profile,
            provider,
            tools: RwLock::new(HashMap::new()),
            deps,
        };
        instance.set_tools(adapters);
        instance
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The memory key this instance is bound to. Equal to the session's
    /// thread id and stable across tool-set changes.
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Replace the bound tool set. The instance itself (and therefore the
    /// memory binding) is untouched.
    pub fn set_tools(&self, adapters: Vec<Arc<ToolAdapter>>) {
        let mut tools = self.tools.write();
        tools.clear();
        for adapter in adapters {
            tools.insert(adapter.name().to_string(), adapter);
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn chat_tools(&self) -> Vec<Tool> {
        self.tools.read().values().map(|a| a.chat_tool()).collect()
    }

    /// Run one conversational turn. Emits `start`, content and tool events,
    /// then `end` (or a terminal `error`) on the session stream, and returns
    /// the full assistant text.
    #[tracing::instrument(skip(self, user_text, attachments), fields(session_id = %self.session_id))]
    pub async fn run_turn(
        &self,
        user_text: &str,
        attachments: &[Attachment],
        enable_tools: bool,
    ) -> AgentResult<String> {
        let session_id = self.session_id.clone();
        self.deps.coordinator.publish(
            &session_id,
            SessionEventKind::Start {
                session_id: session_id.clone(),
            },
        );
        self.deps.contexts.update_state(
            &session_id,
            ExecutionState::Running,
            Some("processing chat"),
            None,
        );

        let result = self
            .run_turn_inner(user_text, attachments, enable_tools)
            .await;

        match &result {
            Ok(_) => {
                self.deps.contexts.update_state(
                    &session_id,
                    ExecutionState::Completed,
                    Some("turn completed"),
                    None,
                );
                self.deps.coordinator.publish(
                    &session_id,
                    SessionEventKind::End {
                        session_id: session_id.clone(),
                    },
                );
            }
            Err(e) => {
                self.deps.contexts.update_state(
                    &session_id,
                    ExecutionState::Error,
                    Some("turn failed"),
                    Some(&e.to_string()),
                );
                self.deps.coordinator.publish(
                    &session_id,
                    SessionEventKind::Error {
                        code: e.code().to_string(),
                        content: e.to_string(),
                    },
                );
            }
        }
        result
    }

    async fn run_turn_inner(
        &self,
        user_text: &str,
        attachments: &[Attachment],
        enable_tools: bool,
    ) -> AgentResult<String> {
        let session_id = &self.session_id;
        let history = self.deps.sessions.history();

        // Replay budgeted history before the new message lands in the store.
        let replayed = history
            .recent_messages(session_id, self.deps.llm.history_messages_max)
            .await?;
        let window = model::context_window(&self.profile.model);
        let budget =
            (window as f64 * self.deps.llm.context_budget_fraction).floor() as usize;
        let mut messages = assemble_prompt(&replayed, budget);
        messages.push(self.user_message(user_text, attachments));

        // Persist the user message; a history failure here fails the turn.
        let user_record = MessageRecord::new(session_id, MessageRole::User, user_text);
        history.save_message(&user_record).await?;
        if let Err(e) = self
            .deps
            .sessions
            .presence()
            .push_cached_message(&user_record)
            .await
        {
            log::warn!("presence message cache write failed: {}", e);
        }

        let tools = if enable_tools {
            let catalog = self.chat_tools();
            if catalog.is_empty() { None } else { Some(catalog) }
        } else {
            None
        };

        let mut assistant_text = String::new();
        for round in 0..MAX_TOOL_ROUNDS {
            let (round_text, calls) = self
                .drive_provider(&messages, tools.as_deref())
                .await?;

            if !round_text.is_empty() {
                if !assistant_text.is_empty() {
                    assistant_text.push('\n');
                }
                assistant_text.push_str(&round_text);
            }

            if calls.is_empty() {
                break;
            }
            if round + 1 == MAX_TOOL_ROUNDS {
                log::warn!(
                    "session {}: tool round limit reached, closing turn",
                    session_id
                );
                break;
            }

            messages.push(
                ChatMessage::assistant()
                    .content(round_text)
                    .tool_use(calls.clone())
                    .build(),
            );
            for call in calls {
                let text = self.dispatch_tool(&call).await;
                messages.push(
                    ChatMessage::user()
                        .content(text)
                        .tool_result(vec![call])
                        .build(),
                );
            }
        }

        // Single assistant record, written post-hoc.
        let mut assistant_record =
            MessageRecord::new(session_id, MessageRole::Assistant, assistant_text.clone());
        assistant_record.metadata = serde_json::json!({
            "provider": self.profile.provider,
            "model": self.profile.model,
        });
        history.save_message(&assistant_record).await?;
        if let Err(e) = self
            .deps
            .sessions
            .presence()
            .push_cached_message(&assistant_record)
            .await
        {
            log::warn!("presence message cache write failed: {}", e);
        }
        self.deps.sessions.touch(session_id).await?;

        Ok(assistant_text)
    }

    fn user_message(&self, text: &str, attachments: &[Attachment]) -> ChatMessage {
        let image = attachments.iter().find_map(|a| {
            let mime = ImageMime::from_mime_type(&a.mime_type)?;
            Some((mime, a))
        });

        match image {
            Some((mime, attachment)) if self.provider.supports_vision() => {
                if let Some(data) = &attachment.data {
                    use base64::Engine;
                    match base64::engine::general_purpose::STANDARD.decode(data) {
                        Ok(bytes) => {
                            return ChatMessage::user().content(text).image(mime, bytes).build();
                        }
                        Err(e) => log::warn!("dropping undecodable image attachment: {}", e),
                    }
                } else if let Some(url) = &attachment.url {
                    return ChatMessage::user().content(text).image_url(url).build();
                }
                ChatMessage::user().content(text).build()
            }
            Some(_) => {
                log::warn!(
                    "session {}: model '{}' is not multimodal, dropping {} attachment(s)",
                    self.session_id,
                    self.profile.model,
                    attachments.len()
                );
                ChatMessage::user().content(text).build()
            }
            None => {
                if !attachments.is_empty() {
                    log::warn!(
                        "session {}: unsupported attachment types, dropping {}",
                        self.session_id,
                        attachments.len()
                    );
                }
                ChatMessage::user().content(text).build()
            }
        }
    }

    /// One provider round: stream when supported (falling back to chunk
    /// mode mid-stream), otherwise a single chat call.
    async fn drive_provider(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> AgentResult<(String, Vec<parley::ToolCall>)> {
        if self.provider.supports_streaming() {
            match self.stream_round(messages, tools).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    log::warn!(
                        "session {}: streaming failed ({}), falling back to chunk mode",
                        self.session_id,
                        e
                    );
                }
            }
        }
        self.chunk_round(messages, tools).await
    }

    async fn stream_round(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> AgentResult<(String, Vec<parley::ToolCall>)> {
        let mut stream = self
            .provider
            .chat_stream_with_tools(messages, tools)
            .await?;

        let mut text = String::new();
        let mut calls = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Text(fragment) => {
                    let phase = self.deps.classifier.classify(&fragment, false);
                    self.deps.coordinator.publish(
                        &self.session_id,
                        SessionEventKind::Content {
                            content: fragment.clone(),
                            phase,
                        },
                    );
                    text.push_str(&fragment);
                }
                StreamChunk::ToolCallComplete { tool_call, .. } => {
                    calls.push(tool_call);
                }
                StreamChunk::Done { .. } => break,
                // Start/delta chunks and usage are bookkeeping only.
                _ => {}
            }
        }
        Ok((text, calls))
    }

    async fn chunk_round(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> AgentResult<(String, Vec<parley::ToolCall>)> {
        let response = self.provider.chat_with_tools(messages, tools).await?;
        let calls = response.tool_calls().unwrap_or_default();
        let text = response.text().unwrap_or_default();
        if !text.is_empty() {
            let phase = self.deps.classifier.classify(&text, !calls.is_empty());
            self.deps.coordinator.publish(
                &self.session_id,
                SessionEventKind::Content {
                    content: text.clone(),
                    phase,
                },
            );
        }
        Ok((text, calls))
    }

    async fn dispatch_tool(&self, call: &parley::ToolCall) -> String {
        let name = &call.function.name;
        let adapter = self.tools.read().get(name).cloned();
        let Some(adapter) = adapter else {
            log::warn!(
                "session {}: model requested unknown tool '{}'",
                self.session_id,
                name
            );
            self.deps.coordinator.publish(
                &self.session_id,
                SessionEventKind::ToolExecutionStatus {
                    request_id: uuid::Uuid::new_v4().to_string(),
                    tool_name: name.clone(),
                    status: crate::events::ToolExecutionStatus::Failed,
                    result: None,
                    error: Some("tool not available".to_string()),
                },
            );
            return format!(
                "Tool '{}' is not available in this session. Answer without it.",
                name
            );
        };

        let ctx = ToolCallContext::for_session(&self.session_id);
        let outcome = adapter.call(call.parsed_arguments(), &ctx).await;
        outcome.llm_text(name)
    }
}

/// Assemble replayed history under a token budget: newest messages first,
/// stop at the first message that would overflow; a single over-budget
/// message is truncated with a visible tail marker. Returns chronological
/// order.
pub fn assemble_prompt(history: &[MessageRecord], budget_tokens: usize) -> Vec<ChatMessage> {
    let mut selected: Vec<ChatMessage> = Vec::new();
    let mut spent = 0usize;

    for (position, record) in history.iter().rev().enumerate() {
        let message = record_to_chat(record);
        let cost = model::estimate_message_tokens(&message);

        if spent + cost <= budget_tokens {
            spent += cost;
            selected.push(message);
            continue;
        }

        // The newest message alone blowing the budget gets truncated
        // instead of dropped; anything older is simply excluded.
        if position == 0 && !record.content.is_empty() {
            let keep_tokens = budget_tokens.saturating_sub(8);
            let keep_chars = keep_tokens.saturating_mul(4);
            if keep_chars > 0 {
                let head: String = record.content.chars().take(keep_chars).collect();
                let truncated = format!("{}{}", head, TRUNCATION_MARKER);
                selected.push(match record.role {
                    MessageRole::User => ChatMessage::user().content(truncated).build(),
                    MessageRole::Assistant => {
                        ChatMessage::assistant().content(truncated).build()
                    }
                });
            }
        }
        break;
    }

    selected.reverse();
    selected
}

fn record_to_chat(record: &MessageRecord) -> ChatMessage {
    match record.role {
        MessageRole::User => ChatMessage::user().content(record.content.clone()).build(),
        MessageRole::Assistant => ChatMessage::assistant()
            .content(record.content.clone())
            .build(),
    }
}
