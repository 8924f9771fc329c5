//! Shared fixtures for unit and scenario tests.

pub mod mocks;

pub use mocks::MockHistoryStore;

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley::LLMParams;
use parley::chat::{
    ChatMessage, ChatProvider, ChatResponse, ChatStream, FinishReason, StreamChunk, Tool,
};
use parley::error::LLMError;
use parley::providers::ProviderFactory;

use crate::agent::context::ContextRegistry;
use crate::agent::instance::{AgentProfile, TurnDeps};
use crate::agent::manager::AgentManager;
use crate::classify::ContentClassifier;
use crate::config::{AgentManagerSettings, PermissionSettings, SessionSettings, Settings};
use crate::error::AgentResult;
use crate::permission::PermissionCoordinator;
use crate::session::{MemoryPresenceStore, SessionManager, SqliteHistoryStore};
use crate::stream::StreamCoordinator;
use crate::tools::{RiskLevel, ToolRuntime, ToolServerRegistry, ToolServerSpec, ToolTransport};

// ============================================================================
// ScriptedProvider
// ============================================================================

/// Shared script state: each entry is one provider round's chunk sequence.
#[derive(Default)]
pub struct ProviderScript {
    rounds: Mutex<VecDeque<Vec<StreamChunk>>>,
    /// Every message sequence the provider was called with.
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
    /// Tool catalogs observed per call (None = tools disabled).
    pub catalogs: Mutex<Vec<Option<Vec<String>>>>,
    vision: std::sync::atomic::AtomicBool,
    fail_stream_next: std::sync::atomic::AtomicBool,
}

impl ProviderScript {
    pub fn push_round(&self, chunks: Vec<StreamChunk>) {
        self.rounds.lock().push_back(chunks);
    }

    pub fn set_vision(&self, vision: bool) {
        self.vision.store(vision, std::sync::atomic::Ordering::Relaxed);
    }

    /// Make the next `chat_stream_with_tools` call fail, forcing the
    /// chunk-mode fallback.
    pub fn fail_next_stream(&self) {
        self.fail_stream_next
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    fn next_round(&self) -> Vec<StreamChunk> {
        self.rounds.lock().pop_front().unwrap_or_else(|| {
            vec![
                StreamChunk::Text("OK".to_string()),
                StreamChunk::Done {
                    stop_reason: "stop".to_string(),
                },
            ]
        })
    }

    fn record(&self, messages: &[ChatMessage], tools: Option<&[Tool]>) {
        self.prompts.lock().push(messages.to_vec());
        self.catalogs.lock().push(
            tools.map(|t| t.iter().map(|tool| tool.function.name.clone()).collect()),
        );
    }
}

struct ScriptedProvider {
    script: Arc<ProviderScript>,
}

#[derive(Debug)]
struct ScriptedResponse {
    text: String,
    calls: Vec<parley::ToolCall>,
}

impl ChatResponse for ScriptedResponse {
    fn text(&self) -> Option<String> {
        if self.text.is_empty() {
            None
        } else {
            Some(self.text.clone())
        }
    }

    fn tool_calls(&self) -> Option<Vec<parley::ToolCall>> {
        if self.calls.is_empty() {
            None
        } else {
            Some(self.calls.clone())
        }
    }

    fn finish_reason(&self) -> Option<FinishReason> {
        Some(if self.calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        })
    }

    fn usage(&self) -> Option<parley::Usage> {
        None
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_vision(&self) -> bool {
        self.script.vision.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Box<dyn ChatResponse>, LLMError> {
        self.script.record(messages, tools);
        let mut text = String::new();
        let mut calls = Vec::new();
        for chunk in self.script.next_round() {
            match chunk {
                StreamChunk::Text(t) => text.push_str(&t),
                StreamChunk::ToolCallComplete { tool_call, .. } => calls.push(tool_call),
                _ => {}
            }
        }
        Ok(Box::new(ScriptedResponse { text, calls }))
    }

    async fn chat_stream_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<ChatStream, LLMError> {
        if self
            .script
            .fail_stream_next
            .swap(false, std::sync::atomic::Ordering::Relaxed)
        {
            return Err(LLMError::ProviderError("scripted stream failure".into()));
        }
        self.script.record(messages, tools);
        let chunks = self.script.next_round();
        Ok(Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(Ok::<_, LLMError>),
        )))
    }
}

/// Provider factory returning scripted providers that share one script.
pub struct ScriptedProviderFactory {
    pub script: Arc<ProviderScript>,
}

impl ScriptedProviderFactory {
    pub fn new() -> Self {
        Self {
            script: Arc::new(ProviderScript::default()),
        }
    }
}

impl Default for ScriptedProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderFactory for ScriptedProviderFactory {
    fn build(
        &self,
        _params: &LLMParams,
    ) -> Result<Arc<dyn ChatProvider>, LLMError> {
        Ok(Arc::new(ScriptedProvider {
            script: Arc::clone(&self.script),
        }))
    }
}

// ============================================================================
// ScriptedToolTransport
// ============================================================================

/// Records calls and answers from a programmable result table.
pub struct ScriptedToolTransport {
    results: Mutex<HashMap<String, AgentResult<Value>>>,
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedToolTransport {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_result(&self, tool: &str, result: AgentResult<Value>) {
        self.results.lock().insert(tool.to_string(), result);
    }

    pub fn recorded_calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

impl Default for ScriptedToolTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for ScriptedToolTransport {
    async fn call_tool(&self, tool: &str, args: Value) -> AgentResult<Value> {
        self.calls.lock().push((tool.to_string(), args));
        match self.results.lock().get(tool) {
            Some(Ok(v)) => Ok(v.clone()),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(serde_json::json!({
                "content": [{"type": "text", "text": format!("{} ran", tool)}]
            })),
        }
    }
}

// ============================================================================
// TestHarness
// ============================================================================

/// Fully wired runtime over in-memory stores, a scripted provider, and one
/// preconnected tool server `srv` with tools `time` (low), `write_file`
/// (medium) and `deploy` (high).
pub struct TestHarness {
    pub settings: Settings,
    pub history: Arc<SqliteHistoryStore>,
    pub presence: Arc<MemoryPresenceStore>,
    pub sessions: Arc<SessionManager>,
    pub coordinator: Arc<StreamCoordinator>,
    pub contexts: Arc<ContextRegistry>,
    pub permissions: Arc<PermissionCoordinator>,
    pub registry: Arc<ToolServerRegistry>,
    pub tool_runtime: Arc<ToolRuntime>,
    pub deps: Arc<TurnDeps>,
    pub provider_factory: Arc<ScriptedProviderFactory>,
    pub transport: Arc<ScriptedToolTransport>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_permission_timeout(1).await
    }

    pub async fn with_permission_timeout(timeout_secs: u64) -> Self {
        let settings = Settings {
            permission: PermissionSettings {
                default_timeout_seconds: timeout_secs,
                ..Default::default()
            },
            ..Default::default()
        };

        let history = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let presence = Arc::new(MemoryPresenceStore::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        let sessions = Arc::new(SessionManager::new(
            history.clone(),
            presence.clone(),
            SessionSettings::default(),
        ));
        let coordinator = Arc::new(StreamCoordinator::new(
            settings.stream.subscriber_queue_size,
        ));
        let contexts = Arc::new(ContextRegistry::new());
        let permissions = Arc::new(PermissionCoordinator::new(settings.permission.clone()));
        let registry = Arc::new(ToolServerRegistry::new(RiskLevel::Medium));
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

        let transport = Arc::new(ScriptedToolTransport::new());
        let mut spec = ToolServerSpec {
            id: "srv".to_string(),
            command: Some("scripted".to_string()),
            args: vec![],
            env: HashMap::new(),
            url: None,
            auth_token: None,
            risk_overrides: HashMap::new(),
        };
        spec.risk_overrides.insert("time".into(), RiskLevel::Low);
        spec.risk_overrides.insert("deploy".into(), RiskLevel::High);
        registry
            .register_preconnected(
                spec,
                vec![
                    (
                        "time".into(),
                        "current time".into(),
                        serde_json::json!({"type": "object", "properties": {}}),
                    ),
                    (
                        "write_file".into(),
                        "write a file".into(),
                        serde_json::json!({"type": "object", "properties": {"path": {"type": "string"}}}),
                    ),
                    (
                        "deploy".into(),
                        "deploy to production".into(),
                        serde_json::json!({"type": "object", "properties": {}}),
                    ),
                ],
                transport.clone() as Arc<dyn ToolTransport>,
            )
            .unwrap();

        Self {
            settings,
            history,
            presence,
            sessions,
            coordinator,
            contexts,
            permissions,
            registry,
            tool_runtime,
            deps,
            provider_factory: Arc::new(ScriptedProviderFactory::new()),
            transport,
        }
    }

    pub fn server_id(&self) -> &'static str {
        "srv"
    }

    pub fn agent_manager(&self, settings: AgentManagerSettings) -> AgentManager {
        AgentManager::new(
            settings,
            self.provider_factory.clone(),
            self.registry.clone(),
            self.tool_runtime.clone(),
            self.deps.clone(),
        )
    }

    pub fn profile(&self) -> AgentProfile {
        AgentProfile {
            provider: "scripted".to_string(),
            model: "scripted-model".to_string(),
            params: LLMParams::new().provider("scripted").model("scripted-model"),
        }
    }

    /// Queue a scripted provider round.
    pub fn script_round(&self, chunks: Vec<StreamChunk>) {
        self.provider_factory.script.push_round(chunks);
    }

    /// Approve (or reject) the first pending request for a session as soon
    /// as it appears.
    pub fn auto_decide(&self, session_id: &str, approved: bool) -> tokio::task::JoinHandle<()> {
        let permissions = self.permissions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            for _ in 0..100 {
                if let Some(record) = permissions.pending_for(&session_id).first() {
                    permissions
                        .decide(&session_id, &record.request_id, approved)
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("no pending permission request appeared for {}", session_id);
        })
    }
}

/// Convenience: a complete tool-call announcement chunk.
pub fn tool_call_chunk(id: &str, name: &str, args: &str) -> StreamChunk {
    StreamChunk::ToolCallComplete {
        index: 0,
        tool_call: parley::ToolCall::function(id, name, args),
    }
}

/// Convenience: a text + done round.
pub fn text_round(text: &str) -> Vec<StreamChunk> {
    vec![
        StreamChunk::Text(text.to_string()),
        StreamChunk::Done {
            stop_reason: "stop".to_string(),
        },
    ]
}
