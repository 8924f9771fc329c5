//! OpenAI-compatible chat-completions client.
//!
//! Speaks the `/chat/completions` dialect served by OpenAI, DeepSeek, Ollama,
//! vLLM and most self-hosted gateways. Streaming responses arrive as SSE
//! `data:` lines and are re-emitted as [`StreamChunk`]s; tool-call deltas are
//! assembled incrementally and completed when the stream finishes.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use url::Url;

use crate::error::LLMError;
use crate::{ToolCall, Usage};

use super::{
    ChatMessage, ChatProvider, ChatResponse, ChatRole, ChatStream, FinishReason, MessageType,
    StreamChunk, Tool,
};

fn normalize_base_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let p = url.path().to_string();
        url.set_path(&(p + "/"));
    }
    url
}

/// Client for an OpenAI-compatible chat endpoint.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    model: String,
    system: Vec<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    streaming: bool,
    vision: bool,
}

impl OpenAiCompatProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        system: Vec<String>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        streaming: bool,
        vision: bool,
    ) -> Result<Self, LLMError> {
        let base_url = normalize_base_url(Url::parse(base_url)?);
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model: model.into(),
            system,
            temperature,
            max_tokens,
            streaming,
            vision,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> Result<Url, LLMError> {
        Ok(self.base_url.join("chat/completions")?)
    }

    fn request(&self, url: Url, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    /// Build the wire-format request body. Kept separate so the translation
    /// of tool-use and tool-result messages stays testable offline.
    pub fn build_request_body(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
        stream: bool,
    ) -> Value {
        let mut wire_messages: Vec<Value> = self
            .system
            .iter()
            .map(|s| json!({"role": "system", "content": s}))
            .collect();

        for message in messages {
            wire_messages.extend(convert_message(message));
        }

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = self.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(tools) = tools
            && !tools.is_empty()
        {
            body["tools"] = serde_json::to_value(tools).unwrap_or(Value::Null);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

fn convert_message(message: &ChatMessage) -> Vec<Value> {
    match &message.message_type {
        MessageType::Text => vec![json!({
            "role": message.role.to_string(),
            "content": message.content,
        })],
        MessageType::Image((mime, bytes)) => {
            let data_url = format!("data:{};base64,{}", mime.mime_type(), BASE64.encode(bytes));
            vec![json!({
                "role": message.role.to_string(),
                "content": [
                    {"type": "text", "text": message.content},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ],
            })]
        }
        MessageType::ImageURL(url) => vec![json!({
            "role": message.role.to_string(),
            "content": [
                {"type": "text", "text": message.content},
                {"type": "image_url", "image_url": {"url": url}},
            ],
        })],
        MessageType::ToolUse(calls) => {
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            vec![json!({
                "role": "assistant",
                "content": content,
                "tool_calls": calls,
            })]
        }
        // One tool-role message per call id; the shaped result travels in
        // `content`, keyed back to the announcement by `tool_call_id`.
        MessageType::ToolResult(calls) => calls
            .iter()
            .map(|call| {
                json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": message.content,
                })
            })
            .collect(),
    }
}

// ── Non-streaming response ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Debug)]
struct OpenAiChatResponse {
    text: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl ChatResponse for OpenAiChatResponse {
    fn text(&self) -> Option<String> {
        self.text.clone()
    }

    fn tool_calls(&self) -> Option<Vec<ToolCall>> {
        self.tool_calls.clone()
    }

    fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        "tool_calls" => FinishReason::ToolCalls,
        _ => FinishReason::Unknown,
    }
}

// ── Streaming assembly ─────────────────────────────────────────────────────

/// Splits a byte stream into SSE `data:` payloads.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireStreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<WireStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct WireStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: Option<WireStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamEvent {
    choices: Option<Vec<WireStreamChoice>>,
    usage: Option<WireUsage>,
}

/// Accumulates tool-call fragments across deltas, keyed by index.
#[derive(Default)]
pub(crate) struct ToolCallAssembler {
    partial: BTreeMap<usize, PartialCall>,
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    /// Feed one SSE payload; returns the chunks it yields. `[DONE]` is
    /// handled by the caller.
    pub(crate) fn ingest(&mut self, payload: &str) -> Result<Vec<StreamChunk>, LLMError> {
        let event: WireStreamEvent =
            serde_json::from_str(payload).map_err(|e| LLMError::ResponseFormatError {
                message: e.to_string(),
                raw_response: payload.to_string(),
            })?;

        let mut chunks = Vec::new();
        if let Some(usage) = event.usage {
            chunks.push(StreamChunk::Usage(Usage {
                input_tokens: usage.prompt_tokens.unwrap_or(0),
                output_tokens: usage.completion_tokens.unwrap_or(0),
            }));
        }

        let Some(choices) = event.choices else {
            return Ok(chunks);
        };
        for choice in choices {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content
                    && !content.is_empty()
                {
                    chunks.push(StreamChunk::Text(content));
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    let entry = self.partial.entry(tc.index).or_default();
                    let mut started = false;
                    if let Some(id) = tc.id {
                        entry.id = id;
                        started = true;
                    }
                    if let Some(name) = tc.function.as_ref().and_then(|f| f.name.clone()) {
                        entry.name = name;
                        started = true;
                    }
                    if started {
                        chunks.push(StreamChunk::ToolCallStart {
                            index: tc.index,
                            id: entry.id.clone(),
                            name: entry.name.clone(),
                        });
                    }
                    if let Some(arguments) = tc.function.and_then(|f| f.arguments) {
                        entry.arguments.push_str(&arguments);
                        chunks.push(StreamChunk::ToolCallDelta {
                            index: tc.index,
                            partial_json: arguments,
                        });
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                chunks.extend(self.finish());
                chunks.push(StreamChunk::Done {
                    stop_reason: reason,
                });
            }
        }
        Ok(chunks)
    }

    /// Flush all assembled calls as `ToolCallComplete` chunks.
    pub(crate) fn finish(&mut self) -> Vec<StreamChunk> {
        std::mem::take(&mut self.partial)
            .into_iter()
            .map(|(index, partial)| {
                let arguments = if partial.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    partial.arguments
                };
                StreamChunk::ToolCallComplete {
                    index,
                    tool_call: ToolCall::function(partial.id, partial.name, arguments),
                }
            })
            .collect()
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Box<dyn ChatResponse>, LLMError> {
        let body = self.build_request_body(messages, tools, false);
        let response = self.request(self.endpoint()?, &body).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LLMError::AuthError(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LLMError::ProviderError(format!("HTTP {}: {}", status, text)));
        }

        let raw = response.text().await?;
        let wire: WireResponse =
            serde_json::from_str(&raw).map_err(|e| LLMError::ResponseFormatError {
                message: e.to_string(),
                raw_response: raw.clone(),
            })?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::ResponseFormatError {
                message: "response contained no choices".into(),
                raw_response: raw,
            })?;

        Ok(Box::new(OpenAiChatResponse {
            text: choice.message.content,
            tool_calls: choice.message.tool_calls.filter(|c| !c.is_empty()),
            finish_reason: choice.finish_reason.as_deref().map(parse_finish_reason),
            usage: wire.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens.unwrap_or(0),
                output_tokens: u.completion_tokens.unwrap_or(0),
            }),
        }))
    }

    async fn chat_stream_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<ChatStream, LLMError> {
        let body = self.build_request_body(messages, tools, true);
        let response = self.request(self.endpoint()?, &body).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LLMError::AuthError(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LLMError::ProviderError(format!("HTTP {}: {}", status, text)));
        }

        struct StreamState {
            bytes: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
            lines: SseLineBuffer,
            assembler: ToolCallAssembler,
            ready: VecDeque<StreamChunk>,
            done: bool,
        }

        let state = StreamState {
            bytes: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            lines: SseLineBuffer::default(),
            assembler: ToolCallAssembler::default(),
            ready: VecDeque::new(),
            done: false,
        };

        let stream = futures::stream::try_unfold(state, |mut state| async move {
            loop {
                if state.done {
                    return Ok(None);
                }
                if let Some(chunk) = state.ready.pop_front() {
                    if matches!(chunk, StreamChunk::Done { .. }) {
                        state.done = true;
                    }
                    return Ok(Some((chunk, state)));
                }
                match state.bytes.next().await {
                    Some(Ok(bytes)) => {
                        for payload in state.lines.push(&bytes) {
                            if payload == "[DONE]" {
                                // Providers that close without a finish_reason
                                // still owe the consumer assembled calls.
                                state.ready.extend(state.assembler.finish());
                                state.ready.push_back(StreamChunk::Done {
                                    stop_reason: "stop".to_string(),
                                });
                                continue;
                            }
                            match state.assembler.ingest(&payload) {
                                Ok(chunks) => state.ready.extend(chunks),
                                Err(e) => {
                                    log::debug!("skipping malformed stream payload: {}", e);
                                }
                            }
                        }
                    }
                    Some(Err(e)) => return Err(LLMError::HttpError(e.to_string())),
                    None => return Ok(None),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
