use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{ToolCall, Usage, error::LLMError};
use futures::Stream;
use std::pin::Pin;

#[cfg(feature = "reqwest-client")]
pub mod openai;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// The user/human participant in the conversation
    User,
    /// The AI assistant participant in the conversation
    Assistant,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// The supported MIME type of an inline image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ImageMime {
    JPEG,
    PNG,
    GIF,
    WEBP,
}

impl ImageMime {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageMime::JPEG => "image/jpeg",
            ImageMime::PNG => "image/png",
            ImageMime::GIF => "image/gif",
            ImageMime::WEBP => "image/webp",
        }
    }

    /// Map a MIME string onto a supported image type.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" | "image/jpg" => Some(ImageMime::JPEG),
            "image/png" => Some(ImageMime::PNG),
            "image/gif" => Some(ImageMime::GIF),
            "image/webp" => Some(ImageMime::WEBP),
            _ => None,
        }
    }
}

/// The type of a message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageType {
    /// A text message
    #[default]
    Text,
    /// An inline image carried alongside the text
    Image((ImageMime, Vec<u8>)),
    /// An image referenced by URL
    ImageURL(String),
    /// A tool use announced by the assistant
    ToolUse(Vec<ToolCall>),
    /// Tool results fed back into the conversation
    ToolResult(Vec<ToolCall>),
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of who sent this message (user or assistant)
    pub role: ChatRole,
    /// The type of the message (text, image, tool use, tool result)
    pub message_type: MessageType,
    /// The text content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new builder for a user message
    pub fn user() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::User)
    }

    /// Create a new builder for an assistant message
    pub fn assistant() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::Assistant)
    }

    /// True when this message carries raw tool output.
    pub fn is_tool_result(&self) -> bool {
        matches!(self.message_type, MessageType::ToolResult(_))
    }
}

/// Builder for ChatMessage
#[derive(Debug)]
pub struct ChatMessageBuilder {
    role: ChatRole,
    message_type: MessageType,
    content: String,
}

impl ChatMessageBuilder {
    pub fn new(role: ChatRole) -> Self {
        Self {
            role,
            message_type: MessageType::default(),
            content: String::new(),
        }
    }

    /// Set the message content
    pub fn content<S: Into<String>>(mut self, content: S) -> Self {
        self.content = content.into();
        self
    }

    /// Set the message type as Image
    pub fn image(mut self, image_mime: ImageMime, raw_bytes: Vec<u8>) -> Self {
        self.message_type = MessageType::Image((image_mime, raw_bytes));
        self
    }

    /// Set the message type as ImageURL
    pub fn image_url(mut self, url: impl Into<String>) -> Self {
        self.message_type = MessageType::ImageURL(url.into());
        self
    }

    /// Set the message type as ToolUse
    pub fn tool_use(mut self, calls: Vec<ToolCall>) -> Self {
        self.message_type = MessageType::ToolUse(calls);
        self
    }

    /// Set the message type as ToolResult
    pub fn tool_result(mut self, calls: Vec<ToolCall>) -> Self {
        self.message_type = MessageType::ToolResult(calls);
        self
    }

    /// Build the ChatMessage
    pub fn build(self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            message_type: self.message_type,
            content: self.content,
        }
    }
}

/// Represents a function definition for a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionTool {
    /// The name of the function
    pub name: String,
    /// Description of what the function does
    pub description: String,
    /// The JSON schema of the parameters
    pub parameters: Value,
}

/// Represents a tool that can be used in chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// The type of tool (e.g. "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The function definition if this is a function tool
    pub function: FunctionTool,
}

impl Tool {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionTool {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Why a (non-streaming) response stopped.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Unknown,
}

/// A non-streaming chat reply.
pub trait ChatResponse: fmt::Debug + Send {
    fn text(&self) -> Option<String>;
    fn tool_calls(&self) -> Option<Vec<ToolCall>>;
    fn finish_reason(&self) -> Option<FinishReason>;
    fn usage(&self) -> Option<Usage>;
}

impl From<&dyn ChatResponse> for ChatMessage {
    fn from(response: &dyn ChatResponse) -> Self {
        let content = response.text().unwrap_or_default();
        let message_type = match response.tool_calls() {
            Some(calls) => MessageType::ToolUse(calls),
            None => MessageType::Text,
        };
        ChatMessage {
            role: ChatRole::Assistant,
            message_type,
            content,
        }
    }
}

/// One element of a streaming chat response.
///
/// Tool-call chunks partition the stream: the consumer is free to execute the
/// announced call and append its result to the conversation before the next
/// announcement is observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunk {
    /// Text content delta
    Text(String),

    /// Tool use block started (contains tool id and name)
    ToolCallStart {
        /// The index of this tool call in the response
        index: usize,
        /// The unique ID for this tool use
        id: String,
        /// The name of the tool being called
        name: String,
    },

    /// Tool use input JSON delta (partial JSON string)
    ToolCallDelta {
        /// The index of this tool call
        index: usize,
        /// Partial JSON string for the tool input
        partial_json: String,
    },

    /// Tool use block complete with assembled ToolCall
    ToolCallComplete {
        /// The index of this tool call
        index: usize,
        /// The complete tool call with id, name, and arguments
        tool_call: ToolCall,
    },

    /// Usage metadata containing token counts
    Usage(Usage),

    /// Stream ended with stop reason
    Done {
        /// The reason the stream stopped (e.g., "stop", "tool_calls")
        stop_reason: String,
    },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LLMError>> + Send>>;

/// Unified ChatProvider trait that combines all chat capabilities.
///
/// Providers implement the methods they support and rely on the default
/// implementations for the rest.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Returns true if the provider supports streaming responses.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Returns true if the provider accepts image content.
    fn supports_vision(&self) -> bool {
        false
    }

    /// Basic chat interaction without tools.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<Box<dyn ChatResponse>, LLMError> {
        self.chat_with_tools(messages, None).await
    }

    /// Chat interaction with tools.
    ///
    /// `tools` is the catalog available to the model for this call; `None`
    /// disables tools even if the provider has some configured.
    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Box<dyn ChatResponse>, LLMError>;

    /// Basic streaming chat interaction.
    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream, LLMError> {
        self.chat_stream_with_tools(messages, None).await
    }

    /// Streaming chat interaction with tools.
    ///
    /// Returns a stream of [`StreamChunk`] events: text deltas, tool-call
    /// announcements, and a final `Done` marker.
    async fn chat_stream_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<ChatStream, LLMError> {
        let _ = (messages, tools);
        Err(LLMError::NotImplemented(
            "Streaming with tools not supported by this provider".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_user_text_message() {
        let msg = ChatMessage::user().content("hello").build();
        assert_eq!(msg.role, ChatRole::User);
        assert_eq!(msg.message_type, MessageType::Text);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn builder_produces_tool_result_message() {
        let call = ToolCall::function("c1", "search", "{}");
        let msg = ChatMessage::assistant()
            .content("result text")
            .tool_result(vec![call])
            .build();
        assert!(msg.is_tool_result());
    }

    #[test]
    fn image_mime_mapping_covers_common_types() {
        assert_eq!(
            ImageMime::from_mime_type("image/png"),
            Some(ImageMime::PNG)
        );
        assert_eq!(
            ImageMime::from_mime_type("image/jpg"),
            Some(ImageMime::JPEG)
        );
        assert_eq!(ImageMime::from_mime_type("application/pdf"), None);
    }

    #[test]
    fn stream_chunk_round_trips_through_serde() {
        let chunk = StreamChunk::ToolCallComplete {
            index: 0,
            tool_call: ToolCall::function("c1", "time", "{}"),
        };
        let json = serde_json::to_string(&chunk).unwrap();
        let restored: StreamChunk = serde_json::from_str(&json).unwrap();
        match restored {
            StreamChunk::ToolCallComplete { tool_call, .. } => {
                assert_eq!(tool_call.function.name, "time");
            }
            other => panic!("unexpected chunk: {:?}", other),
        }
    }

    #[test]
    fn chat_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ChatRole::User).unwrap(), r#""user""#);
        assert_eq!(ChatRole::Assistant.to_string(), "assistant");
    }
}
