//! Uniform chat surface over heterogeneous LLM providers.
//!
//! The crate exposes the message model ([`chat::ChatMessage`]), the streaming
//! chunk protocol ([`chat::StreamChunk`]), and the [`chat::ChatProvider`]
//! trait that the agent runtime drives. Providers are constructed from
//! serializable [`LLMParams`] through the [`providers::ProviderRegistry`];
//! switching provider or model is a cheap recreation, never an in-place
//! mutation.

pub mod chat;
pub mod error;
pub mod model;
pub mod params;
pub mod providers;

use serde::{Deserialize, Serialize};

pub use error::LLMError;
pub use params::LLMParams;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id for this call, echoed back with the result.
    pub id: String,
    /// The type of the call (currently always "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function being called.
    pub function: FunctionCall,
}

/// The function payload of a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function to invoke.
    pub name: String,
    /// Arguments as a JSON-encoded string.
    pub arguments: String,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse the JSON arguments, falling back to an empty object on malformed input.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        serde_json::from_str(&self.function.arguments)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_parses_valid_arguments() {
        let call = ToolCall::function("call-1", "lookup", r#"{"query":"rust"}"#);
        assert_eq!(call.parsed_arguments()["query"], "rust");
    }

    #[test]
    fn tool_call_malformed_arguments_fall_back_to_empty_object() {
        let call = ToolCall::function("call-2", "lookup", "{ not json");
        assert!(call.parsed_arguments().as_object().unwrap().is_empty());
    }

    #[test]
    fn usage_total_sums_both_directions() {
        let usage = Usage {
            input_tokens: 120,
            output_tokens: 30,
        };
        assert_eq!(usage.total(), 150);
    }
}
