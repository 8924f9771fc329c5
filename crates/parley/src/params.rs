//! LLM configuration parameters.
//!
//! A serializable configuration struct containing only LLM parameters,
//! without operational concerns like tool registries or stores. A provider
//! binding is a pure function of these params; recreating one is cheap.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Pure configuration parameters for LLM providers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LLMParams {
    /// Selected backend provider (e.g., "openai", "ollama", "deepseek")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model identifier/name to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// API key for authentication with the provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL for API requests (primarily for self-hosted instances)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// System prompt parts to guide model behavior.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<String>,

    /// Maximum tokens to generate in responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Temperature parameter for controlling response randomness
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Whether streaming responses are requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,

    /// Whether the model accepts image content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision: Option<bool>,

    /// Custom provider-specific parameters
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub custom: Option<HashMap<String, Value>>,
}

impl LLMParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Appends a system prompt part. May be called multiple times.
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system.push(system.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn vision(mut self, vision: bool) -> Self {
        self.vision = Some(vision);
        self
    }

    /// Sets a custom parameter (e.g., num_ctx for Ollama)
    pub fn parameter<K: Into<String>>(mut self, key: K, value: impl Into<Value>) -> Self {
        self.custom
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_fields() {
        let params = LLMParams::new()
            .provider("openai")
            .model("gpt-4o-mini")
            .system("part one")
            .system("part two")
            .temperature(0.3)
            .streaming(true);
        assert_eq!(params.provider.as_deref(), Some("openai"));
        assert_eq!(params.system.len(), 2);
        assert_eq!(params.streaming, Some(true));
    }

    #[test]
    fn serde_skips_unset_fields() {
        let json = serde_json::to_value(LLMParams::new().model("m")).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["model"], "m");
    }

    #[test]
    fn custom_parameters_flatten() {
        let params = LLMParams::new().parameter("num_ctx", 32768);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["num_ctx"], 32768);
    }
}
