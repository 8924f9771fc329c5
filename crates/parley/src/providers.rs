//! Provider construction keyed by `(provider id, model id)`.
//!
//! All OpenAI-dialect backends share one implementation parameterized by
//! base URL; the registry maps provider ids onto their default endpoints
//! and resolves API keys from the environment variable named in the params'
//! custom map (`api_key_env`) or the conventional `<PROVIDER>_API_KEY`.

use std::sync::Arc;

use crate::LLMParams;
use crate::chat::ChatProvider;
use crate::error::LLMError;

#[cfg(feature = "reqwest-client")]
use crate::chat::openai::OpenAiCompatProvider;

/// Default endpoint for a known provider id.
pub fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        _ => None,
    }
}

/// Conventional API-key environment variable for a provider id.
pub fn default_api_key_env(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_ascii_uppercase())
}

/// Anything that can turn params into a live provider binding. The seam
/// lets embedders and tests substitute scripted providers.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, params: &LLMParams) -> Result<Arc<dyn ChatProvider>, LLMError>;
}

/// Builds [`ChatProvider`] instances from serializable params.
#[derive(Default)]
pub struct ProviderRegistry;

impl ProviderRegistry {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "reqwest-client")]
impl ProviderFactory for ProviderRegistry {
    /// Construct a provider for `(provider, model)`.
    ///
    /// Fails with `InvalidRequest` when the provider id is unknown and no
    /// explicit `base_url` is given.
    fn build(&self, params: &LLMParams) -> Result<Arc<dyn ChatProvider>, LLMError> {
        let provider_id = params
            .provider
            .as_deref()
            .ok_or_else(|| LLMError::InvalidRequest("provider is required".into()))?;
        let model = params
            .model
            .as_deref()
            .ok_or_else(|| LLMError::InvalidRequest("model is required".into()))?;

        let base_url = match params.base_url.as_deref() {
            Some(url) => url.to_string(),
            None => default_base_url(provider_id)
                .ok_or_else(|| {
                    LLMError::InvalidRequest(format!(
                        "unknown provider '{}' and no base_url given",
                        provider_id
                    ))
                })?
                .to_string(),
        };

        let api_key = params.api_key.clone().or_else(|| {
            let env_name = params
                .custom
                .as_ref()
                .and_then(|c| c.get("api_key_env"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| default_api_key_env(provider_id));
            std::env::var(env_name).ok()
        });

        let provider = OpenAiCompatProvider::new(
            &base_url,
            api_key,
            model,
            params.system.clone(),
            params.temperature,
            params.max_tokens,
            params.streaming.unwrap_or(true),
            params.vision.unwrap_or(false),
        )?;
        Ok(Arc::new(provider))
    }
}
