//! Runtime configuration.
//!
//! Loaded once from a TOML file at startup and carried inside the
//! composition root. Every section has serde defaults so a partial (or
//! empty) file yields a working deployment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{AgentError, AgentResult};
use crate::tools::RiskLevel;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub agent_manager: AgentManagerSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub permission: PermissionSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub tools: ToolsSettings,
}

impl Settings {
    pub async fn load(path: impl AsRef<Path>) -> AgentResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AgentError::InvalidRequest {
                reason: format!("cannot read config file: {}", e),
            })?;
        toml::from_str(&content).map_err(|e| AgentError::InvalidRequest {
            reason: format!("invalid config file: {}", e),
        })
    }

    /// Resolve the provider block to use, honoring per-request overrides.
    pub fn provider_settings(&self, provider: Option<&str>) -> (String, ProviderSettings) {
        let id = provider
            .map(str::to_string)
            .unwrap_or_else(|| self.llm.default_provider.clone());
        let block = self.llm.providers.get(&id).cloned().unwrap_or_default();
        (id, block)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8700".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManagerSettings {
    /// Hard cap on concurrent agent instances.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Inactivity (seconds) before an instance is evicted.
    #[serde(default = "default_instance_ttl")]
    pub instance_ttl_seconds: u64,
    /// Interval (seconds) of the background eviction sweep.
    #[serde(default = "default_manager_sweep")]
    pub sweep_interval_seconds: u64,
    /// How many instances one LRU eviction pass frees at capacity.
    #[serde(default = "default_evict_batch")]
    pub evict_batch: usize,
}

fn default_max_instances() -> usize {
    100
}
fn default_instance_ttl() -> u64 {
    3600
}
fn default_manager_sweep() -> u64 {
    300
}
fn default_evict_batch() -> usize {
    10
}

impl Default for AgentManagerSettings {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            instance_ttl_seconds: default_instance_ttl(),
            sweep_interval_seconds: default_manager_sweep(),
            evict_batch: default_evict_batch(),
        }
    }
}

impl AgentManagerSettings {
    pub fn instance_ttl(&self) -> Duration {
        Duration::from_secs(self.instance_ttl_seconds)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Presence-store TTL (seconds) for live session descriptors.
    #[serde(default = "default_session_timeout")]
    pub timeout_seconds: u64,
}

fn default_session_timeout() -> u64 {
    3600
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_session_timeout(),
        }
    }
}

impl SessionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySettings {
    /// SQLite database path; ":memory:" for ephemeral deployments.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Presence-side message cache TTL in days.
    #[serde(default = "default_message_cache_ttl_days")]
    pub message_cache_ttl_days: u64,
}

fn default_db_path() -> String {
    "parley.db".to_string()
}
fn default_message_cache_ttl_days() -> u64 {
    7
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            message_cache_ttl_days: default_message_cache_ttl_days(),
        }
    }
}

impl HistorySettings {
    pub fn message_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.message_cache_ttl_days * 24 * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSettings {
    #[serde(default = "default_permission_timeout")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_permission_max_timeout")]
    pub max_timeout_seconds: u64,
    #[serde(default = "default_permission_sweep")]
    pub sweep_interval_seconds: u64,
}

fn default_permission_timeout() -> u64 {
    30
}
fn default_permission_max_timeout() -> u64 {
    300
}
fn default_permission_sweep() -> u64 {
    30
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_permission_timeout(),
            max_timeout_seconds: default_permission_max_timeout(),
            sweep_interval_seconds: default_permission_sweep(),
        }
    }
}

impl PermissionSettings {
    /// Clamp a requested wait into `[1, max_timeout]`, defaulting when absent.
    pub fn effective_timeout(&self, requested: Option<u64>) -> Duration {
        let secs = requested
            .unwrap_or(self.default_timeout_seconds)
            .clamp(1, self.max_timeout_seconds);
        Duration::from_secs(secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Bounded per-subscriber event queue length.
    #[serde(default = "default_queue_size")]
    pub subscriber_queue_size: usize,
    /// Heartbeat after this many seconds of push-channel silence.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u64,
}

fn default_queue_size() -> usize {
    100
}
fn default_heartbeat() -> u64 {
    30
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            subscriber_queue_size: default_queue_size(),
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

impl StreamSettings {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    /// Fraction of the model's context window usable for prompt assembly.
    #[serde(default = "default_budget_fraction")]
    pub context_budget_fraction: f64,
    /// Soft cap on replayed history messages per turn.
    #[serde(default = "default_history_max")]
    pub history_messages_max: usize,
    /// Per-provider blocks keyed by provider id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_budget_fraction() -> f64 {
    0.6
}
fn default_history_max() -> usize {
    10
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            context_budget_fraction: default_budget_fraction(),
            history_messages_max: default_history_max(),
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub streaming: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub vision: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSettings {
    /// Risk assumed when a server omits a tool's risk declaration.
    #[serde(default = "default_risk")]
    pub default_risk: RiskLevel,
}

fn default_risk() -> RiskLevel {
    RiskLevel::Medium
}

impl Default for ToolsSettings {
    fn default() -> Self {
        Self {
            default_risk: default_risk(),
        }
    }
}
