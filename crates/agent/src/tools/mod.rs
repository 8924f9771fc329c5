//! Tool catalog and invocation layer.

pub mod adapter;
pub mod display;
pub mod registry;
pub mod shape;

pub use adapter::{CancelReason, ToolAdapter, ToolCallContext, ToolOutcome, ToolRuntime};
pub use registry::{ToolServerInfo, ToolServerRegistry, ToolServerSpec, ToolTransport};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared risk of a tool. Gating is monotone: an adapter may never
/// downgrade the risk a server configuration declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    /// Medium and high risk require explicit user consent.
    pub fn requires_consent(&self) -> bool {
        !matches!(self, RiskLevel::Low)
    }
}

/// Fully-qualified tool name: `server::tool`.
pub fn qualified_name(server_id: &str, tool: &str) -> String {
    format!("{}::{}", server_id, tool)
}

/// Adapter-ready description of one remote tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Fully-qualified name (`server::tool`), unique within the registry.
    pub name: String,
    /// Bare tool name as the owning server knows it.
    pub tool: String,
    pub server_id: String,
    pub description: String,
    pub input_schema: Value,
    pub risk: RiskLevel,
}

impl ToolDescriptor {
    /// The catalog entry handed to the LLM adapter.
    pub fn to_chat_tool(&self) -> parley::chat::Tool {
        parley::chat::Tool::function(
            self.name.clone(),
            self.description.clone(),
            self.input_schema.clone(),
        )
    }
}
