//! Declared tool servers and the derived flat tool catalog.
//!
//! A server is declared with exactly one connection mode (local child
//! process or remote streamable-HTTP endpoint), probed for its tool list at
//! registration time, and contributes fully-qualified entries to the
//! catalog. Risk comes from the server configuration's per-tool overrides;
//! servers that omit it get the configured default.

use async_trait::async_trait;
use parking_lot::RwLock;
use rmcp::model::{CallToolRequestParams, ClientInfo, Implementation};
use rmcp::service::{DynService, Peer, RunningService};
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::{RoleClient, ServiceExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use crate::error::{AgentError, AgentResult};
use crate::tools::{RiskLevel, ToolDescriptor, qualified_name};

/// One remote tool endpoint, callable by bare tool name.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn call_tool(&self, tool: &str, args: Value) -> AgentResult<Value>;
}

/// Declarative server registration, as accepted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSpec {
    pub id: String,
    /// Local mode: command + args (+ env).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Remote mode: streamable-HTTP URL (+ optional bearer token).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Per-tool risk declarations, keyed by bare tool name.
    #[serde(default)]
    pub risk_overrides: HashMap<String, RiskLevel>,
}

#[derive(Debug)]
enum TransportMode {
    Stdio,
    Http,
}

impl ToolServerSpec {
    fn validate(&self) -> AgentResult<TransportMode> {
        if self.id.trim().is_empty() {
            return Err(AgentError::ToolServerInvalid {
                server_id: self.id.clone(),
                reason: "server id must be non-empty".into(),
            });
        }
        match (self.command.as_deref(), self.url.as_deref()) {
            (Some(_), None) => Ok(TransportMode::Stdio),
            (None, Some(_)) => Ok(TransportMode::Http),
            (Some(_), Some(_)) => Err(AgentError::ToolServerInvalid {
                server_id: self.id.clone(),
                reason: "exactly one of command or url must be set, got both".into(),
            }),
            (None, None) => Err(AgentError::ToolServerInvalid {
                server_id: self.id.clone(),
                reason: "exactly one of command or url must be set, got neither".into(),
            }),
        }
    }

    /// Wire-facing summary of the connection mode.
    pub fn mode(&self) -> &'static str {
        if self.command.is_some() { "stdio" } else { "http" }
    }
}

struct McpTransport {
    peer: Peer<RoleClient>,
    server_id: String,
}

#[async_trait]
impl ToolTransport for McpTransport {
    async fn call_tool(&self, tool: &str, args: Value) -> AgentResult<Value> {
        let arguments = args.as_object().cloned();
        let result = self
            .peer
            .call_tool({
                let mut params = CallToolRequestParams::new(tool.to_string());
                if let Some(arguments) = arguments {
                    params = params.with_arguments(arguments);
                }
                params
            })
            .await
            .map_err(|e| AgentError::ToolExecution {
                tool_name: qualified_name(&self.server_id, tool),
                reason: e.to_string(),
            })?;
        serde_json::to_value(result).map_err(Into::into)
    }
}

struct RegisteredServer {
    spec: ToolServerSpec,
    tools: Vec<ToolDescriptor>,
    transport: Arc<dyn ToolTransport>,
    // Keeps the MCP connection task alive; dropped on unregister.
    _service: Option<RunningService<RoleClient, Box<dyn DynService<RoleClient>>>>,
}

/// Wire-facing view of a registered server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerInfo {
    pub id: String,
    pub mode: String,
    pub tools: Vec<ToolDescriptor>,
}

pub struct ToolServerRegistry {
    default_risk: RiskLevel,
    servers: RwLock<HashMap<String, RegisteredServer>>,
}

impl ToolServerRegistry {
    pub fn new(default_risk: RiskLevel) -> Self {
        Self {
            default_risk,
            servers: RwLock::new(HashMap::new()),
        }
    }

    fn client_info() -> ClientInfo {
        let mut info = ClientInfo::default();
        let mut implementation = Implementation::default();
        implementation.name = "parley-agent".into();
        implementation.version = env!("CARGO_PKG_VERSION").into();
        info.client_info = implementation;
        info
    }

    /// Register a server: validate, connect, probe its tool list, and
    /// populate the catalog. Fails without side effects.
    pub async fn register(&self, spec: ToolServerSpec) -> AgentResult<Vec<ToolDescriptor>> {
        let mode = spec.validate()?;
        if self.servers.read().contains_key(&spec.id) {
            return Err(AgentError::ToolServerInvalid {
                server_id: spec.id.clone(),
                reason: "server id already registered".into(),
            });
        }

        let service = match mode {
            TransportMode::Stdio => {
                let command = spec.command.clone().expect("validated");
                let mut cmd = tokio::process::Command::new(&command);
                cmd.args(&spec.args)
                    .envs(&spec.env)
                    .stderr(Stdio::inherit())
                    .stdout(Stdio::piped())
                    .stdin(Stdio::piped());
                let transport =
                    rmcp::transport::child_process::TokioChildProcess::new(cmd).map_err(|e| {
                        AgentError::ToolServerConnect {
                            server_id: spec.id.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                Self::client_info()
                    .into_dyn()
                    .serve(transport)
                    .await
                    .map_err(|e| AgentError::ToolServerConnect {
                        server_id: spec.id.clone(),
                        reason: e.to_string(),
                    })?
            }
            TransportMode::Http => {
                let url = spec.url.clone().expect("validated");
                let transport = match &spec.auth_token {
                    Some(token) => {
                        let mut headers = reqwest::header::HeaderMap::new();
                        let value = reqwest::header::HeaderValue::from_str(&format!(
                            "Bearer {token}"
                        ))
                        .map_err(|e| AgentError::ToolServerInvalid {
                            server_id: spec.id.clone(),
                            reason: format!("invalid auth token: {}", e),
                        })?;
                        headers.insert(reqwest::header::AUTHORIZATION, value);
                        let client = reqwest::ClientBuilder::new()
                            .default_headers(headers)
                            .build()
                            .map_err(|e| AgentError::ToolServerConnect {
                                server_id: spec.id.clone(),
                                reason: e.to_string(),
                            })?;
                        StreamableHttpClientTransport::with_client(
                            client,
                            StreamableHttpClientTransportConfig::with_uri(url),
                        )
                    }
                    None => StreamableHttpClientTransport::from_uri(url),
                };
                Self::client_info()
                    .into_dyn()
                    .serve(transport)
                    .await
                    .map_err(|e| AgentError::ToolServerConnect {
                        server_id: spec.id.clone(),
                        reason: e.to_string(),
                    })?
            }
        };

        let listed = service
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| AgentError::ToolServerConnect {
                server_id: spec.id.clone(),
                reason: format!("tool probe failed: {}", e),
            })?;

        let descriptors: Vec<ToolDescriptor> = listed
            .into_iter()
            .map(|tool| {
                let bare = tool.name.to_string();
                ToolDescriptor {
                    name: qualified_name(&spec.id, &bare),
                    server_id: spec.id.clone(),
                    description: tool
                        .description
                        .as_deref()
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: Value::Object((*tool.input_schema).clone()),
                    risk: spec
                        .risk_overrides
                        .get(&bare)
                        .copied()
                        .unwrap_or(self.default_risk),
                    tool: bare,
                }
            })
            .collect();

        let transport = Arc::new(McpTransport {
            peer: service.peer().clone(),
            server_id: spec.id.clone(),
        });

        log::info!(
            "registered tool server '{}' ({}) with {} tools",
            spec.id,
            spec.mode(),
            descriptors.len()
        );
        self.servers.write().insert(
            spec.id.clone(),
            RegisteredServer {
                spec,
                tools: descriptors.clone(),
                transport,
                _service: Some(service),
            },
        );
        Ok(descriptors)
    }

    /// Insert a server whose connection is managed elsewhere (in-process
    /// tools, tests). Same validation and uniqueness rules as [`register`].
    pub fn register_preconnected(
        &self,
        spec: ToolServerSpec,
        tools: Vec<(String, String, Value)>,
        transport: Arc<dyn ToolTransport>,
    ) -> AgentResult<Vec<ToolDescriptor>> {
        spec.validate()?;
        if self.servers.read().contains_key(&spec.id) {
            return Err(AgentError::ToolServerInvalid {
                server_id: spec.id.clone(),
                reason: "server id already registered".into(),
            });
        }
        let descriptors: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|(bare, description, input_schema)| ToolDescriptor {
                name: qualified_name(&spec.id, &bare),
                server_id: spec.id.clone(),
                description,
                input_schema,
                risk: spec
                    .risk_overrides
                    .get(&bare)
                    .copied()
                    .unwrap_or(self.default_risk),
                tool: bare,
            })
            .collect();
        self.servers.write().insert(
            spec.id.clone(),
            RegisteredServer {
                spec,
                tools: descriptors.clone(),
                transport,
                _service: None,
            },
        );
        Ok(descriptors)
    }

    /// Remove a server and evict its tool entries. The caller is expected
    /// to drive agent reloads via `AgentManager::reload_for_server`.
    pub fn unregister(&self, server_id: &str) -> AgentResult<()> {
        let removed = self.servers.write().remove(server_id);
        match removed {
            Some(_) => {
                log::info!("unregistered tool server '{}'", server_id);
                Ok(())
            }
            None => Err(AgentError::ToolServerNotFound {
                server_id: server_id.to_string(),
            }),
        }
    }

    /// Adapter-ready descriptors (with transports) for the named servers.
    /// Unknown server ids contribute nothing.
    pub fn tools_for(
        &self,
        server_ids: &[String],
    ) -> Vec<(ToolDescriptor, Arc<dyn ToolTransport>)> {
        let servers = self.servers.read();
        server_ids
            .iter()
            .filter_map(|id| servers.get(id))
            .flat_map(|server| {
                server
                    .tools
                    .iter()
                    .map(|d| (d.clone(), Arc::clone(&server.transport)))
            })
            .collect()
    }

    /// Declared risk of a fully-qualified tool; unknown tools get the
    /// configured default.
    pub fn risk_of(&self, qualified: &str) -> RiskLevel {
        let servers = self.servers.read();
        servers
            .values()
            .flat_map(|s| s.tools.iter())
            .find(|d| d.name == qualified)
            .map(|d| d.risk)
            .unwrap_or(self.default_risk)
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.servers.read().contains_key(server_id)
    }

    pub fn list(&self) -> Vec<ToolServerInfo> {
        let servers = self.servers.read();
        let mut infos: Vec<ToolServerInfo> = servers
            .values()
            .map(|s| ToolServerInfo {
                id: s.spec.id.clone(),
                mode: s.spec.mode().to_string(),
                tools: s.tools.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Direct invocation by fully-qualified name (admin/debug path).
    pub async fn call_direct(&self, qualified: &str, args: Value) -> AgentResult<Value> {
        let (tool, transport) = {
            let servers = self.servers.read();
            let descriptor = servers
                .values()
                .flat_map(|s| s.tools.iter().map(|d| (d, &s.transport)))
                .find(|(d, _)| d.name == qualified)
                .ok_or_else(|| AgentError::UnknownTool {
                    tool_name: qualified.to_string(),
                })?;
            (descriptor.0.tool.clone(), Arc::clone(descriptor.1))
        };
        transport.call_tool(&tool, args).await
    }

    /// Look up one descriptor by fully-qualified name.
    pub fn descriptor(&self, qualified: &str) -> Option<ToolDescriptor> {
        let servers = self.servers.read();
        servers
            .values()
            .flat_map(|s| s.tools.iter())
            .find(|d| d.name == qualified)
            .cloned()
    }
}
