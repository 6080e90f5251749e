//! MCP client: handshake, tool discovery, and tool calls on one
//! established connection.

use std::sync::Arc;
use std::time::Duration;

use knack_types::ServerId;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{ToolServerConfig, TransportKind};
use crate::error::{CallError, ConnectError};
use crate::registry::ToolSnapshot;
use crate::transport::{HttpTransport, StdioTransport, Transport};
use crate::wire::{self, InitializeResult, ToolCallResult, ToolsListResult};

/// A handshaken connection to one tool server.
pub struct ToolClient {
    server: ServerId,
    transport: Arc<dyn Transport>,
    tools: Vec<ToolSnapshot>,
}

impl std::fmt::Debug for ToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolClient")
            .field("server", &self.server)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl ToolClient {
    /// Open the transport, run the `initialize` handshake, send the
    /// `initialized` notification, and perform first discovery. The
    /// config's connect timeout bounds each step.
    pub async fn connect(config: &ToolServerConfig) -> Result<Self, ConnectError> {
        let server = config.id.clone();
        let deadline = Duration::from_millis(config.connect_timeout_ms);
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportKind::Stdio { command, args, env } => {
                Arc::new(StdioTransport::spawn(server.as_str(), command, args, env)?)
            }
            TransportKind::Http { url, headers } => {
                Arc::new(HttpTransport::new(server.as_str(), url, headers)?)
            }
        };

        let raw = transport
            .request("initialize", Some(wire::initialize_params()), deadline)
            .await
            .map_err(|e| connect_error(&server, e))?;
        let init: InitializeResult =
            serde_json::from_value(raw).map_err(|e| ConnectError::Handshake {
                server: server.to_string(),
                message: format!("invalid initialize result: {e}"),
            })?;
        if !wire::SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
            return Err(ConnectError::Handshake {
                server: server.to_string(),
                message: format!("unsupported protocol version '{}'", init.protocol_version),
            });
        }
        if let Some(server_info) = &init.server_info {
            debug!(server = %server, name = %server_info.name, version = ?server_info.version, "handshake complete");
        }

        match tokio::time::timeout(deadline, transport.notify("notifications/initialized", None))
            .await
        {
            Ok(result) => result.map_err(|e| connect_error(&server, e))?,
            Err(_) => {
                return Err(ConnectError::Timeout {
                    server: server.to_string(),
                    timeout_ms: config.connect_timeout_ms,
                });
            }
        }

        let tools = discover(&server, transport.as_ref(), deadline)
            .await
            .map_err(|e| connect_error(&server, e))?;
        info!(server = %server, tools = tools.len(), "connected to tool server");

        Ok(Self {
            server,
            transport,
            tools,
        })
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    /// Tools found by the discovery pass that built this client.
    pub fn tools(&self) -> &[ToolSnapshot] {
        &self.tools
    }

    /// Re-run `tools/list` on the live connection.
    pub async fn discover(&self, deadline: Duration) -> Result<Vec<ToolSnapshot>, CallError> {
        discover(&self.server, self.transport.as_ref(), deadline).await
    }

    /// Invoke a tool. The result is the server's structured content
    /// when present, otherwise its text content parsed as JSON when it
    /// parses, otherwise the raw text as a JSON string.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let raw = self
            .transport
            .request("tools/call", Some(params), deadline)
            .await?;
        let result: ToolCallResult = serde_json::from_value(raw)
            .map_err(|e| CallError::Protocol(format!("invalid tools/call result: {e}")))?;
        if result.is_error {
            return Err(CallError::Rejected {
                message: result.text(),
            });
        }
        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }
        let text = result.text();
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// Liveness probe.
    pub async fn ping(&self, deadline: Duration) -> Result<(), CallError> {
        self.transport
            .request("ping", None, deadline)
            .await
            .map(|_| ())
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

async fn discover(
    server: &ServerId,
    transport: &dyn Transport,
    deadline: Duration,
) -> Result<Vec<ToolSnapshot>, CallError> {
    let raw = transport.request("tools/list", None, deadline).await?;
    let list: ToolsListResult = serde_json::from_value(raw)
        .map_err(|e| CallError::Protocol(format!("invalid tools/list result: {e}")))?;
    Ok(list
        .tools
        .into_iter()
        .map(|entry| ToolSnapshot::from_entry(server.clone(), entry))
        .collect())
}

fn connect_error(server: &ServerId, err: CallError) -> ConnectError {
    match err {
        CallError::Timeout { deadline_ms } => ConnectError::Timeout {
            server: server.to_string(),
            timeout_ms: deadline_ms,
        },
        CallError::Rejected { message } => ConnectError::Handshake {
            server: server.to_string(),
            message,
        },
        CallError::ChannelClosed => ConnectError::Transport {
            server: server.to_string(),
            message: "connection closed during handshake".to_string(),
        },
        CallError::Protocol(message) => ConnectError::Handshake {
            server: server.to_string(),
            message,
        },
        CallError::ToolUnavailable { name } => ConnectError::Handshake {
            server: server.to_string(),
            message: format!("tool '{name}' unavailable"),
        },
    }
}
