//! Tool-server connections over the Model Context Protocol.
//!
//! The entry point is [`McpManager`]: it spawns one supervisor task
//! per configured server, performs the JSON-RPC handshake and tool
//! discovery, and keeps a shared [`ToolRegistry`] of everything the
//! connected servers advertise. Connections that die are degraded and
//! reconnected in the background with jittered exponential backoff;
//! their tools are hidden from resolution until they return.
//!
//! Tool names resolve either bare (`search`, first configured server
//! wins) or qualified (`web__search`).

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod registry;
pub mod transport;
pub mod wire;

pub use client::ToolClient;
pub use config::{ManagerConfig, McpConfig, RestartPolicy, ToolServerConfig, TransportKind};
pub use connection::ConnState;
pub use error::{CallError, ConfigError, ConnectError};
pub use manager::{McpManager, ServerStatus};
pub use registry::{ToolRegistry, ToolSnapshot};
