//! Tool-server configuration.
//!
//! Servers are declared as an ordered list; that order decides which
//! server wins when two advertise the same bare tool name.
//!
//! ```toml
//! [[servers]]
//! id = "files"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//!
//! [[servers]]
//! id = "search"
//! url = "https://tools.example.com/mcp"
//! headers = { Authorization = "Bearer ..." }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use knack_types::ServerId;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level connection-manager configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub manager: ManagerConfig,
}

impl McpConfig {
    /// Load and validate a config file. An empty server list is fatal
    /// here; every other problem is deferred to the affected server's
    /// supervisor.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml(&text, path)?;
        if config.servers.is_empty() {
            return Err(ConfigError::NoServers {
                path: path.to_path_buf(),
            });
        }
        Ok(config)
    }

    /// Parse config text and check server ids for duplicates.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut seen = HashSet::new();
        for server in &config.servers {
            if !seen.insert(server.id.clone()) {
                return Err(ConfigError::DuplicateServer {
                    id: server.id.to_string(),
                });
            }
        }
        Ok(config)
    }

    /// Server ids in declaration order.
    pub fn server_order(&self) -> Vec<ServerId> {
        self.servers.iter().map(|s| s.id.clone()).collect()
    }
}

/// One configured tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub id: ServerId,
    #[serde(flatten)]
    pub transport: TransportKind,
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Budget for spawn, handshake, and first discovery together.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// How to reach a server: a spawned child process speaking
/// newline-delimited JSON on stdio, or an HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportKind {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment for the child; also the place for secrets
        /// a stdio server needs.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        /// Sent with every request; bearer tokens go here.
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Reconnect backoff for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// Manager-wide timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long startup waits for every server to leave `Connecting`
    /// before declaring the manager ready anyway.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Interval between liveness probes on a ready connection.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_startup_timeout_ms() -> u64 {
    15_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_probe_interval_ms() -> u64 {
    15_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse(text: &str) -> Result<McpConfig, ConfigError> {
        McpConfig::from_toml(text, &PathBuf::from("knack.toml"))
    }

    #[test]
    fn parse_stdio_server() {
        let config = parse(
            r#"
            [[servers]]
            id = "files"
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-filesystem"]
            "#,
        )
        .unwrap();
        assert_eq!(config.servers.len(), 1);
        let server = &config.servers[0];
        assert_eq!(server.id.as_str(), "files");
        match &server.transport {
            TransportKind::Stdio { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert!(env.is_empty());
            }
            TransportKind::Http { .. } => panic!("expected stdio transport"),
        }
        assert_eq!(server.connect_timeout_ms, 10_000);
    }

    #[test]
    fn parse_http_server_with_headers() {
        let config = parse(
            r#"
            [[servers]]
            id = "search"
            url = "https://tools.example.com/mcp"
            headers = { Authorization = "Bearer abc123" }
            "#,
        )
        .unwrap();
        match &config.servers[0].transport {
            TransportKind::Http { url, headers } => {
                assert_eq!(url, "https://tools.example.com/mcp");
                assert_eq!(headers["Authorization"], "Bearer abc123");
            }
            TransportKind::Stdio { .. } => panic!("expected http transport"),
        }
    }

    #[test]
    fn server_order_follows_declaration() {
        let config = parse(
            r#"
            [[servers]]
            id = "beta"
            command = "b"

            [[servers]]
            id = "alpha"
            command = "a"
            "#,
        )
        .unwrap();
        let order = config.server_order();
        assert_eq!(order[0].as_str(), "beta");
        assert_eq!(order[1].as_str(), "alpha");
    }

    #[test]
    fn duplicate_server_id_is_rejected() {
        let err = parse(
            r#"
            [[servers]]
            id = "files"
            command = "a"

            [[servers]]
            id = "files"
            command = "b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateServer { id } if id == "files"));
    }

    #[test]
    fn restart_policy_defaults() {
        let config = parse(
            r#"
            [[servers]]
            id = "files"
            command = "a"
            "#,
        )
        .unwrap();
        let restart = &config.servers[0].restart;
        assert_eq!(restart.initial_delay_ms, 1_000);
        assert_eq!(restart.max_delay_ms, 30_000);
        assert_eq!(restart.backoff_factor, 2.0);
    }

    #[tokio::test]
    async fn load_rejects_an_empty_server_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knack.toml");
        tokio::fs::write(&path, "# no servers yet\n").await.unwrap();
        let err = McpConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::NoServers { .. }));
    }

    #[tokio::test]
    async fn load_reads_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knack.toml");
        tokio::fs::write(
            &path,
            "[[servers]]\nid = \"files\"\ncommand = \"echo\"\n",
        )
        .await
        .unwrap();
        let config = McpConfig::load(&path).await.unwrap();
        assert_eq!(config.servers.len(), 1);
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = McpConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn manager_timings_can_be_overridden() {
        let config = parse(
            r#"
            [[servers]]
            id = "files"
            command = "a"

            [manager]
            startup_timeout_ms = 2000
            probe_interval_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.manager.startup_timeout_ms, 2_000);
        assert_eq!(config.manager.probe_interval_ms, 500);
        assert_eq!(config.manager.probe_timeout_ms, 5_000);
    }
}
