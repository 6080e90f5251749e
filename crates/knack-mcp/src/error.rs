//! Error types for tool-server connections and calls.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while establishing a connection to a tool server.
///
/// These never escape the supervisor that owns the connection; they are
/// recorded on the connection and drive the retry loop.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to spawn tool server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to reach tool server '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("handshake with tool server '{server}' failed: {message}")]
    Handshake { server: String, message: String },

    #[error("tool server '{server}' did not answer within {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },
}

/// Failures of a single tool call against an established connection.
#[derive(Error, Debug)]
pub enum CallError {
    /// The call did not complete before its deadline. The correlation
    /// slot is released; a late answer is discarded.
    #[error("call exceeded its {deadline_ms}ms deadline")]
    Timeout { deadline_ms: u64 },

    /// The server answered with an application-level error, either a
    /// JSON-RPC error object or a result flagged as an error.
    #[error("tool server rejected the call: {message}")]
    Rejected { message: String },

    /// The connection died while the call was in flight.
    #[error("connection closed while the call was in flight")]
    ChannelClosed,

    /// No connected, visible server advertises the requested tool.
    #[error("no connected server advertises tool '{name}'")]
    ToolUnavailable { name: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failures loading or validating the server configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// An empty server list is the only configuration problem treated
    /// as fatal; anything else degrades the affected server.
    #[error("no tool servers configured in {path}")]
    NoServers { path: PathBuf },

    #[error("duplicate tool server id '{id}'")]
    DuplicateServer { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_messages_name_the_server() {
        let err = ConnectError::Handshake {
            server: "search".to_string(),
            message: "unsupported protocol version".to_string(),
        };
        assert!(err.to_string().contains("'search'"));
        assert!(err.to_string().contains("unsupported protocol version"));
    }

    #[test]
    fn call_timeout_reports_deadline() {
        let err = CallError::Timeout { deadline_ms: 1500 };
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn tool_unavailable_names_the_tool() {
        let err = CallError::ToolUnavailable {
            name: "web_search".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "no connected server advertises tool 'web_search'"
        );
    }
}
