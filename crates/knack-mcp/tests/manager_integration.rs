//! End-to-end tests for the connection manager against real scripted
//! tool-server processes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use knack_mcp::{
    CallError, ConnState, ManagerConfig, McpConfig, McpManager, RestartPolicy, ToolServerConfig,
    TransportKind,
};
use knack_types::ServerId;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ---------------------------------------------------------------------
// Scripted servers
// ---------------------------------------------------------------------

/// A complete MCP server. `die` makes the process exit without
/// answering, which is how the tests simulate a crash mid-call.
const MOCK_SERVER: &str = r#"
import json, sys, os

def reply(msg, result):
    print(json.dumps({"jsonrpc": "2.0", "id": msg["id"], "result": result}), flush=True)

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    if "id" not in msg:
        continue
    method = msg.get("method")
    if method == "initialize":
        reply(msg, {"protocolVersion": "2025-06-18", "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "1.0"}})
    elif method == "tools/list":
        reply(msg, {"tools": [
            {"name": "search", "description": "Search the web",
             "inputSchema": {"type": "object",
                             "properties": {"query": {"type": "string"}}}},
            {"name": "die", "description": "Crash the server",
             "inputSchema": {"type": "object", "properties": {}}},
        ]})
    elif method == "tools/call":
        if msg["params"]["name"] == "die":
            os._exit(1)
        reply(msg, {"content": [{"type": "text", "text": json.dumps({"results": ["a", "b"]})}],
                    "isError": False})
    elif method == "ping":
        reply(msg, {})
"#;

/// Advertises one tool on the first `tools/list` and two afterwards,
/// so rediscovery is observable.
const GROWING_SERVER: &str = r#"
import json, sys

def reply(msg, result):
    print(json.dumps({"jsonrpc": "2.0", "id": msg["id"], "result": result}), flush=True)

lists = 0
for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    if "id" not in msg:
        continue
    method = msg.get("method")
    if method == "initialize":
        reply(msg, {"protocolVersion": "2025-06-18", "capabilities": {"tools": {}},
                    "serverInfo": {"name": "growing"}})
    elif method == "tools/list":
        lists += 1
        tools = [{"name": "search", "inputSchema": {"type": "object", "properties": {}}}]
        if lists > 1:
            tools.append({"name": "extra", "inputSchema": {"type": "object", "properties": {}}})
        reply(msg, {"tools": tools})
    elif method == "ping":
        reply(msg, {})
"#;

fn python_server(id: &str, script: &str) -> ToolServerConfig {
    ToolServerConfig {
        id: ServerId::new(id),
        transport: TransportKind::Stdio {
            command: "python3".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        },
        restart: RestartPolicy {
            initial_delay_ms: 500,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
        },
        connect_timeout_ms: 5_000,
    }
}

fn fast_manager() -> ManagerConfig {
    ManagerConfig {
        startup_timeout_ms: 10_000,
        shutdown_timeout_ms: 1_000,
        probe_interval_ms: 100,
        probe_timeout_ms: 1_000,
    }
}

async fn wait_for_state(
    rx: &mut tokio::sync::watch::Receiver<ConnState>,
    wanted: ConnState,
    what: &str,
) {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap();
}

// ---------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------

#[tokio::test]
async fn broken_server_does_not_affect_healthy_one() {
    let config = McpConfig {
        servers: vec![
            python_server("good", MOCK_SERVER),
            ToolServerConfig {
                id: ServerId::new("bad"),
                transport: TransportKind::Stdio {
                    command: "/nonexistent/knack-no-such-binary".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                },
                restart: RestartPolicy {
                    initial_delay_ms: 60_000,
                    max_delay_ms: 60_000,
                    backoff_factor: 2.0,
                },
                connect_timeout_ms: 5_000,
            },
        ],
        manager: fast_manager(),
    };

    let manager = McpManager::start(config).await;
    assert!(manager.ready());
    assert_eq!(
        manager.connection_state(&ServerId::new("good")).await,
        Some(ConnState::Ready)
    );
    assert_eq!(
        manager.connection_state(&ServerId::new("bad")).await,
        Some(ConnState::Degraded)
    );

    // The healthy server keeps serving calls.
    let result = manager
        .call_tool("search", json!({"query": "rust"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, json!({"results": ["a", "b"]}));

    let status = manager.status().await;
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].id.as_str(), "good");
    assert_eq!(status[1].id.as_str(), "bad");
    let bad_error = status[1].last_error.as_deref().unwrap();
    assert!(bad_error.contains("spawn"), "got: {bad_error}");

    manager.shutdown().await;
}

#[tokio::test]
async fn hung_server_is_degraded_at_the_startup_deadline() {
    let mut hung = python_server("hung", MOCK_SERVER);
    hung.transport = TransportKind::Stdio {
        command: "sleep".to_string(),
        args: vec!["30".to_string()],
        env: HashMap::new(),
    };
    hung.connect_timeout_ms = 60_000;
    let config = McpConfig {
        servers: vec![python_server("good", MOCK_SERVER), hung],
        manager: ManagerConfig {
            startup_timeout_ms: 300,
            ..fast_manager()
        },
    };

    let started = Instant::now();
    let manager = McpManager::start(config).await;
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "startup blocked on the hung server"
    );
    assert_eq!(
        manager.connection_state(&ServerId::new("hung")).await,
        Some(ConnState::Degraded)
    );
    assert!(manager.resolve("search").await.is_some());

    manager.shutdown().await;
}

// ---------------------------------------------------------------------
// Degrade and reconnect
// ---------------------------------------------------------------------

#[tokio::test]
async fn dead_server_degrades_then_reconnects_with_a_higher_generation() {
    let id = ServerId::new("mock");
    let config = McpConfig {
        servers: vec![python_server("mock", MOCK_SERVER)],
        manager: fast_manager(),
    };
    let manager = McpManager::start(config).await;
    assert_eq!(manager.generation(&id).await, Some(1));

    let mut states = manager.watch_connection(&id).await.unwrap();

    // Kill the process mid-call; the in-flight call sees the channel
    // close rather than hanging.
    let err = manager
        .call_tool("die", json!({}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::ChannelClosed));

    // The next liveness probe notices and degrades the connection.
    wait_for_state(&mut states, ConnState::Degraded, "degraded state").await;
    assert!(manager.resolve("search").await.is_none());
    let err = manager
        .call_tool("search", json!({"query": "x"}), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::ToolUnavailable { .. }));

    // Backoff elapses, a fresh process is spawned, and the tools come
    // back under a new generation.
    wait_for_state(&mut states, ConnState::Ready, "reconnect").await;
    assert_eq!(manager.generation(&id).await, Some(2));
    let result = manager
        .call_tool("search", json!({"query": "x"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, json!({"results": ["a", "b"]}));

    manager.shutdown().await;
}

// ---------------------------------------------------------------------
// Rediscovery
// ---------------------------------------------------------------------

#[tokio::test]
async fn nudge_on_a_ready_connection_rediscovers_tools() {
    let id = ServerId::new("growing");
    let config = McpConfig {
        servers: vec![python_server("growing", GROWING_SERVER)],
        manager: fast_manager(),
    };
    let manager = McpManager::start(config).await;
    assert_eq!(manager.tools().await.len(), 1);
    assert!(manager.resolve("extra").await.is_none());

    assert!(manager.reload_server(&id).await);

    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.resolve("extra").await.is_none() {
        assert!(Instant::now() < deadline, "rediscovery never happened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(manager.tools().await.len(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn refresh_replaces_the_tool_set_wholesale() {
    let id = ServerId::new("mock");
    let config = McpConfig {
        servers: vec![python_server("mock", MOCK_SERVER)],
        manager: fast_manager(),
    };
    let manager = McpManager::start(config).await;
    let before: Vec<String> = manager.tools().await.iter().map(|t| t.name.clone()).collect();

    manager.refresh(&id).await.unwrap();
    manager.refresh(&id).await.unwrap();

    let after: Vec<String> = manager.tools().await.iter().map(|t| t.name.clone()).collect();
    assert_eq!(before, after, "refresh must not duplicate or drop tools");
    assert!(manager.resolve("search").await.is_some());

    manager.shutdown().await;
}

// ---------------------------------------------------------------------
// Reload
// ---------------------------------------------------------------------

#[tokio::test]
async fn reload_swaps_servers_without_touching_unchanged_ones() {
    let config = McpConfig {
        servers: vec![
            python_server("alpha", MOCK_SERVER),
            python_server("gamma", MOCK_SERVER),
        ],
        manager: fast_manager(),
    };
    let manager = McpManager::start(config).await;

    // Drop gamma, add delta, keep alpha byte-identical.
    let new_config = McpConfig {
        servers: vec![
            python_server("alpha", MOCK_SERVER),
            python_server("delta", MOCK_SERVER),
        ],
        manager: fast_manager(),
    };
    manager.reload(new_config).await;

    // The unchanged server never left Ready.
    assert_eq!(
        manager.connection_state(&ServerId::new("alpha")).await,
        Some(ConnState::Ready)
    );
    assert_eq!(manager.connection_state(&ServerId::new("gamma")).await, None);

    let mut states = manager
        .watch_connection(&ServerId::new("delta"))
        .await
        .unwrap();
    wait_for_state(&mut states, ConnState::Ready, "new server to connect").await;

    let order: Vec<String> = manager
        .status()
        .await
        .iter()
        .map(|s| s.id.to_string())
        .collect();
    assert_eq!(order, vec!["alpha", "delta"]);

    manager.shutdown().await;
}

// ---------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------

async fn read_body(sock: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 65536];
    let mut total = 0;
    loop {
        let n = sock.read(&mut buf[total..]).await.ok()?;
        if n == 0 {
            return None;
        }
        total += n;
        if let Some(end) = buf[..total].windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..end]);
            let content_length = headers
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if total >= end + 4 + content_length {
                return Some(buf[end + 4..end + 4 + content_length].to_vec());
            }
        }
    }
}

async fn write_json(sock: &mut TcpStream, body: String) {
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = sock.write_all(response.as_bytes()).await;
}

/// A minimal HTTP MCP endpoint, one JSON-RPC exchange per connection.
async fn spawn_http_mcp() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Some(body) = read_body(&mut sock).await else {
                    return;
                };
                let Ok(msg) = serde_json::from_slice::<serde_json::Value>(&body) else {
                    return;
                };
                let Some(id) = msg.get("id").cloned() else {
                    // Notification: acknowledge without a body.
                    let _ = sock
                        .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                        .await;
                    return;
                };
                let result = match msg["method"].as_str().unwrap_or("") {
                    "initialize" => json!({
                        "protocolVersion": "2025-06-18",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "http-mock"},
                    }),
                    "tools/list" => json!({
                        "tools": [{"name": "echo",
                                   "inputSchema": {"type": "object", "properties": {}}}],
                    }),
                    "tools/call" => json!({
                        "content": [{"type": "text",
                                     "text": msg["params"]["arguments"].to_string()}],
                        "isError": false,
                    }),
                    _ => json!({}),
                };
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
                write_json(&mut sock, reply.to_string()).await;
            });
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn http_server_connects_and_serves_calls() {
    let url = spawn_http_mcp().await;
    let config = McpConfig {
        servers: vec![ToolServerConfig {
            id: ServerId::new("web"),
            transport: TransportKind::Http {
                url,
                headers: HashMap::new(),
            },
            restart: RestartPolicy::default(),
            connect_timeout_ms: 5_000,
        }],
        manager: fast_manager(),
    };
    let manager = McpManager::start(config).await;
    assert_eq!(
        manager.connection_state(&ServerId::new("web")).await,
        Some(ConnState::Ready)
    );

    // The mock echoes the arguments back as text content, which the
    // client parses into structured JSON again.
    let result = manager
        .call_tool("echo", json!({"x": 1}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, json!({"x": 1}));

    // Qualified names address the server directly.
    assert!(manager.resolve("web__echo").await.is_some());

    manager.shutdown().await;
}

// ---------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------

#[tokio::test]
async fn shutdown_hides_tools_and_stops_serving() {
    let config = McpConfig {
        servers: vec![python_server("mock", MOCK_SERVER)],
        manager: fast_manager(),
    };
    let manager = McpManager::start(config).await;
    assert!(manager.resolve("search").await.is_some());

    manager.shutdown().await;

    assert!(!manager.ready());
    assert!(manager.resolve("search").await.is_none());
    let err = manager
        .call_tool("search", json!({}), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::ToolUnavailable { .. }));
}
