//! Connection manager: one supervisor task per configured server.
//!
//! Each supervisor owns its connection's whole lifecycle: connect,
//! discover, probe, degrade, reconnect with jittered backoff, close.
//! Supervisors never touch each other's state, so a crashing or
//! hanging server cannot stall calls to the rest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use knack_types::ServerId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::reconnect_delay;
use crate::client::ToolClient;
use crate::config::{ManagerConfig, McpConfig, ToolServerConfig};
use crate::connection::{ConnState, Connection};
use crate::error::CallError;
use crate::registry::{ToolRegistry, ToolSnapshot};

/// Consecutive liveness probes a connection may miss before it is
/// degraded.
const PROBE_STRIKES: u32 = 3;

struct ServerEntry {
    conn: Arc<Connection>,
    nudge: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One row of the status summary.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: ServerId,
    pub state: ConnState,
    pub generation: u64,
    pub tools: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Supervises every configured tool server and owns the shared tool
/// registry.
pub struct McpManager {
    settings: ManagerConfig,
    registry: Arc<ToolRegistry>,
    entries: RwLock<HashMap<ServerId, ServerEntry>>,
    shutdown: CancellationToken,
    ready: AtomicBool,
}

impl McpManager {
    /// Spawn supervisors for every configured server and wait for each
    /// connection to leave `Connecting`, up to the startup timeout.
    /// Servers still connecting at the deadline are marked degraded;
    /// their supervisors keep retrying in the background.
    pub async fn start(config: McpConfig) -> Arc<Self> {
        let order: Vec<ServerId> = config.servers.iter().map(|s| s.id.clone()).collect();
        let manager = Arc::new(Self {
            settings: config.manager.clone(),
            registry: Arc::new(ToolRegistry::new(order)),
            entries: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            ready: AtomicBool::new(false),
        });

        let mut watchers = Vec::new();
        {
            let mut entries = manager.entries.write().await;
            for server in config.servers {
                let entry = manager.spawn_supervisor(server);
                watchers.push(entry.conn.watch_state());
                entries.insert(entry.conn.id().clone(), entry);
            }
        }

        let startup = Duration::from_millis(manager.settings.startup_timeout_ms);
        let all_settled = join_all(watchers.into_iter().map(|mut rx| async move {
            let _ = rx.wait_for(|s| *s != ConnState::Connecting).await;
        }));
        if timeout(startup, all_settled).await.is_err() {
            let entries = manager.entries.read().await;
            for entry in entries.values() {
                if entry.conn.state() == ConnState::Connecting {
                    warn!(server = %entry.conn.id(), "still connecting at startup deadline");
                    entry.conn.record_error("startup deadline exceeded");
                    entry.conn.set_state(ConnState::Degraded);
                }
            }
        }

        manager.ready.store(true, Ordering::SeqCst);
        let servers = manager.entries.read().await.len();
        info!(servers, "tool connection manager ready");
        manager
    }

    fn spawn_supervisor(&self, server: ToolServerConfig) -> ServerEntry {
        let conn = Arc::new(Connection::new(server));
        let nudge = Arc::new(Notify::new());
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(supervise(
            conn.clone(),
            self.registry.clone(),
            self.settings.clone(),
            nudge.clone(),
            cancel.clone(),
        ));
        ServerEntry {
            conn,
            nudge,
            cancel,
            task,
        }
    }

    /// True once startup has settled. Individual servers may still be
    /// degraded; readiness is about the manager, not every connection.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// All currently visible tools.
    pub async fn tools(&self) -> Vec<ToolSnapshot> {
        self.registry.tools().await
    }

    /// Every known tool, including those of degraded servers.
    pub async fn last_known_tools(&self) -> Vec<ToolSnapshot> {
        self.registry.last_known().await
    }

    /// Resolve a bare or qualified tool name against visible tools.
    pub async fn resolve(&self, name: &str) -> Option<ToolSnapshot> {
        self.registry.lookup(name).await
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    /// Resolve a tool name and invoke it. Resolution only consults the
    /// registry, so a name no visible server advertises fails without
    /// touching any connection.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        let Some(tool) = self.registry.lookup(name).await else {
            return Err(CallError::ToolUnavailable {
                name: name.to_string(),
            });
        };
        self.call_snapshot(&tool, arguments, deadline).await
    }

    /// Invoke an already resolved tool on the server that advertised
    /// it.
    pub async fn call_snapshot(
        &self,
        tool: &ToolSnapshot,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        let conn = {
            let entries = self.entries.read().await;
            entries.get(&tool.server).map(|e| e.conn.clone())
        };
        let Some(conn) = conn else {
            return Err(CallError::ToolUnavailable {
                name: tool.qualified_name(),
            });
        };
        conn.call(&tool.name, arguments, deadline).await
    }

    pub async fn connection_state(&self, server: &ServerId) -> Option<ConnState> {
        let entries = self.entries.read().await;
        entries.get(server).map(|e| e.conn.state())
    }

    pub async fn watch_connection(&self, server: &ServerId) -> Option<watch::Receiver<ConnState>> {
        let entries = self.entries.read().await;
        entries.get(server).map(|e| e.conn.watch_state())
    }

    pub async fn generation(&self, server: &ServerId) -> Option<u64> {
        let entries = self.entries.read().await;
        entries.get(server).map(|e| e.conn.generation())
    }

    /// Status summary in configured order.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for id in self.registry.order().await {
            let Some(entry) = entries.get(&id) else {
                continue;
            };
            let tools = self
                .registry
                .server_tools(&id)
                .await
                .map(|(_, count, _)| count)
                .unwrap_or(0);
            out.push(ServerStatus {
                id: id.clone(),
                state: entry.conn.state(),
                generation: entry.conn.generation(),
                tools,
                last_error: entry.conn.last_error(),
            });
        }
        out
    }

    /// Apply a new configuration. Removed servers shut down, added
    /// servers spawn, changed servers restart, and servers whose
    /// definition is unchanged keep their live connections.
    pub async fn reload(&self, config: McpConfig) {
        let order = config.server_order();
        let new_ids: HashSet<ServerId> = order.iter().cloned().collect();
        let mut entries = self.entries.write().await;

        let stale: Vec<ServerId> = entries
            .iter()
            .filter(|(id, entry)| {
                !config
                    .servers
                    .iter()
                    .any(|s| s.id == **id && *s == *entry.conn.config())
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(entry) = entries.remove(id) {
                debug!(server = %id, "stopping supervisor for removed or changed server");
                entry.cancel.cancel();
                let mut task = entry.task;
                let grace = Duration::from_millis(self.settings.shutdown_timeout_ms);
                if timeout(grace, &mut task).await.is_err() {
                    task.abort();
                }
            }
            if !new_ids.contains(id) {
                self.registry.remove(id).await;
            }
        }

        for server in config.servers {
            if !entries.contains_key(&server.id) {
                debug!(server = %server.id, "starting supervisor for new server");
                let entry = self.spawn_supervisor(server);
                entries.insert(entry.conn.id().clone(), entry);
            }
        }
        drop(entries);

        self.registry.set_order(order).await;
        info!("tool server configuration reloaded");
    }

    /// Ask one supervisor to act now: a degraded server retries its
    /// connect immediately instead of waiting out the backoff, and a
    /// ready server re-runs tool discovery. Returns false for an
    /// unknown server id.
    pub async fn reload_server(&self, server: &ServerId) -> bool {
        let entries = self.entries.read().await;
        match entries.get(server) {
            Some(entry) => {
                entry.nudge.notify_one();
                true
            }
            None => false,
        }
    }

    /// Re-run discovery on a ready connection right now, replacing the
    /// server's registry entry wholesale.
    pub async fn refresh(&self, server: &ServerId) -> Result<(), CallError> {
        let conn = {
            let entries = self.entries.read().await;
            entries.get(server).map(|e| e.conn.clone())
        };
        let Some(conn) = conn else {
            return Err(CallError::ChannelClosed);
        };
        if conn.state() != ConnState::Ready {
            return Err(CallError::ChannelClosed);
        }
        let Some(client) = conn.client().await else {
            return Err(CallError::ChannelClosed);
        };
        let deadline = Duration::from_millis(self.settings.probe_timeout_ms);
        let tools = client.discover(deadline).await?;
        self.registry.swap(server, conn.generation(), tools).await;
        Ok(())
    }

    /// Stop every supervisor and close every connection. Supervisors
    /// that do not finish within the shutdown grace period are
    /// aborted.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        info!("shutting down tool connection manager");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, e)| e.task).collect()
        };
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let grace = Duration::from_millis(self.settings.shutdown_timeout_ms);
        if timeout(grace, join_all(tasks)).await.is_err() {
            warn!("shutdown grace period elapsed, aborting supervisors");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

enum SessionEnd {
    Cancelled,
    Degraded(String),
}

/// Drive one connection for its whole lifetime.
async fn supervise(
    conn: Arc<Connection>,
    registry: Arc<ToolRegistry>,
    settings: ManagerConfig,
    nudge: Arc<Notify>,
    cancel: CancellationToken,
) {
    let server = conn.id().clone();
    let policy = conn.config().restart.clone();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match ToolClient::connect(conn.config()).await {
            Ok(client) => {
                let client = Arc::new(client);
                let generation = conn.install(client.clone()).await;
                registry
                    .swap(&server, generation, client.tools().to_vec())
                    .await;
                conn.clear_error();
                conn.set_state(ConnState::Ready);
                attempt = 0;

                let end = run_session(&conn, &client, &registry, &settings, &nudge, &cancel).await;

                // Leaving Ready: hide the tools and close the client so
                // in-flight calls resolve with ChannelClosed.
                registry.hide(&server).await;
                conn.take_client().await;
                client.close().await;

                match end {
                    SessionEnd::Cancelled => {
                        conn.set_state(ConnState::Closed);
                        return;
                    }
                    SessionEnd::Degraded(reason) => {
                        warn!(server = %server, reason, "connection degraded");
                        conn.record_error(reason);
                        conn.set_state(ConnState::Degraded);
                    }
                }
            }
            Err(e) => {
                warn!(server = %server, error = %e, attempt, "connect failed");
                conn.record_error(e.to_string());
                conn.set_state(ConnState::Degraded);
                registry.hide(&server).await;
            }
        }

        // Wait out the backoff; a nudge skips straight to the retry.
        let delay = reconnect_delay(&policy, attempt);
        attempt = attempt.saturating_add(1);
        debug!(server = %server, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = nudge.notified() => debug!(server = %server, "reconnect nudged"),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    registry.hide(conn.id()).await;
    if let Some(client) = conn.take_client().await {
        client.close().await;
    }
    conn.set_state(ConnState::Closed);
}

/// Probe a ready connection until it dies, degrades, or is cancelled.
/// A nudge triggers an immediate rediscovery instead of a probe.
async fn run_session(
    conn: &Connection,
    client: &ToolClient,
    registry: &ToolRegistry,
    settings: &ManagerConfig,
    nudge: &Notify,
    cancel: &CancellationToken,
) -> SessionEnd {
    let server = conn.id().clone();
    let probe_interval = Duration::from_millis(settings.probe_interval_ms);
    let probe_timeout = Duration::from_millis(settings.probe_timeout_ms);
    let mut strikes: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            _ = nudge.notified() => {
                debug!(server = %server, "rediscovering tools on request");
                match client.discover(probe_timeout).await {
                    Ok(tools) => {
                        registry.swap(&server, conn.generation(), tools).await;
                        strikes = 0;
                    }
                    Err(e) => return SessionEnd::Degraded(format!("tool rediscovery failed: {e}")),
                }
            }
            _ = tokio::time::sleep(probe_interval) => {
                match client.ping(probe_timeout).await {
                    Ok(()) => strikes = 0,
                    // A closed channel is conclusive; no need to
                    // accumulate strikes.
                    Err(CallError::ChannelClosed) => {
                        return SessionEnd::Degraded("connection closed".to_string());
                    }
                    Err(e) => {
                        strikes += 1;
                        warn!(server = %server, strikes, error = %e, "liveness probe failed");
                        if strikes >= PROBE_STRIKES {
                            return SessionEnd::Degraded(format!(
                                "{PROBE_STRIKES} consecutive liveness probes failed: {e}"
                            ));
                        }
                    }
                }
            }
        }
    }
}
