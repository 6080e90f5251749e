//! Per-server connection state.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use knack_types::ServerId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tracing::info;

use crate::client::ToolClient;
use crate::config::ToolServerConfig;
use crate::error::CallError;

/// Lifecycle of one managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnState {
    /// Startup or first connect in progress.
    Connecting,
    /// Handshake and discovery done; calls are accepted.
    Ready,
    /// The server is unreachable; reconnecting in the background.
    Degraded,
    /// Shut down on purpose; no reconnect will follow.
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Connecting => "connecting",
            ConnState::Ready => "ready",
            ConnState::Degraded => "degraded",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One managed connection. The supervisor task owns all transitions;
/// everyone else observes through the watch channel.
///
/// `generation` counts successful connects. A reconnect installs a
/// fresh client with a fresh transport, so answers addressed to an
/// earlier generation have nowhere to land.
pub struct Connection {
    config: ToolServerConfig,
    state_tx: watch::Sender<ConnState>,
    generation: AtomicU64,
    last_error: StdMutex<Option<String>>,
    client: RwLock<Option<Arc<ToolClient>>>,
}

impl Connection {
    pub fn new(config: ToolServerConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnState::Connecting);
        Self {
            config,
            state_tx,
            generation: AtomicU64::new(0),
            last_error: StdMutex::new(None),
            client: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.config.id
    }

    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(server = %self.id(), from = %previous, to = %state, "connection state change");
        }
    }

    pub(crate) fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        match self.last_error.lock() {
            Ok(mut guard) => *guard = Some(message),
            Err(poisoned) => *poisoned.into_inner() = Some(message),
        }
    }

    pub(crate) fn clear_error(&self) {
        match self.last_error.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    /// Install a freshly connected client and advance the generation.
    /// Returns the new generation number.
    pub(crate) async fn install(&self, client: Arc<ToolClient>) -> u64 {
        *self.client.write().await = Some(client);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Remove the current client, if any, handing it to the caller for
    /// closing.
    pub(crate) async fn take_client(&self) -> Option<Arc<ToolClient>> {
        self.client.write().await.take()
    }

    pub(crate) async fn client(&self) -> Option<Arc<ToolClient>> {
        self.client.read().await.clone()
    }

    /// Call a tool on this connection. Only a `Ready` connection
    /// accepts calls; anything else behaves like a closed channel.
    pub async fn call(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        if self.state() != ConnState::Ready {
            return Err(CallError::ChannelClosed);
        }
        let Some(client) = self.client().await else {
            return Err(CallError::ChannelClosed);
        };
        client.call_tool(tool, arguments, deadline).await
    }
}
