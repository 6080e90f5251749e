//! Shared catalog of discovered tools.
//!
//! Each server's entry is replaced wholesale on discovery, so readers
//! never see a half-updated list. Degraded servers keep their last
//! known tools but are hidden from resolution until they recover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use knack_types::ServerId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::wire::ToolEntry;

/// Point-in-time description of one tool on one server.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSnapshot {
    pub server: ServerId,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolSnapshot {
    pub(crate) fn from_entry(server: ServerId, entry: ToolEntry) -> Self {
        Self {
            server,
            name: entry.name,
            description: entry.description.unwrap_or_default(),
            input_schema: entry.input_schema,
            output_schema: entry.output_schema,
        }
    }

    /// `server__tool`, unambiguous across servers.
    pub fn qualified_name(&self) -> String {
        format!("{}__{}", self.server, self.name)
    }
}

#[derive(Default)]
struct Inner {
    /// Configured declaration order; decides bare-name resolution.
    order: Vec<ServerId>,
    servers: HashMap<ServerId, ServerTools>,
}

struct ServerTools {
    visible: bool,
    generation: u64,
    tools: Vec<ToolSnapshot>,
}

/// The registry itself. Every mutation bumps `version`, so callers can
/// cheaply detect that the catalog changed.
pub struct ToolRegistry {
    inner: RwLock<Inner>,
    version: AtomicU64,
}

impl ToolRegistry {
    pub fn new(order: Vec<ServerId>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                order,
                servers: HashMap::new(),
            }),
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Replace a server's tools in one step and make them visible.
    pub async fn swap(&self, server: &ServerId, generation: u64, tools: Vec<ToolSnapshot>) {
        let mut inner = self.inner.write().await;
        debug!(server = %server, generation, tools = tools.len(), "registry swap");
        inner.servers.insert(
            server.clone(),
            ServerTools {
                visible: true,
                generation,
                tools,
            },
        );
        self.bump();
    }

    /// Hide a server's tools from resolution, keeping them as the last
    /// known set.
    pub async fn hide(&self, server: &ServerId) {
        let mut inner = self.inner.write().await;
        match inner.servers.get_mut(server) {
            Some(entry) if entry.visible => {
                debug!(server = %server, "registry hide");
                entry.visible = false;
                self.bump();
            }
            _ => {}
        }
    }

    /// Forget a server entirely.
    pub async fn remove(&self, server: &ServerId) {
        let mut inner = self.inner.write().await;
        let order_len = inner.order.len();
        inner.order.retain(|s| s != server);
        let removed = inner.servers.remove(server).is_some();
        if removed || inner.order.len() != order_len {
            self.bump();
        }
    }

    /// Install a new declaration order after a config reload.
    pub async fn set_order(&self, order: Vec<ServerId>) {
        let mut inner = self.inner.write().await;
        inner.order = order;
        self.bump();
    }

    /// Resolve a tool name to a visible tool.
    ///
    /// A qualified `server__tool` name addresses exactly one server. A
    /// bare name goes to the first visible server in declaration order
    /// that advertises it.
    pub async fn lookup(&self, name: &str) -> Option<ToolSnapshot> {
        let inner = self.inner.read().await;
        for server in &inner.order {
            let Some(entry) = inner.servers.get(server) else {
                continue;
            };
            if !entry.visible {
                continue;
            }
            for tool in &entry.tools {
                if tool.name == name || tool.qualified_name() == name {
                    return Some(tool.clone());
                }
            }
        }
        None
    }

    /// All visible tools in declaration order.
    pub async fn tools(&self) -> Vec<ToolSnapshot> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for server in &inner.order {
            if let Some(entry) = inner.servers.get(server) {
                if entry.visible {
                    out.extend(entry.tools.iter().cloned());
                }
            }
        }
        out
    }

    /// Every known tool, including those of hidden servers.
    pub async fn last_known(&self) -> Vec<ToolSnapshot> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for server in &inner.order {
            if let Some(entry) = inner.servers.get(server) {
                out.extend(entry.tools.iter().cloned());
            }
        }
        out
    }

    /// Configured server order.
    pub async fn order(&self) -> Vec<ServerId> {
        self.inner.read().await.order.clone()
    }

    /// Visible tool count for one server, if it has an entry.
    pub async fn server_tools(&self, server: &ServerId) -> Option<(bool, usize, u64)> {
        let inner = self.inner.read().await;
        inner
            .servers
            .get(server)
            .map(|e| (e.visible, e.tools.len(), e.generation))
    }
}
