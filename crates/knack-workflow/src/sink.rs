//! Posting run progress back into the conversation that triggered it.
//!
//! The engine reports through a [`ThreadSink`] so the chat surface
//! stays out of this crate. Delivery is fire-and-forget: a sink that
//! fails to post logs the failure itself rather than stalling the run.

use knack_types::{RunId, StepId, ThreadId};
use serde::Serialize;
use serde_json::Value;

use crate::run::{RunStatus, StepStatus};
use crate::BoxFuture;

/// One progress notice destined for a thread.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RunUpdate {
    /// A step reached a terminal state.
    Step {
        run: RunId,
        step: StepId,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The run itself reached a terminal state.
    Run {
        run: RunId,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

pub trait ThreadSink: Send + Sync {
    fn append<'a>(&'a self, thread: &'a ThreadId, update: RunUpdate) -> BoxFuture<'a, ()>;
}

/// Discards every update. Useful for runs nobody is watching and in
/// tests that assert on run records instead.
pub struct NullSink;

impl ThreadSink for NullSink {
    fn append<'a>(&'a self, _thread: &'a ThreadId, _update: RunUpdate) -> BoxFuture<'a, ()> {
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_tag_their_kind() {
        let update = RunUpdate::Step {
            run: RunId::new(),
            step: StepId::new("a"),
            status: StepStatus::Completed,
            output: Some(serde_json::json!({"ok": true})),
            error: None,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["kind"], "step");
        assert_eq!(json["status"], "completed");
        assert!(json.get("error").is_none());
    }
}
