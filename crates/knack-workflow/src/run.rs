//! Run records: everything the engine learns while executing a
//! workflow, kept both for live status queries and for persistence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use knack_types::{RunId, StepId, ThreadId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::Workflow;

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    /// Some steps failed under a skip-and-continue policy while the
    /// rest completed.
    PartiallyFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::PartiallyFailed
        )
    }
}

/// Lifecycle of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

/// What triggered a run, and with which payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerContext {
    pub thread: ThreadId,
    pub user: UserId,
    #[serde(default)]
    pub input: Value,
}

/// Per-step outcome kept on the run record. Outputs and errors are
/// retained for every step, whether or not the run's aggregated
/// output includes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn begin(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self, output: Value) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: String) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn cancel(&mut self) {
        self.status = StepStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}

/// Everything recorded about one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow: WorkflowId,
    pub thread: ThreadId,
    pub user: UserId,
    pub status: RunStatus,
    pub steps: BTreeMap<StepId, StepRecord>,
    /// Aggregated outputs of completed terminal steps, keyed by step
    /// id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(workflow: &Workflow, ctx: &TriggerContext) -> Self {
        Self {
            id: RunId::new(),
            workflow: workflow.id,
            thread: ctx.thread.clone(),
            user: ctx.user.clone(),
            status: RunStatus::Scheduled,
            steps: workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepRecord::pending()))
                .collect(),
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn step(&self, id: &StepId) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    pub(crate) fn begin(&mut self) {
        self.status = RunStatus::Running;
    }

    pub(crate) fn finish(
        &mut self,
        status: RunStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        self.status = status;
        self.output = output;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}
