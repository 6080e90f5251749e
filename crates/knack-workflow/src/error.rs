//! Error types for workflow validation, execution, and storage.

use knack_mcp::CallError;
use knack_types::{RunId, StepId, WorkflowId};
use thiserror::Error;

/// Structural problems found when a workflow definition is checked.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("duplicate step id '{step}'")]
    DuplicateStep { step: StepId },

    #[error("step '{step}' names no tool")]
    MissingTool { step: StepId },

    #[error("step '{step}' references unknown step '{reference}'")]
    UnknownStep { step: StepId, reference: StepId },

    #[error("step '{step}' depends on itself")]
    SelfReference { step: StepId },

    #[error("dependency cycle among steps: {}", join_steps(.steps))]
    Cycle { steps: Vec<StepId> },
}

fn join_steps(steps: &[StepId]) -> String {
    steps
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a single step failed.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("no connected server advertises tool '{name}'")]
    ToolUnavailable { name: String },

    /// Arguments could not be assembled, including the case where an
    /// upstream step failed and left no output to read.
    #[error("input binding failed: {message}")]
    Binding { message: String },

    #[error(transparent)]
    Call(#[from] CallError),
}

/// Failures starting or addressing a run.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown workflow {id}")]
    UnknownWorkflow { id: WorkflowId },

    #[error("unknown run {id}")]
    UnknownRun { id: RunId },

    #[error("workflow {id} is not executable by user '{user}'")]
    NotExecutable { id: WorkflowId, user: String },

    #[error("workflow failed validation: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Workflow and run persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("workflow {id} not found")]
    NotFound { id: WorkflowId },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
