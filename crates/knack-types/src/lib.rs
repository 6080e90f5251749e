//! Shared identifier types for Knack.
//!
//! Every crate in the workspace speaks in terms of these ids; keeping them in
//! one leaf crate avoids string/uuid mixups at the seams between the
//! connection manager, the workflow engine, and the chat layer.

pub mod id;

pub use id::{RunId, ServerId, StepId, ThreadId, UserId, WorkflowId};
