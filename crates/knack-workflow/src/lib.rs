//! User-defined workflows: DAGs of tool-call steps and the engine
//! that runs them.
//!
//! A [`Workflow`] names its steps, how their inputs are bound, and
//! what happens when one fails. [`validate`] checks the graph and
//! produces a deterministic execution order; the [`Engine`] drives
//! runs against the tool layer through the [`ToolInvoker`] seam,
//! reporting progress through broadcast events and a [`ThreadSink`].
//! Run records and definitions persist through a [`WorkflowStore`].

pub mod definition;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod run;
pub mod schema;
pub mod session;
pub mod sink;
pub mod store;
pub mod validate;

pub use definition::{Binding, FailurePolicy, Visibility, Workflow, WorkflowStep};
pub use engine::{Engine, EngineConfig, RunEvent};
pub use error::{EngineError, StepError, StoreError, ValidationError};
pub use invoker::ToolInvoker;
pub use run::{RunStatus, StepStatus, TriggerContext, WorkflowRun};
pub use session::{EnvSession, SessionProvider, StaticSession};
pub use sink::{NullSink, RunUpdate, ThreadSink};
pub use store::{FileWorkflowStore, WorkflowStore};
pub use validate::validate;

/// Boxed future used by the collaborator traits so they stay
/// object-safe.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
