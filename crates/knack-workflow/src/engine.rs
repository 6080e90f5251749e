//! The workflow execution engine.
//!
//! One driver task per run walks the DAG: a step launches once every
//! upstream step is terminal, independent steps run concurrently up
//! to a configured in-flight limit, and failures are handled per step
//! according to its policy. The driver owns the run record; steps and
//! callers see it through a shared handle.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use knack_types::{RunId, StepId, ThreadId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::definition::{Binding, FailurePolicy, Workflow, WorkflowStep};
use crate::error::{EngineError, StepError, StoreError};
use crate::invoker::ToolInvoker;
use crate::run::{RunStatus, StepStatus, TriggerContext, WorkflowRun};
use crate::schema::check_arguments;
use crate::sink::{RunUpdate, ThreadSink};
use crate::store::WorkflowStore;
use crate::validate::validate;

fn default_max_in_flight() -> usize {
    4
}

fn default_step_timeout() -> u64 {
    30_000
}

fn default_run_timeout() -> u64 {
    600_000
}

/// Execution limits, typically from the `[engine]` section of the
/// config file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrently running steps per run.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Tool-call deadline for steps without their own `timeout_ms`.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,
    /// Whole-run deadline; exceeding it aborts the run.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            step_timeout_ms: default_step_timeout(),
            run_timeout_ms: default_run_timeout(),
        }
    }
}

/// Live progress notifications for one run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RunEvent {
    RunStarted,
    StepStarted {
        step: StepId,
    },
    StepFinished {
        step: StepId,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunFinished {
        status: RunStatus,
    },
}

struct ActiveRun {
    record: Arc<Mutex<WorkflowRun>>,
    events: broadcast::Sender<RunEvent>,
    /// Receiver created together with the channel, handed to the first
    /// subscriber so it sees every event from the start of the run.
    first: Mutex<Option<broadcast::Receiver<RunEvent>>>,
    cancel: CancellationToken,
}

/// Starts and tracks workflow runs. Cheap handles to the store, the
/// tool layer, and the sink are shared with every driver task.
pub struct Engine {
    invoker: Arc<dyn ToolInvoker>,
    store: Arc<dyn WorkflowStore>,
    sink: Arc<dyn ThreadSink>,
    config: EngineConfig,
    runs: Mutex<HashMap<RunId, ActiveRun>>,
}

impl Engine {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        store: Arc<dyn WorkflowStore>,
        sink: Arc<dyn ThreadSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            invoker,
            store,
            sink,
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Load, authorize, and validate the workflow, then schedule a run
    /// for it. Returns as soon as the driver task is spawned.
    pub async fn start(
        &self,
        workflow_id: WorkflowId,
        ctx: TriggerContext,
    ) -> Result<RunId, EngineError> {
        let workflow = match self.store.load(workflow_id).await {
            Ok(workflow) => workflow,
            Err(StoreError::NotFound { id }) => return Err(EngineError::UnknownWorkflow { id }),
            Err(err) => return Err(EngineError::Store(err)),
        };
        if !workflow.executable_by(&ctx.user) {
            return Err(EngineError::NotExecutable {
                id: workflow.id,
                user: ctx.user.to_string(),
            });
        }
        // Definitions may have been edited since they were stored, so
        // the DAG is re-checked on every trigger.
        let order = validate(&workflow)?;

        let run = WorkflowRun::new(&workflow, &ctx);
        let run_id = run.id;
        let thread = run.thread.clone();
        let record = Arc::new(Mutex::new(run));
        let (events, first) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        {
            let mut runs = self.runs.lock().await;
            runs.insert(
                run_id,
                ActiveRun {
                    record: record.clone(),
                    events: events.clone(),
                    first: Mutex::new(Some(first)),
                    cancel: cancel.clone(),
                },
            );
        }

        let driver = RunDriver {
            run_id,
            thread,
            workflow: Arc::new(workflow),
            record,
            events,
            cancel,
            invoker: self.invoker.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            config: self.config,
            input: ctx.input,
            // At least one permit or no step could ever start.
            semaphore: Arc::new(Semaphore::new(self.config.max_in_flight.max(1))),
        };
        tokio::spawn(driver.drive(order));
        Ok(run_id)
    }

    /// Snapshot of the run record as it stands right now.
    pub async fn status(&self, run: RunId) -> Result<WorkflowRun, EngineError> {
        let record = {
            let runs = self.runs.lock().await;
            runs.get(&run).map(|active| active.record.clone())
        };
        match record {
            Some(record) => Ok(record.lock().await.clone()),
            None => Err(EngineError::UnknownRun { id: run }),
        }
    }

    /// Subscribe to the run's event stream. The first subscriber gets
    /// every event from the start of the run; later ones join live.
    pub async fn subscribe(
        &self,
        run: RunId,
    ) -> Result<broadcast::Receiver<RunEvent>, EngineError> {
        let runs = self.runs.lock().await;
        let Some(active) = runs.get(&run) else {
            return Err(EngineError::UnknownRun { id: run });
        };
        let taken = active.first.lock().await.take();
        Ok(taken.unwrap_or_else(|| active.events.subscribe()))
    }

    /// Ask a run to stop. In-flight steps are cancelled best-effort;
    /// the run settles into `Failed` once they acknowledge.
    pub async fn cancel(&self, run: RunId) -> Result<(), EngineError> {
        let runs = self.runs.lock().await;
        let Some(active) = runs.get(&run) else {
            return Err(EngineError::UnknownRun { id: run });
        };
        active.cancel.cancel();
        Ok(())
    }
}

/// Mutable driver bookkeeping, separate from the shared handles so the
/// select loop can borrow both at once.
struct DriveState {
    /// Steps not yet launched, in deterministic topological order.
    pending: Vec<StepId>,
    /// Steps that reached a terminal state, whatever it was.
    finished: BTreeSet<StepId>,
    /// Outputs of completed steps, the source for downstream bindings.
    outputs: HashMap<StepId, Value>,
    abort_reason: Option<String>,
    saw_skipped_failure: bool,
}

struct RunDriver {
    run_id: RunId,
    thread: ThreadId,
    workflow: Arc<Workflow>,
    record: Arc<Mutex<WorkflowRun>>,
    events: broadcast::Sender<RunEvent>,
    cancel: CancellationToken,
    invoker: Arc<dyn ToolInvoker>,
    store: Arc<dyn WorkflowStore>,
    sink: Arc<dyn ThreadSink>,
    config: EngineConfig,
    input: Value,
    semaphore: Arc<Semaphore>,
}

impl RunDriver {
    async fn drive(self, order: Vec<StepId>) {
        {
            let mut run = self.record.lock().await;
            run.begin();
        }
        let _ = self.events.send(RunEvent::RunStarted);
        tracing::info!(run = %self.run_id, workflow = %self.workflow.name, "run started");

        let mut st = DriveState {
            pending: order,
            finished: BTreeSet::new(),
            outputs: HashMap::new(),
            abort_reason: None,
            saw_skipped_failure: false,
        };
        let mut tasks: JoinSet<(StepId, StepOutcome)> = JoinSet::new();
        let mut task_steps: HashMap<tokio::task::Id, StepId> = HashMap::new();

        let run_deadline = tokio::time::sleep(Duration::from_millis(self.config.run_timeout_ms));
        tokio::pin!(run_deadline);

        loop {
            self.launch_eligible(&mut st, &mut tasks, &mut task_steps);
            if tasks.is_empty() && st.pending.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if st.abort_reason.is_none() => {
                    self.abort(&mut st, "run cancelled".to_string()).await;
                }
                _ = &mut run_deadline, if st.abort_reason.is_none() => {
                    let reason =
                        format!("run exceeded its {}ms deadline", self.config.run_timeout_ms);
                    self.abort(&mut st, reason).await;
                }
                joined = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    match joined {
                        Some(Ok((task_id, (step, outcome)))) => {
                            task_steps.remove(&task_id);
                            self.handle_outcome(step, outcome, &mut st).await;
                        }
                        Some(Err(join_error)) => {
                            if let Some(step) = task_steps.remove(&join_error.id()) {
                                tracing::error!(run = %self.run_id, step = %step,
                                    "step task panicked");
                                st.finished.insert(step.clone());
                                self.finish_step(
                                    &step,
                                    StepStatus::Failed,
                                    None,
                                    Some("step task panicked".to_string()),
                                )
                                .await;
                                self.abort(&mut st, format!("step '{step}' panicked")).await;
                            }
                        }
                        None => {}
                    }
                }
            }
        }

        self.finalize(st).await;
    }

    /// Launch every pending step whose upstream set is fully terminal.
    /// Launched steps wait on the in-flight semaphore inside their own
    /// task, so this never blocks the driver.
    fn launch_eligible(
        &self,
        st: &mut DriveState,
        tasks: &mut JoinSet<(StepId, StepOutcome)>,
        task_steps: &mut HashMap<tokio::task::Id, StepId>,
    ) {
        if st.abort_reason.is_some() {
            return;
        }
        let mut waiting = Vec::new();
        for id in st.pending.drain(..) {
            let Some(step) = self.workflow.step(&id) else {
                continue;
            };
            if !step.upstream().iter().all(|up| st.finished.contains(*up)) {
                waiting.push(id);
                continue;
            }

            let mut upstream = HashMap::new();
            for binding in step.input.values() {
                if let Binding::Step { step: source, .. } = binding {
                    if let Some(output) = st.outputs.get(source) {
                        upstream.insert(source.clone(), output.clone());
                    }
                }
            }
            let task = StepTask {
                step: step.clone(),
                upstream,
                input: self.input.clone(),
                record: self.record.clone(),
                events: self.events.clone(),
                invoker: self.invoker.clone(),
                semaphore: self.semaphore.clone(),
                cancel: self.cancel.clone(),
                default_deadline_ms: self.config.step_timeout_ms,
            };
            let handle = tasks.spawn(task.run());
            task_steps.insert(handle.id(), id);
        }
        st.pending = waiting;
    }

    async fn handle_outcome(&self, step: StepId, outcome: StepOutcome, st: &mut DriveState) {
        st.finished.insert(step.clone());
        match outcome {
            StepOutcome::Completed(output) => {
                st.outputs.insert(step.clone(), output.clone());
                self.finish_step(&step, StepStatus::Completed, Some(output), None)
                    .await;
            }
            StepOutcome::Cancelled => {
                self.finish_step(&step, StepStatus::Cancelled, None, None)
                    .await;
            }
            StepOutcome::Failed(error) => {
                let policy = self
                    .workflow
                    .step(&step)
                    .map(|s| s.on_error.clone())
                    .unwrap_or_default();
                match policy {
                    FailurePolicy::UseDefault { value } => {
                        tracing::warn!(run = %self.run_id, step = %step, %error,
                            "step failed, substituting its default value");
                        st.outputs.insert(step.clone(), value.clone());
                        self.finish_step(&step, StepStatus::Completed, Some(value), None)
                            .await;
                    }
                    FailurePolicy::SkipAndContinue => {
                        tracing::warn!(run = %self.run_id, step = %step, %error,
                            "step failed, continuing without it");
                        st.saw_skipped_failure = true;
                        self.finish_step(&step, StepStatus::Failed, None, Some(error.to_string()))
                            .await;
                    }
                    FailurePolicy::AbortRun => {
                        tracing::warn!(run = %self.run_id, step = %step, %error,
                            "step failed, aborting the run");
                        self.finish_step(&step, StepStatus::Failed, None, Some(error.to_string()))
                            .await;
                        self.abort(st, format!("step '{step}' failed: {error}")).await;
                    }
                }
            }
        }
    }

    /// Stop launching, signal in-flight steps, and cancel everything
    /// still pending. In-flight steps settle through the join loop.
    async fn abort(&self, st: &mut DriveState, reason: String) {
        if st.abort_reason.is_some() {
            return;
        }
        st.abort_reason = Some(reason);
        self.cancel.cancel();
        let leftovers: Vec<StepId> = st.pending.drain(..).collect();
        for step in leftovers {
            st.finished.insert(step.clone());
            self.finish_step(&step, StepStatus::Cancelled, None, None)
                .await;
        }
    }

    async fn finish_step(
        &self,
        step: &StepId,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        {
            let mut run = self.record.lock().await;
            if let Some(record) = run.steps.get_mut(step) {
                match status {
                    StepStatus::Completed => {
                        record.complete(output.clone().unwrap_or(Value::Null))
                    }
                    StepStatus::Failed => record.fail(error.clone().unwrap_or_default()),
                    StepStatus::Cancelled => record.cancel(),
                    StepStatus::Pending | StepStatus::Running => return,
                }
            }
        }
        let _ = self.events.send(RunEvent::StepFinished {
            step: step.clone(),
            status,
            error: error.clone(),
        });
        self.sink
            .append(
                &self.thread,
                RunUpdate::Step {
                    run: self.run_id,
                    step: step.clone(),
                    status,
                    output,
                    error,
                },
            )
            .await;
    }

    async fn finalize(&self, st: DriveState) {
        let status = if st.abort_reason.is_some() {
            RunStatus::Failed
        } else if st.saw_skipped_failure {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Completed
        };

        // Whatever terminal steps completed is the run's output, even
        // for failed runs: the caller gets to keep partial results.
        let mut aggregate = Map::new();
        for id in self.workflow.terminal_steps() {
            if let Some(output) = st.outputs.get(id) {
                aggregate.insert(id.to_string(), output.clone());
            }
        }
        let output = if aggregate.is_empty() {
            None
        } else {
            Some(Value::Object(aggregate))
        };
        let error = st.abort_reason;

        let snapshot = {
            let mut run = self.record.lock().await;
            run.finish(status, output.clone(), error.clone());
            run.clone()
        };
        self.sink
            .append(
                &self.thread,
                RunUpdate::Run {
                    run: self.run_id,
                    status,
                    output,
                    error,
                },
            )
            .await;
        if let Err(error) = self.store.save_run(&snapshot).await {
            tracing::warn!(run = %self.run_id, %error, "failed to persist run record");
        }
        // The finished event goes out last, once the record is saved
        // and the thread notified; subscribers can read both safely.
        let _ = self.events.send(RunEvent::RunFinished { status });
        tracing::info!(run = %self.run_id, status = ?status, "run finished");
    }
}

enum StepOutcome {
    Completed(Value),
    Failed(StepError),
    Cancelled,
}

struct StepTask {
    step: WorkflowStep,
    upstream: HashMap<StepId, Value>,
    input: Value,
    record: Arc<Mutex<WorkflowRun>>,
    events: broadcast::Sender<RunEvent>,
    invoker: Arc<dyn ToolInvoker>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    default_deadline_ms: u64,
}

impl StepTask {
    async fn run(self) -> (StepId, StepOutcome) {
        let id = self.step.id.clone();
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return (id, StepOutcome::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return (id, StepOutcome::Cancelled),
            },
        };

        {
            let mut run = self.record.lock().await;
            if let Some(record) = run.steps.get_mut(&id) {
                record.begin();
            }
        }
        let _ = self.events.send(RunEvent::StepStarted { step: id.clone() });
        tracing::debug!(step = %id, tool = %self.step.tool, "step started");

        let outcome = self.execute().await;
        drop(permit);
        (id, outcome)
    }

    async fn execute(&self) -> StepOutcome {
        let Some(tool) = self.invoker.resolve(&self.step.tool).await else {
            return StepOutcome::Failed(StepError::ToolUnavailable {
                name: self.step.tool.clone(),
            });
        };
        let arguments = match bind_arguments(&self.step, &self.upstream, &self.input) {
            Ok(arguments) => arguments,
            Err(message) => return StepOutcome::Failed(StepError::Binding { message }),
        };
        if let Err(message) = check_arguments(&tool.input_schema, &arguments) {
            return StepOutcome::Failed(StepError::Binding { message });
        }

        let deadline =
            Duration::from_millis(self.step.timeout_ms.unwrap_or(self.default_deadline_ms));
        tokio::select! {
            _ = self.cancel.cancelled() => StepOutcome::Cancelled,
            result = self.invoker.call(&tool, Value::Object(arguments), deadline) => match result {
                Ok(output) => StepOutcome::Completed(output),
                Err(error) => StepOutcome::Failed(StepError::Call(error)),
            },
        }
    }
}

/// Assemble a step's arguments from its bindings. Upstream outputs are
/// final by the time the step launches, so a missing entry means the
/// source step failed without producing one.
fn bind_arguments(
    step: &WorkflowStep,
    upstream: &HashMap<StepId, Value>,
    input: &Value,
) -> Result<Map<String, Value>, String> {
    let mut arguments = Map::new();
    for (name, binding) in &step.input {
        let value = match binding {
            Binding::Literal { value } => value.clone(),
            Binding::Step { step: source, pointer } => {
                let Some(output) = upstream.get(source) else {
                    return Err(format!("step '{source}' produced no output"));
                };
                let pointer = pointer.as_deref().unwrap_or("");
                output.pointer(pointer).cloned().ok_or_else(|| {
                    format!("step '{source}' output has no value at pointer '{pointer}'")
                })?
            }
            Binding::Input { pointer } => {
                let pointer = pointer.as_deref().unwrap_or("");
                input.pointer(pointer).cloned().ok_or_else(|| {
                    format!("trigger input has no value at pointer '{pointer}'")
                })?
            }
        };
        arguments.insert(name.clone(), value);
    }
    Ok(arguments)
}
