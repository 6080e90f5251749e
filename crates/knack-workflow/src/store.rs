//! Persistent workflow and run storage backed by JSON files.

use std::path::{Path, PathBuf};

use knack_types::{UserId, WorkflowId};

use crate::definition::Workflow;
use crate::error::StoreError;
use crate::run::WorkflowRun;
use crate::validate::validate;
use crate::BoxFuture;

/// Where the engine reads definitions from and writes run records to.
/// Boxed futures keep the trait object-safe for `Arc<dyn WorkflowStore>`.
pub trait WorkflowStore: Send + Sync {
    fn load(&self, id: WorkflowId) -> BoxFuture<'_, Result<Workflow, StoreError>>;

    /// Workflows the given user may trigger, newest first.
    fn list_executable<'a>(
        &'a self,
        user: &'a UserId,
    ) -> BoxFuture<'a, Result<Vec<Workflow>, StoreError>>;

    /// Persist a definition. Definitions that fail validation are
    /// rejected here so the store never holds an unrunnable workflow.
    fn save<'a>(&'a self, workflow: &'a Workflow) -> BoxFuture<'a, Result<(), StoreError>>;

    fn save_run<'a>(&'a self, run: &'a WorkflowRun) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// File-based store. Each workflow is a JSON file under `workflows/`,
/// each finished run a JSON file under `runs/`.
pub struct FileWorkflowStore {
    workflows_dir: PathBuf,
    runs_dir: PathBuf,
}

impl FileWorkflowStore {
    /// Create a store under `data_dir`, ensuring both directories exist.
    pub async fn new(data_dir: PathBuf) -> Result<Self, StoreError> {
        let workflows_dir = data_dir.join("workflows");
        let runs_dir = data_dir.join("runs");
        tokio::fs::create_dir_all(&workflows_dir).await?;
        tokio::fs::create_dir_all(&runs_dir).await?;
        Ok(Self {
            workflows_dir,
            runs_dir,
        })
    }

    /// Save a workflow to disk (atomic write: .tmp then rename).
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        validate(workflow)?;
        let path = self.workflow_path(workflow.id);
        write_atomic(&path, serde_json::to_string_pretty(workflow)?).await
    }

    pub async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        let path = self.workflow_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound { id });
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&data)?)
    }

    /// List every stored workflow, sorted by `updated_at` descending.
    /// Files that fail to read or parse are skipped with a warning so
    /// one bad entry cannot hide the rest.
    pub async fn list_all(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.workflows_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if !name_str.ends_with(".json") {
                continue;
            }
            match tokio::fs::read_to_string(entry.path()).await {
                Ok(data) => match serde_json::from_str::<Workflow>(&data) {
                    Ok(workflow) => workflows.push(workflow),
                    Err(error) => {
                        tracing::warn!(file = %name_str, %error, "skipping unparseable workflow file");
                    }
                },
                Err(error) => {
                    tracing::warn!(file = %name_str, %error, "skipping unreadable workflow file");
                }
            }
        }

        workflows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(workflows)
    }

    pub async fn save_run_record(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let path = self.runs_dir.join(format!("{}.json", run.id));
        write_atomic(&path, serde_json::to_string_pretty(run)?).await
    }

    fn workflow_path(&self, id: WorkflowId) -> PathBuf {
        self.workflows_dir.join(format!("{id}.json"))
    }
}

async fn write_atomic(path: &Path, json: String) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

impl WorkflowStore for FileWorkflowStore {
    fn load(&self, id: WorkflowId) -> BoxFuture<'_, Result<Workflow, StoreError>> {
        Box::pin(self.load_workflow(id))
    }

    fn list_executable<'a>(
        &'a self,
        user: &'a UserId,
    ) -> BoxFuture<'a, Result<Vec<Workflow>, StoreError>> {
        Box::pin(async move {
            let all = self.list_all().await?;
            Ok(all.into_iter().filter(|w| w.executable_by(user)).collect())
        })
    }

    fn save<'a>(&'a self, workflow: &'a Workflow) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.save_workflow(workflow))
    }

    fn save_run<'a>(&'a self, run: &'a WorkflowRun) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.save_run_record(run))
    }
}
