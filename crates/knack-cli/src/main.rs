//! knack CLI: inspect tool servers, manage workflows, trigger runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use knack_mcp::{ConfigError, McpConfig, McpManager};
use knack_types::{ThreadId, UserId, WorkflowId};
use knack_workflow::{
    validate, BoxFuture, Engine, EngineConfig, EnvSession, FileWorkflowStore, RunEvent, RunStatus,
    RunUpdate, SessionProvider, StaticSession, StepStatus, ThreadSink, TriggerContext, Visibility,
    Workflow, WorkflowStep,
};
use serde::Deserialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "knack", version, about = "Tool-server connections and workflow runs for chat")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "knack.toml")]
    config: PathBuf,

    /// Directory holding stored workflows and run records
    #[arg(long, default_value = ".knack")]
    data_dir: PathBuf,

    /// Act as this user (overrides $KNACK_USER)
    #[arg(long)]
    user: Option<String>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured servers and show their status
    Servers,
    /// List the tools the connected servers advertise
    Tools {
        /// Include last-known tools of degraded servers
        #[arg(long)]
        all: bool,
    },
    /// Check a workflow definition file without storing it
    Validate {
        /// Path to a workflow JSON file
        file: PathBuf,
    },
    /// Validate a workflow definition file and store it
    Add {
        /// Path to a workflow JSON file
        file: PathBuf,
    },
    /// List stored workflows
    List,
    /// Trigger a workflow and stream its progress
    Run {
        /// Workflow id or name
        workflow: String,
        /// Trigger input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// Thread the run reports into
        #[arg(long, default_value = "cli")]
        thread: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli {
        config,
        data_dir,
        user,
        verbose: _,
        command,
    } = cli;

    match command {
        Commands::Servers => servers(&config).await,
        Commands::Tools { all } => tools(&config, all).await,
        Commands::Validate { file } => validate_file(&file),
        Commands::Add { file } => add_workflow(&data_dir, &file, &user).await,
        Commands::List => list_workflows(&data_dir, &user).await,
        Commands::Run {
            workflow,
            input,
            thread,
        } => run_workflow(&config, &data_dir, &user, &workflow, &input, thread).await,
    }
}

// ---------------------------------------------------------------------------
// Configuration & identity
// ---------------------------------------------------------------------------

struct Settings {
    mcp: McpConfig,
    engine: EngineConfig,
}

/// The `[engine]` table of the same file `McpConfig` reads; missing
/// fields fall back to engine defaults.
#[derive(Default, Deserialize)]
struct EngineSection {
    #[serde(default)]
    engine: EngineConfig,
}

async fn load_settings(path: &Path) -> Result<Settings> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mcp = McpConfig::from_toml(&text, path)?;
    if mcp.servers.is_empty() {
        return Err(ConfigError::NoServers {
            path: path.to_path_buf(),
        }
        .into());
    }
    let engine = toml::from_str::<EngineSection>(&text)
        .with_context(|| format!("invalid [engine] section in {}", path.display()))?
        .engine;
    Ok(Settings { mcp, engine })
}

fn session(user: &Option<String>) -> Box<dyn SessionProvider> {
    match user {
        Some(user) => Box::new(StaticSession(UserId::new(user.clone()))),
        None => Box::new(EnvSession::new()),
    }
}

fn require_user(session: &dyn SessionProvider) -> Result<UserId> {
    session
        .current_user()
        .context("no acting user: pass --user or set KNACK_USER")
}

async fn open_store(data_dir: &Path) -> Result<Arc<FileWorkflowStore>> {
    Ok(Arc::new(
        FileWorkflowStore::new(data_dir.to_path_buf()).await?,
    ))
}

// ---------------------------------------------------------------------------
// Server commands
// ---------------------------------------------------------------------------

async fn servers(config_path: &Path) -> Result<()> {
    let settings = load_settings(config_path).await?;
    let manager = McpManager::start(settings.mcp).await;

    for status in manager.status().await {
        let error = status
            .last_error
            .map(|e| format!("  ({e})"))
            .unwrap_or_default();
        println!(
            "{:<20} {:<12} gen {:<3} {} tools{}",
            status.id, status.state, status.generation, status.tools, error
        );
    }

    manager.shutdown().await;
    Ok(())
}

async fn tools(config_path: &Path, all: bool) -> Result<()> {
    let settings = load_settings(config_path).await?;
    let manager = McpManager::start(settings.mcp).await;

    let tools = if all {
        manager.last_known_tools().await
    } else {
        manager.tools().await
    };
    if tools.is_empty() {
        eprintln!("no tools advertised");
    }
    for tool in tools {
        if tool.description.is_empty() {
            println!("{}", tool.qualified_name());
        } else {
            println!("{:<32} {}", tool.qualified_name(), tool.description);
        }
    }

    manager.shutdown().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Workflow commands
// ---------------------------------------------------------------------------

/// Authoring shape of a definition file: like a stored workflow but
/// without the server-assigned parts. A present `id` updates the
/// stored definition instead of creating a new one.
#[derive(Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    id: Option<WorkflowId>,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    visibility: Visibility,
    steps: Vec<WorkflowStep>,
}

fn read_workflow_file(file: &Path, owner: UserId) -> Result<Workflow> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let parsed: WorkflowFile = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid workflow definition", file.display()))?;

    let mut workflow = Workflow::new(parsed.name, owner);
    if let Some(id) = parsed.id {
        workflow.id = id;
    }
    workflow.description = parsed.description;
    workflow.visibility = parsed.visibility;
    workflow.steps = parsed.steps;
    Ok(workflow)
}

fn validate_file(file: &Path) -> Result<()> {
    let workflow = read_workflow_file(file, UserId::new("unsaved"))?;
    let order = validate(&workflow)?;
    println!("{}: valid ({} steps)", file.display(), workflow.steps.len());
    println!(
        "execution order: {}",
        order
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

async fn add_workflow(data_dir: &Path, file: &Path, user: &Option<String>) -> Result<()> {
    let owner = require_user(session(user).as_ref())?;
    let workflow = read_workflow_file(file, owner)?;

    let store = open_store(data_dir).await?;
    store.save_workflow(&workflow).await?;
    println!("stored workflow '{}' ({})", workflow.name, workflow.id);
    Ok(())
}

async fn list_workflows(data_dir: &Path, user: &Option<String>) -> Result<()> {
    let store = open_store(data_dir).await?;
    let current = session(user).current_user();

    let workflows = store.list_all().await?;
    if workflows.is_empty() {
        eprintln!("no stored workflows");
        return Ok(());
    }
    for workflow in workflows {
        let visibility = match workflow.visibility {
            Visibility::Private => "private",
            Visibility::ExecutableByOwner => "owner-only",
            Visibility::Shared => "shared",
        };
        let runnable = match &current {
            Some(user) if workflow.executable_by(user) => "  runnable",
            _ => "",
        };
        println!(
            "{:<24} {}  {:>2} steps  {:<10}{}",
            workflow.name,
            workflow.id,
            workflow.steps.len(),
            visibility,
            runnable
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run command
// ---------------------------------------------------------------------------

/// Prints step and run results as they land; for a CLI run the
/// terminal stands in for the chat thread.
struct StdoutSink;

impl ThreadSink for StdoutSink {
    fn append<'a>(&'a self, _thread: &'a ThreadId, update: RunUpdate) -> BoxFuture<'a, ()> {
        match update {
            RunUpdate::Step {
                step,
                status,
                error,
                ..
            } => match error {
                Some(error) => println!("  {step}: {} ({error})", step_label(status)),
                None => println!("  {step}: {}", step_label(status)),
            },
            RunUpdate::Run { status, error, .. } => match error {
                Some(error) => println!("run {} ({error})", run_label(status)),
                None => println!("run {}", run_label(status)),
            },
        }
        Box::pin(std::future::ready(()))
    }
}

fn step_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
        StepStatus::Cancelled => "cancelled",
    }
}

fn run_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Scheduled => "scheduled",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::PartiallyFailed => "partially failed",
    }
}

async fn resolve_workflow(store: &FileWorkflowStore, reference: &str) -> Result<Workflow> {
    if let Ok(id) = WorkflowId::parse(reference) {
        return Ok(store.load_workflow(id).await?);
    }
    let mut matches: Vec<Workflow> = store
        .list_all()
        .await?
        .into_iter()
        .filter(|w| w.name == reference)
        .collect();
    match matches.len() {
        0 => bail!("no workflow named '{reference}'"),
        1 => Ok(matches.remove(0)),
        count => bail!("workflow name '{reference}' is ambiguous ({count} matches); use its id"),
    }
}

async fn run_workflow(
    config_path: &Path,
    data_dir: &Path,
    user: &Option<String>,
    reference: &str,
    input: &str,
    thread: String,
) -> Result<()> {
    let user = require_user(session(user).as_ref())?;
    let input: Value = serde_json::from_str(input).context("trigger input is not valid JSON")?;

    let settings = load_settings(config_path).await?;
    let store = open_store(data_dir).await?;
    let workflow = resolve_workflow(store.as_ref(), reference).await?;

    let manager = McpManager::start(settings.mcp).await;
    let engine = Engine::new(
        manager.clone(),
        store.clone(),
        Arc::new(StdoutSink),
        settings.engine,
    );

    let run = engine
        .start(
            workflow.id,
            TriggerContext {
                thread: ThreadId::new(thread),
                user,
                input,
            },
        )
        .await?;
    eprintln!("run {run} of '{}' started", workflow.name);

    let mut events = engine.subscribe(run).await?;
    loop {
        use tokio::sync::broadcast::error::RecvError;
        match events.recv().await {
            Ok(RunEvent::RunFinished { .. }) | Err(RecvError::Closed) => break,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
        }
    }

    let record = engine.status(run).await?;
    if let Some(output) = &record.output {
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    manager.shutdown().await;

    if record.status == RunStatus::Failed {
        bail!("run {run} did not complete");
    }
    Ok(())
}
