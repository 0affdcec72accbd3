use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evoflow_agents::AgentRegistry;
use evoflow_core::config::{AppConfig, FailurePolicy};
use evoflow_core::event::ExecutionEvents;
use evoflow_core::types::{
    EngineEvent, ExecutionId, ExecutionStatus, ResumeSignal, TaskStatus, WorkflowExecution,
};
use evoflow_engine::{WorkflowDag, WorkflowEngine};
use evoflow_store::SqliteRecorder;

#[derive(Parser)]
#[command(name = "evoflow", version, about = "DAG workflow engine for AI agent pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "evoflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition and wait for it to finish
    Run {
        /// Workflow file (.json or .toml)
        workflow: PathBuf,
        /// Initial input payload as inline JSON
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        /// Read the initial input payload from a JSON file
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Override the configured failure policy
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
        /// Override the configured concurrency limit
        #[arg(long)]
        concurrency: Option<usize>,
        /// Approve every node that asks for human input
        #[arg(long)]
        auto_approve: bool,
    },
    /// Check a workflow definition without running it
    Validate {
        workflow: PathBuf,
    },
    /// Print the execution waves of a workflow
    Plan {
        workflow: PathBuf,
    },
    /// List registered agent types
    Agents,
    /// Show a recorded execution
    Show {
        execution_id: String,
    },
    /// List recent executions
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    FailFast,
    BestEffort,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::FailFast => FailurePolicy::FailFast,
            PolicyArg::BestEffort => FailurePolicy::BestEffort,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("evoflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "evoflow", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            workflow,
            input,
            input_file,
            policy,
            concurrency,
            auto_approve,
        } => {
            if let Some(policy) = policy {
                config.engine.failure_policy = policy.into();
            }
            if let Some(n) = concurrency {
                anyhow::ensure!(n > 0, "--concurrency must be at least 1");
                config.engine.max_concurrency = n;
            }
            let input = read_input(input.as_deref(), input_file.as_deref())?;
            let dag = WorkflowDag::load(&workflow)?;
            let execution = run_workflow(config, dag, input, auto_approve).await?;

            println!("{}", serde_json::to_string_pretty(&execution)?);
            if execution.status != ExecutionStatus::Succeeded {
                anyhow::bail!(
                    "execution {} {}: {}",
                    execution.execution_id,
                    execution.status,
                    execution.error_summary.as_deref().unwrap_or("no details")
                );
            }
        }
        Commands::Validate { workflow } => {
            let dag = WorkflowDag::load(&workflow)?;
            dag.validate()?;
            let registry = AgentRegistry::with_builtins();
            let unknown: Vec<&str> = dag
                .nodes
                .iter()
                .map(|n| n.agent_type.as_str())
                .filter(|t| !registry.contains(t))
                .collect();
            for agent_type in &unknown {
                eprintln!("warning: agent type '{}' is not registered", agent_type);
            }
            println!(
                "{}: {} nodes, {} roots, valid",
                dag.name.as_deref().unwrap_or("workflow"),
                dag.len(),
                dag.roots().len()
            );
        }
        Commands::Plan { workflow } => {
            let dag = WorkflowDag::load(&workflow)?;
            for (i, wave) in dag.topological_levels()?.iter().enumerate() {
                println!("wave {}: {}", i + 1, wave.join(", "));
            }
        }
        Commands::Agents => {
            for agent in AgentRegistry::with_builtins().describe() {
                println!("{:<12} {}", agent.agent_type, agent.description);
            }
        }
        Commands::Show { execution_id } => {
            let store = SqliteRecorder::open(&config.store_path())?;
            let execution = store
                .load_execution(&ExecutionId::from_string(&execution_id))?
                .with_context(|| format!("no recorded execution '{}'", execution_id))?;
            println!("{}", serde_json::to_string_pretty(&execution)?);
        }
        Commands::History { limit } => {
            let store = SqliteRecorder::open(&config.store_path())?;
            let executions = store.list_executions(limit)?;
            if executions.is_empty() {
                println!("No executions recorded.");
            }
            for e in executions {
                println!(
                    "{}  {:<14} {:<24} {:>3} tasks  {}",
                    e.execution_id,
                    e.status.as_str(),
                    e.workflow_name.as_deref().unwrap_or("-"),
                    e.task_count,
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load `path`, else `~/.evoflow/config.toml`, else defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".evoflow").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

fn read_input(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<Value> {
    match (inline, file) {
        (Some(text), _) => serde_json::from_str(text).context("--input is not valid JSON"),
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", path.display()))
        }
        (None, None) => Ok(Value::Object(Default::default())),
    }
}

async fn run_workflow(
    config: AppConfig,
    dag: WorkflowDag,
    input: Value,
    auto_approve: bool,
) -> anyhow::Result<WorkflowExecution> {
    let mut engine = WorkflowEngine::new(AgentRegistry::with_builtins(), config.clone());
    if config.store.enabled {
        let store = SqliteRecorder::open(&config.store_path())?;
        engine = engine.with_recorder(Arc::new(store));
    }
    let engine = Arc::new(engine);

    // Subscribe before the scheduler starts so no event is missed
    let execution_id = ExecutionId::new();
    let events = engine.event_bus().subscribe_execution(execution_id.clone());
    engine.submit_with_id(execution_id.clone(), dag, input).await?;
    eprintln!("[execution {}]", execution_id);

    let monitor = tokio::spawn(monitor_events(engine.clone(), events, auto_approve));

    let cancel_engine = engine.clone();
    let cancel_id = execution_id.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[cancelling...]");
            if let Err(e) = cancel_engine.cancel(&cancel_id).await {
                warn!(error = %e, "Cancel failed");
            }
        }
    });

    let execution = engine.wait(&execution_id).await?;
    ctrl_c.abort();
    monitor.abort();
    engine.shutdown();
    Ok(execution)
}

/// Print progress to stderr and answer approval requests.
async fn monitor_events(
    engine: Arc<WorkflowEngine>,
    mut events: ExecutionEvents,
    auto_approve: bool,
) {
    let execution_id = events.execution_id().clone();
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::TaskStatusChanged {
                node_id,
                status,
                attempt,
                error,
                ..
            } => match (status, error) {
                (TaskStatus::Running, _) => eprintln!("[{}: running, attempt {}]", node_id, attempt),
                (_, Some(error)) => eprintln!("[{}: {}] {}", node_id, status, error),
                _ => eprintln!("[{}: {}]", node_id, status),
            },
            EngineEvent::TaskRetrying {
                node_id,
                attempt,
                delay_ms,
                error,
                ..
            } => {
                eprintln!(
                    "[{}: attempt {} failed, retrying in {}ms] {}",
                    node_id, attempt, delay_ms, error
                );
            }
            EngineEvent::ApprovalRequested { node_id, input, .. } => {
                let signal = if auto_approve {
                    eprintln!("[APPROVAL] {} auto-approved", node_id);
                    ResumeSignal::Approve { payload: input }
                } else {
                    ask_approval(node_id.clone(), input).await
                };
                if let Err(e) = engine.resume(&execution_id, &node_id, signal).await {
                    warn!(node_id = %node_id, error = %e, "Failed to deliver approval");
                }
            }
            EngineEvent::ExecutionFinished { status, .. } => {
                eprintln!("[done: {}]", status);
            }
            _ => {}
        }
    }
}

async fn ask_approval(node_id: String, input: Value) -> ResumeSignal {
    eprintln!(
        "\n[APPROVAL] {} wants to continue with:\n{}",
        node_id,
        serde_json::to_string_pretty(&input).unwrap_or_default()
    );
    let approved = tokio::task::spawn_blocking(|| {
        dialoguer::Confirm::new()
            .with_prompt("Approve?")
            .default(true)
            .interact()
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false);

    if approved {
        ResumeSignal::Approve { payload: input }
    } else {
        ResumeSignal::Reject {
            reason: "rejected by operator".into(),
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
