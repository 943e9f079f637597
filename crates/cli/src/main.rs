//! `cdn-workflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — check a workflow JSON file and print its ready sets.
//! - `run`      — dry-run a workflow JSON file and print the final execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use engine::{EngineConfig, WorkflowDefinition, WorkflowEngine, WorkflowState};
use tools::DryRunExecutor;

#[derive(Parser)]
#[command(
    name = "cdn-workflow",
    about = "Multi-step CDN workflow orchestration",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow against the dry-run executor (no provider calls).
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Runtime context as an inline JSON object.
        #[arg(long, default_value = "{}")]
        context: String,
        /// Maximum number of steps running at once.
        #[arg(long, env = "CDN_WORKFLOW_MAX_CONCURRENCY")]
        max_concurrency: Option<usize>,
        /// Enforce the workflow's maxDuration as a hard timeout.
        #[arg(long, env = "CDN_WORKFLOW_ENFORCE_MAX_DURATION")]
        enforce_max_duration: bool,
    },
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let workflow = load_workflow(&path)?;
            engine::validate_definition(&workflow)?;

            match engine::compute_ready_sets(&workflow.steps) {
                Ok(sets) => {
                    println!("✅ Workflow '{}' is valid. Ready sets:", workflow.id);
                    for (i, set) in sets.iter().enumerate() {
                        println!("  {}: {}", i + 1, set.join(", "));
                    }
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run {
            path,
            context,
            max_concurrency,
            enforce_max_duration,
        } => {
            let workflow = load_workflow(&path)?;
            let context: Value =
                serde_json::from_str(&context).context("--context must be a JSON value")?;

            let config = EngineConfig {
                max_concurrency,
                enforce_max_duration,
                ..EngineConfig::default()
            };
            let engine = WorkflowEngine::new(Arc::new(DryRunExecutor), config);

            let workflow_id = workflow.id.clone();
            engine.register_workflow(workflow)?;
            info!("Running workflow {workflow_id} in dry-run mode");

            let execution = engine.execute_workflow(&workflow_id, Some(context)).await?;
            println!("{}", serde_json::to_string_pretty(&execution)?);

            if execution.state != WorkflowState::Completed {
                bail!("execution ended in state {}", execution.state);
            }
        }
    }

    Ok(())
}
