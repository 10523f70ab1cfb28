use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use conductor::core::task::{BatchId, TaskId};
use conductor::orchestrator::ProjectSpec;
use conductor::{clog_error, Config, Error, Orchestrator, Result};

/// Conductor - dependency-aware task orchestration for agent teams
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Submit a project spec (JSON) as a task batch
    Submit {
        /// Path to the project spec file
        spec: PathBuf,

        /// Drive the batch to completion after submitting
        #[arg(long)]
        run: bool,
    },

    /// Show aggregate status of a batch
    Status {
        /// Batch ID returned by submit
        batch_id: String,

        /// Emit machine-readable JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Cancel a batch and all of its non-terminal tasks
    Cancel {
        /// Batch ID to cancel
        batch_id: String,
    },

    /// Approve a task awaiting review
    Approve {
        /// Task ID in the Review state
        task_id: String,
    },

    /// Reject a reviewed result; the task will be re-run
    Reject {
        /// Task ID in the Review state
        task_id: String,

        /// Why the result was rejected
        reason: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);

    if let Err(e) = run(cli).await {
        clog_error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    config.ensure_dirs()?;
    let mut orchestrator = Orchestrator::open(config.clone(), &config.data_dir()?).await?;

    match cli.command {
        Command::Submit { spec, run } => {
            let spec: ProjectSpec = serde_json::from_str(&fs::read_to_string(&spec)?)?;
            let batch_id = orchestrator.submit_project(spec)?;
            println!("{}", batch_id);
            if run {
                orchestrator.run_until_settled(&batch_id).await?;
                print_status(&orchestrator, &batch_id)?;
            }
        }
        Command::Status { batch_id, json } => {
            let batch_id = parse_batch(&batch_id)?;
            if json {
                let status = orchestrator.status(&batch_id)?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&orchestrator, &batch_id)?;
            }
        }
        Command::Cancel { batch_id } => {
            let batch_id = parse_batch(&batch_id)?;
            orchestrator.cancel(&batch_id).await?;
            println!("batch {} cancelled", batch_id.short());
        }
        Command::Approve { task_id } => {
            let task_id = parse_task(&task_id)?;
            orchestrator.approve(&task_id).await?;
            println!("task {} approved", task_id.short());
        }
        Command::Reject { task_id, reason } => {
            let task_id = parse_task(&task_id)?;
            orchestrator.reject(&task_id, &reason).await?;
            println!("task {} rejected: {}", task_id.short(), reason);
        }
    }
    Ok(())
}

fn parse_batch(s: &str) -> Result<BatchId> {
    s.parse()
        .map_err(|_| Error::Validation(format!("invalid batch id: {}", s)))
}

fn parse_task(s: &str) -> Result<TaskId> {
    s.parse()
        .map_err(|_| Error::Validation(format!("invalid task id: {}", s)))
}

fn print_status(orchestrator: &Orchestrator, batch_id: &BatchId) -> Result<()> {
    let status = orchestrator.status(batch_id)?;
    if let Some(description) = &status.description {
        println!("{} ({})", description, batch_id.short());
    } else {
        println!("batch {}", batch_id.short());
    }

    let counts: Vec<String> = status
        .counts
        .iter()
        .map(|(k, v)| format!("{} {}", v, k))
        .collect();
    println!(
        "{} task(s): {}{}",
        status.tasks.len(),
        counts.join(", "),
        if status.settled { " [settled]" } else { "" }
    );

    for task in &status.tasks {
        let agent = task
            .assigned_agent
            .map(|a| a.short())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {:<12} {:<9} attempt {}/{}  agent {}  {}",
            task.id.short(),
            format!("{}", task.status),
            format!("{}", task.priority),
            task.attempt,
            task.max_attempts,
            agent,
            task.capability
        );
        if let Some(error) = &task.error {
            println!("      error [{}]: {}", error.kind, error.message);
        }
    }

    if !status.decisions.is_empty() {
        println!("decisions:");
        for decision in &status.decisions {
            println!("  {}  {}", decision.task_id.short(), decision.rationale);
        }
    }
    Ok(())
}
