use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use cibench::bench::report;
use cibench::config::AppConfig;
use cibench::status::{format_timestamp, ExecutionStatus};
use cibench::Services;

#[derive(Parser)]
#[command(
    name = "cibench",
    about = "Trigger, track and benchmark two-stage CI pipelines",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "CIBENCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + resumed execution tracking)
    Serve {
        /// Bind address, overrides [api] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Trigger a pipeline for a target
    Trigger {
        /// Target name
        target: String,

        /// Git ref to run on, overrides [tracker.execution] branch
        #[arg(long)]
        branch: Option<String>,

        /// Poll until the execution reaches a terminal status
        #[arg(long)]
        wait: bool,
    },

    /// Cancel a running execution
    Stop {
        /// Execution id
        id: String,
    },

    /// Inspect or delete execution history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Run the benchmark task catalogue
    Bench {
        #[command(subcommand)]
        action: BenchAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List executions, newest first
    List {
        /// Only executions of this target
        #[arg(long)]
        target: Option<String>,
    },

    /// Show one execution with its logs
    Show {
        /// Execution id
        id: String,
    },

    /// Delete one execution or the whole history of a target
    Delete {
        /// Execution id
        #[arg(long, conflicts_with = "target")]
        id: Option<String>,

        /// Target name
        #[arg(long)]
        target: Option<String>,
    },
}

#[derive(Subcommand)]
enum BenchAction {
    /// Run every task from the start (Ctrl-C stops the run)
    Run {
        /// Trials per task, overrides [benchmark] trial_count
        #[arg(long)]
        trials: Option<u32>,
    },

    /// List archived task results
    Results {
        /// Only results of this task
        #[arg(long)]
        task: Option<String>,
    },

    /// Delete every archived result
    Purge,
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(),
    };
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting cibench daemon");
            cibench::serve(&config).await?;
        }
        Commands::Trigger {
            target,
            branch,
            wait,
        } => {
            if let Some(branch) = branch {
                config.tracker.execution.branch = branch;
            }
            let services = Services::open(&config).await?;
            let tracker = &services.tracker;

            let id = tracker
                .trigger(&target)
                .await
                .with_context(|| format!("failed to trigger '{}'", target))?;
            println!("Triggered execution {} for {}", id, target);

            if wait {
                let status = tracker.poll_until_terminal(&id).await?;
                println!("Execution {} finished: {}", id, status);
                if status != ExecutionStatus::Completed {
                    std::process::exit(1);
                }
            }
        }
        Commands::Stop { id } => {
            let services = Services::open(&config).await?;
            let status = services.tracker.stop(&id).await?;
            println!("Execution {}: {}", id, status);
        }
        Commands::History { action } => {
            let services = Services::open(&config).await?;
            let store = services.tracker.store();

            match action {
                HistoryAction::List { target } => {
                    let list = match target {
                        Some(t) => store.get_by_target_name(&t).await?,
                        None => store.get_all().await?,
                    };
                    if list.is_empty() {
                        println!("No executions found.");
                    } else {
                        println!(
                            "{:<36} | {:<20} | {:<10} | {:<10} | Created",
                            "Id", "Target", "Job", "Status"
                        );
                        println!("{:-<36}-|-{:-<20}-|-{:-<10}-|-{:-<10}-|-{:-<25}", "", "", "", "", "");
                        for e in list {
                            println!(
                                "{:<36} | {:<20} | {:<10} | {:<10} | {}",
                                e.id,
                                e.target_name,
                                e.job_id,
                                e.status,
                                format_timestamp(e.created_at)
                            );
                        }
                    }
                }
                HistoryAction::Show { id } => {
                    let Some(e) = store.get_by_id(&id).await? else {
                        bail!("execution '{}' not found", id);
                    };
                    println!("Execution: {}", e.id);
                    println!("Target:    {}", e.target_name);
                    println!("Job:       {} (child {})", e.job_id, e.child_job_id());
                    println!("Status:    {}", e.status);
                    println!("Created:   {}", format_timestamp(e.created_at));
                    for log in &e.job_logs {
                        println!("\n=== {} ===\n{}", log.job_name, log.log);
                    }
                }
                HistoryAction::Delete { id, target } => match (id, target) {
                    (Some(id), _) => {
                        if services.tracker.delete(&id).await? {
                            println!("Execution '{}' deleted.", id);
                        } else {
                            println!("Execution '{}' not found.", id);
                        }
                    }
                    (None, Some(target)) => {
                        let removed = services.tracker.delete_target(&target).await?;
                        println!("Deleted {} execution(s) of '{}'.", removed, target);
                    }
                    (None, None) => bail!("pass --id or --target"),
                },
            }
        }
        Commands::Bench { action } => {
            let services = Services::open(&config).await?;

            match action {
                BenchAction::Run { trials } => {
                    let orch = services.orchestrator.clone();
                    if let Some(trials) = trials {
                        let mut settings = orch.settings();
                        settings.trial_count = trials;
                        orch.set_settings(settings)?;
                    }

                    let stopper = orch.clone();
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            tracing::warn!("Interrupted, stopping benchmark");
                            stopper.stop_all().await;
                        }
                    });

                    orch.start().await?;

                    println!("\n=== cibench Benchmark Summary ===");
                    for task in orch.tasks() {
                        println!("{}", report::format_summary(&task));
                        for (n, trial) in task.trials.iter().enumerate() {
                            if let Some(err) = trial.display_error() {
                                println!("  trial {}: {}", n + 1, err);
                            }
                        }
                    }
                    println!("=================================\n");
                }
                BenchAction::Results { task } => {
                    let list = match task {
                        Some(name) => services.measurements.get_by_task_name(&name).await?,
                        None => services.measurements.get_all().await?,
                    };
                    if list.is_empty() {
                        println!("No archived results.");
                    }
                    for record in list {
                        println!(
                            "{} [{}] {}",
                            record.id,
                            format_timestamp(record.stored_at),
                            report::format_summary(&record.task)
                        );
                    }
                }
                BenchAction::Purge => {
                    let removed = services.measurements.purge().await?;
                    println!("Purged {} archived result(s).", removed);
                }
            }
        }
    }

    Ok(())
}
