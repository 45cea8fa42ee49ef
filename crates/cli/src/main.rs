use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ruleflow_core::events::{EventLog, JsonlEventLog, NullEventLog};
use ruleflow_core::rulefile::DEFAULT_RULEFILE;
use ruleflow_core::workflow::{clean, Executor, ShellAction};
use ruleflow_core::{StalenessMode, Workflow};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod config;

use config::EngineOverrides;

/// Exit status for configuration and graph errors
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ruleflow")]
#[command(about = "Run rule-based file workflows in dependency order", long_about = None)]
struct Args {
    /// Path to the rulefile
    #[arg(short = 'f', long = "file", global = true, env = "RULEFLOW_FILE", default_value = DEFAULT_RULEFILE)]
    file: PathBuf,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build targets, running every stale rule they depend on
    Run(RunArgs),
    /// Delete every declared output
    Clean,
    /// Print rules and their outputs
    List,
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Rule names or output paths (default: the workflow's default target)
    targets: Vec<String>,

    /// Number of rules to run at once
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Show what would run and why, without running anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// How to decide whether outputs are current (mtime or content-hash)
    #[arg(long)]
    staleness: Option<StalenessMode>,

    /// Hash ledger location for content-hash mode
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Keep outputs of failed rules instead of deleting them
    #[arg(long)]
    keep_incomplete: bool,

    /// Append run events to this JSON Lines file
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Write the execution report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config::default_log_filter(args.verbose).into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match execute(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

async fn execute(args: Args) -> Result<u8> {
    let workflow = Workflow::load(&args.file)?;

    match args.command {
        Command::Run(run_args) => run(&workflow, run_args).await,
        Command::Clean => {
            let removed = clean(&workflow.registry)?;
            for path in &removed {
                println!("removed {}", path.display());
            }
            println!("{} outputs removed", removed.len());
            Ok(0)
        }
        Command::List => {
            list(&workflow);
            Ok(0)
        }
    }
}

async fn run(workflow: &Workflow, args: RunArgs) -> Result<u8> {
    let overrides = EngineOverrides {
        jobs: args.jobs,
        staleness: args.staleness,
        keep_incomplete: args.keep_incomplete,
        ledger: args.ledger.clone(),
    };
    let engine = overrides.apply(workflow.engine.clone());

    // Configuration and graph errors surface before anything runs
    let graph = workflow.graph(&args.targets)?;

    let event_log: Arc<dyn EventLog> = match &args.event_log {
        Some(path) => Arc::new(JsonlEventLog::new(path).context("Failed to open event log")?),
        None => Arc::new(NullEventLog),
    };
    let executor = Executor::with_event_log(engine, Arc::new(ShellAction::new()), event_log);

    if args.dry_run {
        let plan = executor.plan(&graph);
        let width = plan.iter().map(|(id, _)| id.as_str().len()).max().unwrap_or(0);
        for (id, decision) in plan.iter() {
            let verdict = if decision.is_stale() { "run " } else { "skip" };
            println!("{}  {:width$}  {}", verdict, id.as_str(), decision, width = width);
        }
        println!("{} of {} rules would run", plan.stale_count(), graph.len());
        return Ok(0);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; waiting for running rules to finish");
            interrupt.cancel();
        }
    });

    let report = executor.run_until_cancelled(&graph, cancel).await;
    println!("{}", report);

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    Ok(report.exit_code() as u8)
}

fn list(workflow: &Workflow) {
    let default = workflow.default_targets().unwrap_or_default();
    for rule in workflow.registry.rules() {
        let marker = if default.iter().any(|t| t == rule.id.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("{}{}", rule.id, marker);
        for output in &rule.outputs {
            println!("    {} -> {}", output.name, output.path.display());
        }
    }
}
