//! foreman: run and inspect the orchestration kernel from a terminal.

mod demo;
mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use foreman_core::config::{KernelConfig, load_config};
use foreman_core::domain::NewTask;
use foreman_core::guardrail::{
    CheckRegistry, GitInspector, GuardrailContext, GuardrailEngine, GuardrailStatus, enforce,
    ensure_allowed_command, ensure_command_safe, load_catalog,
};
use foreman_core::ports::NoopEventSink;
use foreman_core::{KernelBuilder, RunStop};

use crate::demo::EchoWorker;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Task orchestration kernel")]
struct Cli {
    /// Kernel config (TOML). Defaults apply when the file is missing.
    #[arg(short, long, global = true, default_value = "foreman.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a shell command against the allow-list and the safety scan.
    CheckCommand { command: String },
    /// Evaluate every guardrail in a catalog; exits non-zero on a failing block entry.
    Guardrails {
        /// Guardrail catalog (TOML).
        #[arg(long)]
        catalog: PathBuf,
        /// Directories that must exist under the command root.
        #[arg(long = "require-dir")]
        required_dirs: Vec<PathBuf>,
    },
    /// Drive a normalized task file (JSON array) to completion with offline workers.
    Run {
        tasks: PathBuf,
        /// Print the run outcome and status as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(err) = run().await {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("load {}", cli.config.display()))?;
    config.validate().context("validate config")?;

    match cli.command {
        Command::CheckCommand { command } => cmd_check_command(&config, &command),
        Command::Guardrails {
            catalog,
            required_dirs,
        } => cmd_guardrails(&config, &catalog, required_dirs),
        Command::Run { tasks, json } => cmd_run(config, &tasks, json).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config).context("serialize config")?);
            Ok(())
        }
    }
}

fn cmd_check_command(config: &KernelConfig, command: &str) -> Result<()> {
    ensure_allowed_command(command, &config.commands.allowed_binaries)?;
    ensure_command_safe(command, &config.commands.root)?;
    println!("ok");
    Ok(())
}

fn cmd_guardrails(config: &KernelConfig, catalog: &Path, required_dirs: Vec<PathBuf>) -> Result<()> {
    let catalog =
        load_catalog(catalog).with_context(|| format!("load catalog {}", catalog.display()))?;
    let engine = GuardrailEngine::new(catalog, CheckRegistry::with_builtins(), Arc::new(NoopEventSink))?;
    let context = GuardrailContext {
        root: config.commands.root.clone(),
        allowed_binaries: config.commands.allowed_binaries.clone(),
        ledger_path: config.gate.ledger_path.clone(),
        required_dirs,
        repo: Arc::new(GitInspector::new(config.commands.clone())),
    };

    let results = engine.evaluate(&context);
    for result in &results {
        let marker = match result.status {
            GuardrailStatus::Pass => " ",
            GuardrailStatus::Warn => "~",
            GuardrailStatus::Fail => "!",
        };
        println!(
            "{marker} {:<12} {:<5} {:?}/{:?} {}{}",
            result.id,
            result.status.to_string(),
            result.enforcement,
            result.severity,
            result.summary,
            result
                .details
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        );
    }
    enforce(&results)?;
    Ok(())
}

#[derive(Serialize)]
struct RunReport<'a> {
    outcome: &'a foreman_core::RunOutcome,
    status: &'a foreman_core::app::KernelStatus,
}

async fn cmd_run(config: KernelConfig, tasks: &Path, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(tasks).with_context(|| format!("read {}", tasks.display()))?;
    let tasks: Vec<NewTask> =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", tasks.display()))?;

    let mut builder = KernelBuilder::new(config.clone());
    for worker in &config.dispatcher.workers {
        builder = builder.worker(worker.id.clone(), Arc::new(EchoWorker::new(&worker.provider)));
    }
    let kernel = builder.build()?;

    let submitted = kernel.submit(tasks).await?;
    info!(tasks = submitted.len(), "tasks submitted");
    let outcome = kernel.supervisor().run().await;
    let status = kernel.status().await;

    if json {
        let report = RunReport {
            outcome: &outcome,
            status: &status,
        };
        println!("{}", serde_json::to_string_pretty(&report).context("serialize report")?);
    } else {
        println!("cycles={} dispatched={}", outcome.cycles, outcome.dispatched);
        for (state, count) in &status.counts {
            println!("  {state:<18} {count}");
        }
    }

    match outcome.stop {
        RunStop::Complete => Ok(()),
        RunStop::Stalled { idle_polls } => {
            bail!("stalled: nothing runnable for {idle_polls} polls")
        }
        RunStop::MaxCycles { max_cycles } => bail!("stopped after {max_cycles} cycles"),
        RunStop::LoopDetected { signature, .. } => bail!(
            "loop detected: signature {} ({})",
            signature.hash,
            signature.snapshot_summary
        ),
        RunStop::Halted { reason } => bail!("halted: {reason}"),
    }
}
