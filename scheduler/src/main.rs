//! Rotating agent scheduler.
//!
//! Each `scheduler run <cadence>` invocation claims the next roster agent
//! through the relay lock backend, runs its prompt, validates the result and
//! writes exactly one task log.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scheduler::core::types::Cadence;
use scheduler::cycle::{CycleDeps, SystemClock, run_cycle};
use scheduler::exit_codes;
use scheduler::io::backend::CommandLockBackend;
use scheduler::io::config::{DEFAULT_CONFIG_FILE, EnvOverrides, SchedulerConfig, load_config};
use scheduler::io::lock::ThreadSleeper;
use scheduler::io::platform::RUNNER_COMMAND_ENV;
use scheduler::io::process::SystemRunner;
use scheduler::logging;
use scheduler::pipeline::AgentIdentity;
use scheduler::select::{SelectOutcome, select_agent};

#[derive(Parser)]
#[command(
    name = "scheduler",
    version,
    about = "Rotating agent scheduler with relay-backed lock coordination"
)]
struct Cli {
    /// Repository root; relative config paths resolve against it.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Config file (default: `<root>/scheduler.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Agent platform (`codex`, `claude`, `linux`, or any label with a runner override).
    #[arg(long, global = true, env = "AGENT_PLATFORM", default_value = "codex")]
    platform: String,
    /// Agent model passed to the backend and the handoff.
    #[arg(long, global = true, env = "AGENT_MODEL")]
    model: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scheduler cycle: select, lock, execute, validate, complete.
    Run {
        /// `daily` or `weekly`.
        cadence: Cadence,
    },
    /// Print the agent the next cycle would attempt. Takes no lock, writes nothing.
    Select {
        /// `daily` or `weekly`.
        cadence: Cadence,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("resolve working directory")?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| root.join(DEFAULT_CONFIG_FILE));
    let file = load_config(&config_path)?;
    let env = EnvOverrides::from_env();

    match cli.command {
        Command::Run { cadence } => {
            let config = SchedulerConfig::resolve(&file, &env, cadence, &root);
            cmd_run(&config, &cli.platform, cli.model.as_deref())
        }
        Command::Select { cadence } => {
            let config = SchedulerConfig::resolve(&file, &env, cadence, &root);
            cmd_select(&config, &cli.platform, cli.model.as_deref())
        }
    }
}

fn cmd_run(config: &SchedulerConfig, platform: &str, model: Option<&str>) -> Result<i32> {
    let runner = SystemRunner::new(config.output_limit_bytes);
    let backend = CommandLockBackend::new(
        &runner,
        config.backend.clone(),
        config.root.clone(),
        platform,
        model,
    );
    let runner_override = std::env::var(RUNNER_COMMAND_ENV).ok();
    let identity =
        AgentIdentity::new(platform, model).with_runner_override(runner_override.as_deref());
    let deps = CycleDeps {
        runner: &runner,
        backend: &backend,
        sleeper: &ThreadSleeper,
        clock: &SystemClock,
    };
    let report = run_cycle(config, &identity, &deps, &mut rand::thread_rng())?;
    println!("{}", report.render_summary());
    Ok(report.exit_code)
}

fn cmd_select(config: &SchedulerConfig, platform: &str, model: Option<&str>) -> Result<i32> {
    let runner = SystemRunner::new(config.output_limit_bytes);
    let backend = CommandLockBackend::new(
        &runner,
        config.backend.clone(),
        config.root.clone(),
        platform,
        model,
    );
    match select_agent(config, &backend, chrono::Utc::now())? {
        SelectOutcome::Selected(agent) => {
            println!("{agent}");
            Ok(exit_codes::OK)
        }
        SelectOutcome::Saturated => {
            eprintln!(
                "rotation complete: every {} agent ran within the {} window",
                config.cadence,
                config.cadence.window_label()
            );
            Ok(exit_codes::OK)
        }
        SelectOutcome::Exhausted => {
            eprintln!("All roster tasks currently claimed by other agents");
            Ok(exit_codes::FAILURE)
        }
    }
}
