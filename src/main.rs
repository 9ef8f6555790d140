//! procvisor - single-host process supervisor.
//!
//! `procvisor run` starts the supervisor, which re-executes this binary as
//! `procvisor worker --id <i>` for each slot. `ctl` talks to a running
//! supervisor through its shared state.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use procvisor::config::{Config, LogFormat, LoggingConfig};
use procvisor::substrate::{now_millis, Role, Substrate};
use procvisor::worker::{LogSink, SyntheticFeed, WorkerRuntime};
use procvisor::{LogWriter, Subscribe, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "procvisor", version, about = "Single-host worker process supervisor")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "PROCVISOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding the shared state and lock files
    #[arg(long, global = true)]
    runtime_dir: Option<PathBuf>,

    /// Prefix of every shared resource name
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor and its workers
    Run {
        /// Number of workers (0 = one per CPU)
        #[arg(short, long)]
        workers: Option<u32>,
    },

    /// Run one worker (started by the supervisor)
    Worker {
        /// Worker slot, 1-based
        #[arg(long)]
        id: u32,
    },

    /// Load and validate the configuration, then print the effective values
    CheckConfig,

    /// Inspect or control a running supervisor
    Ctl {
        #[command(subcommand)]
        action: CtlAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum CtlAction {
    /// Print the process table and statistics
    Status,
    /// Ask the supervisor to shut down (SIGTERM)
    Stop,
    /// Ask the supervisor to reload its configuration (SIGHUP)
    Reload,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match cli.command {
        Command::Run { .. } => {
            init_logging(&cfg.logging)?;
            run_supervisor(cfg, cli.config).await
        }
        Command::Worker { id } => {
            init_logging(&cfg.logging)?;
            let span = tracing::info_span!("worker", id);
            run_worker(cfg, cli.config, id).instrument(span).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckConfig => {
            print!("{}", toml::to_string_pretty(&cfg).context("failed to render configuration")?);
            println!(
                "# effective workers: {}",
                cfg.supervisor.effective_workers()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Ctl { action } => ctl(&cfg, action),
    }
}

/// File → environment → command line, validated.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.runtime_dir {
        cfg.substrate.runtime_dir = dir.clone();
    }
    if let Some(ns) = &cli.namespace {
        cfg.substrate.namespace = ns.clone();
    }
    if let Some(format) = cli.log_format {
        cfg.logging.format = format;
    }
    if let Command::Run {
        workers: Some(n), ..
    } = cli.command
    {
        cfg.supervisor.workers = n;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn init_logging(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .with_context(|| format!("invalid log filter {:?}", cfg.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match cfg.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!(e))
}

async fn run_supervisor(cfg: Config, config_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let subscribers: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let supervisor = Supervisor::builder(cfg)
        .with_config_path(config_path)
        .with_subscribers(subscribers)
        .build()?;

    let code = supervisor.run().await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn run_worker(cfg: Config, config_path: Option<PathBuf>, id: u32) -> anyhow::Result<()> {
    let substrate = Substrate::attach(cfg.substrate.options(), Role::Worker(id))
        .with_context(|| format!("worker {id} could not attach to the supervisor"))?;

    let unit = Box::new(SyntheticFeed::new(id, cfg.worker.feed_interval()));
    WorkerRuntime::new(id, cfg.worker, substrate, unit, Arc::new(LogSink))
        .with_config_path(config_path)
        .run()
        .await?;
    Ok(())
}

fn ctl(cfg: &Config, action: CtlAction) -> anyhow::Result<ExitCode> {
    let substrate = Substrate::attach(cfg.substrate.options(), Role::Observer).with_context(|| {
        format!(
            "no supervisor found for namespace {:?} in {}",
            cfg.substrate.namespace,
            cfg.substrate.runtime_dir.display()
        )
    })?;
    let state = substrate.snapshot()?;
    substrate.detach();

    let signal = match action {
        CtlAction::Status => {
            let now = now_millis();
            println!(
                "supervisor pid {}  up {}s  config version {}{}",
                state.supervisor_pid,
                now.saturating_sub(state.created_at) / 1000,
                state.config_version,
                if state.shutdown_requested { "  (shutting down)" } else { "" }
            );
            println!("{:>4}  {:>8}  {:<9}  {:>8}  {:>10}", "slot", "pid", "status", "restarts", "heartbeat");
            for r in &state.records {
                println!(
                    "{:>4}  {:>8}  {:<9}  {:>8}  {:>9}s",
                    r.worker_id,
                    r.pid,
                    r.status.as_label(),
                    r.restart_count,
                    r.heartbeat_age(now).as_secs()
                );
            }
            let s = &state.stats;
            println!(
                "messages {}  received {}B  sent {}B  errors {}",
                s.messages_processed, s.bytes_received, s.bytes_sent, s.errors
            );
            return Ok(ExitCode::SUCCESS);
        }
        CtlAction::Stop => Signal::SIGTERM,
        CtlAction::Reload => Signal::SIGHUP,
    };

    let Ok(raw) = i32::try_from(state.supervisor_pid) else {
        bail!("invalid supervisor pid {}", state.supervisor_pid);
    };
    kill(Pid::from_raw(raw), signal)
        .with_context(|| format!("failed to signal supervisor {}", state.supervisor_pid))?;
    println!("sent {signal} to supervisor {}", state.supervisor_pid);
    Ok(ExitCode::SUCCESS)
}
