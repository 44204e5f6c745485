//! ---
//! ramdir_section: "01-core-functionality"
//! ramdir_subsection: "binary"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Binary entrypoint for the r-ramdir daemon."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use r_ramdir_common::{init_tracing, AppConfig, DEFAULT_CONFIG_PATH};
use r_ramdir_core::lock::{is_held, read_holder};
use r_ramdir_core::{Manager, ManagerDeps, StartupError};
use r_ramdir_metrics::{new_registry, spawn_http_server, DaemonMetrics, LifecycleMetrics};
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tracing::{error, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Keeps service data directories in memory and checkpoints them to disk",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Mount every configured resource and run until terminated")]
    Start,
    #[command(about = "Ask the running instance to flush, unmount and exit")]
    Stop {
        #[arg(
            long,
            value_name = "SECONDS",
            default_value_t = 120,
            help = "How long to wait for the instance to release its lock"
        )]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;
    init_tracing("r-ramdird", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    match cli.command {
        Commands::Start => run_daemon(config, load_duration).await,
        Commands::Stop { wait } => stop_instance(&config, Duration::from_secs(wait)).await,
    }
}

async fn run_daemon(config: AppConfig, load_duration: Duration) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    let lifecycle_metrics = LifecycleMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry, config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    // Handlers are installed before any mount so an early signal cannot kill
    // the process halfway through setup.
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    let deps = ManagerDeps::production(&config).with_metrics(lifecycle_metrics);
    let manager = Manager::new(config, deps);
    let outcome = match manager.start().await {
        Ok(running) => {
            info!("daemon running; waiting for termination signal");
            let termination = async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received; shutting down"),
                    _ = sigint.recv() => info!("SIGINT received; shutting down"),
                }
                tokio::spawn(ignore_further_signals(sigterm, sigint));
            };
            running
                .run_until(termination)
                .await
                .map_err(|err| anyhow!(err).context("shutdown incomplete; state may need manual verification"))
        }
        Err(err) => Err(report_startup_failure(err)),
    };

    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics exporter did not shut down cleanly");
        }
    }
    outcome
}

fn report_startup_failure(err: StartupError) -> anyhow::Error {
    if err.is_already_running() {
        error!(error = %err, "another instance is already running");
    } else {
        error!(error = %err, "startup failed; all resources were unwound");
        for failure in err.unwind_failures() {
            error!(failure = %failure, "unwind step failed");
        }
    }
    anyhow!(err)
}

async fn ignore_further_signals(mut sigterm: SignalStream, mut sigint: SignalStream) {
    loop {
        tokio::select! {
            _ = sigterm.recv() => warn!("SIGTERM ignored; shutdown already in progress"),
            _ = sigint.recv() => warn!("SIGINT ignored; shutdown already in progress"),
        }
    }
}

async fn stop_instance(config: &AppConfig, wait: Duration) -> Result<()> {
    let lock_path = &config.lock.path;
    if !is_held(lock_path)? {
        bail!("no running instance holds {}", lock_path.display());
    }
    let pid = read_holder(lock_path)
        .ok_or_else(|| anyhow!("lock file {} does not record a pid", lock_path.display()))?;
    let raw_pid = i32::try_from(pid).with_context(|| format!("pid {} out of range", pid))?;
    kill(Pid::from_raw(raw_pid), Signal::SIGTERM)
        .with_context(|| format!("failed to signal pid {}", pid))?;
    info!(pid, wait_secs = wait.as_secs(), "termination requested");

    let deadline = Instant::now() + wait;
    while is_held(lock_path)? {
        if Instant::now() >= deadline {
            bail!("instance {} did not exit within {}s", pid, wait.as_secs());
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    info!(pid, "instance stopped");
    Ok(())
}
