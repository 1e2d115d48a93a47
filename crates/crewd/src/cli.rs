//! `crewd` command line: start, stop and status.
//!
//! ```bash
//! # Start the daemon (foreground)
//! crewd start
//!
//! # Start in the background with a custom config
//! crewd start -d --config ~/crewd.toml
//!
//! # Stop the daemon
//! crewd stop
//!
//! # Enable debug logging
//! RUST_LOG=crewd=debug crewd start
//! ```
//!
//! SIGTERM and SIGINT cancel one token that every task observes.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{default_state_dir, DaemonConfig};
use crate::http::{self, ApiState};
use crate::monitor::{ProcessProbe, SystemProbe};
use crate::queue::{QueueCounters, QueueReader, QueueWatcher};
use crate::registry::{spawn_registry, RegistryHandle};
use crate::server::DaemonServer;
use crate::terminal::LocalTerminals;

/// crew daemon - live session registry for coding-agent hooks
#[derive(Parser, Debug)]
#[command(name = "crewd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to $CREW_CONFIG, then the user config dir)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn pid_file_path() -> PathBuf {
    default_state_dir().join("crewd.pid")
}

fn log_file_path() -> PathBuf {
    default_state_dir().join("crewd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Returns the PID of a running daemon, clearing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    let pid = read_pid()?;
    if SystemProbe.is_alive(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        bail!("Invalid PID {pid}");
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(raw, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

/// Parses arguments and runs the chosen command.
pub fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'crewd stop' to stop it first.");
                process::exit(1);
            }

            let config = DaemonConfig::load(config.as_deref()).context("Failed to load config")?;

            if daemon {
                // Must happen before the tokio runtime starts.
                daemonize()?;
            }
            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };
            println!("Stopping daemon (PID {pid})...");
            stop_daemon(pid)?;

            for _ in 0..50 {
                if !SystemProbe.is_alive(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            eprintln!("Daemon did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };
            println!("Daemon is running (PID {pid})");

            if let Ok(config) = DaemonConfig::load(None) {
                if config.socket_path.exists() {
                    println!("Socket: {}", config.socket_path.display());
                }
                println!("HTTP:   {}", config.http_addr);
                println!("Queue:  {}", config.queue_path.display());
            }
            Ok(())
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;
    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("crewd=info".parse()?)
                .add_directive("crew_core=info".parse()?)
                .add_directive("crew_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    init_logging()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "crew daemon starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let probe: Arc<dyn ProcessProbe> = Arc::new(SystemProbe);
    let terminals = LocalTerminals::new(Arc::clone(&probe));
    let registry = spawn_registry(config.registry(), probe, Arc::new(terminals.clone()));
    info!("Session registry started");

    let queue = start_queue(&config, &registry, &cancel_token);

    let api_state = ApiState {
        registry: registry.clone(),
        terminals,
        queue: queue.as_ref().map(|(counters, _)| Arc::clone(counters)),
    };
    let http_cancel = cancel_token.clone();
    let http_addr = config.http_addr;
    let http_task = tokio::spawn(async move {
        if let Err(e) = http::serve(http_addr, api_state, http_cancel.clone()).await {
            error!(error = %e, "HTTP API failed; shutting down");
            http_cancel.cancel();
        }
    });

    let server = DaemonServer::new(&config.socket_path, registry, cancel_token.clone());
    let result = server.run().await;
    cancel_token.cancel();

    let _ = http_task.await;
    if let Some((_, task)) = queue {
        let _ = task.await;
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }
    info!("crew daemon stopped");
    Ok(())
}

/// Starts the file-queue reader; the daemon runs without it if the queue
/// file cannot be opened.
fn start_queue(
    config: &DaemonConfig,
    registry: &RegistryHandle,
    cancel: &CancellationToken,
) -> Option<(Arc<QueueCounters>, JoinHandle<()>)> {
    let reader = match QueueReader::open(&config.queue_path, None, config.queue.truncate_bytes) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(error = %e, "File queue disabled");
            return None;
        }
    };
    let watcher = QueueWatcher::new(reader, config.queue, registry.clone(), cancel.clone());
    let counters = watcher.counters();
    Some((counters, tokio::spawn(watcher.run())))
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
