//! fdemanagerd binary
//!
//! Runs the daemon until SIGINT/SIGTERM or until it decides to stand by, and
//! probes a running instance with `status`.

use anyhow::Result;
use fdemanager::daemon::{DaemonClient, SOCKET_RESTART_EXIT_CODE};
use fdemanager::{Daemon, DaemonConfig, DaemonError};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::process;
use std::thread;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives for the log output, e.g. `debug` or `fdemanager=trace`
const LOG_ENV: &str = "FDEMANAGERD_LOG";
/// Set to `json` for structured log lines
const LOG_FORMAT_ENV: &str = "FDEMANAGERD_LOG_FORMAT";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        None | Some("run") => run(),
        Some("status") => check_status(),
        Some("-h") | Some("--help") => {
            print_usage();
            Ok(())
        }
        Some(command) => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("fdemanagerd - disk encryption management daemon");
    println!();
    println!("USAGE:");
    println!("    fdemanagerd [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    run       Run the daemon (default)");
    println!("    status    Check whether the daemon is answering on its socket");
    println!("    -h        Show this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    FDEMANAGERD_TARGET_ROOT   Root directory (default /)");
    println!("    FDEMANAGERD_LOG           Log filter (default info)");
    println!("    FDEMANAGERD_LOG_FORMAT    Set to json for JSON log lines");
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var(LOG_FORMAT_ENV).is_ok_and(|format| format == "json");

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn run() -> Result<()> {
    init_logging();
    let config = DaemonConfig::from_env();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    match runtime.block_on(serve(config)) {
        Ok(()) => Ok(()),
        Err(DaemonError::RestartSocket) => {
            println!("daemon stop requested to wait for socket activation");
            process::exit(SOCKET_RESTART_EXIT_CODE);
        }
        Err(err) => {
            eprintln!("cannot run daemon: {err}");
            process::exit(1);
        }
    }
}

async fn serve(config: DaemonConfig) -> Result<(), DaemonError> {
    let daemon = Daemon::new(config)?;
    daemon.start()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            thread::spawn(move || {
                for sig in signals.forever() {
                    if tx.send(sig).is_err() {
                        break;
                    }
                }
            });
        }
        Err(err) => {
            if let Err(stop_err) = daemon.stop().await {
                warn!(error = %stop_err, "cannot stop daemon after signal setup failed");
            }
            return Err(DaemonError::Serve(err));
        }
    }

    tokio::select! {
        Some(sig) = rx.recv() => info!(signal = sig, "Exiting on signal"),
        _ = daemon.dying() => info!("Daemon is dying"),
    }

    daemon.stop().await
}

fn check_status() -> Result<()> {
    let config = DaemonConfig::from_env();
    let socket = config.paths().socket;
    let client = DaemonClient::new(&socket);

    if client.is_daemon_running() {
        println!("Daemon is running at {}", socket.display());
    } else {
        println!("Daemon is not running");
        process::exit(1);
    }

    Ok(())
}
