//! jrun bridge
//!
//! Runs a Java program on behalf of a debug adapter front end without
//! attaching a debugger. Binds one session on an ephemeral port, prints the
//! port, then relays process output and exit to the connected client.

mod config;
mod launch;
mod process;
mod server;
mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::BridgeConfig;
use session::SessionController;

/// jrun bridge
///
/// Launches Java programs for a debug adapter client, no debugger attached
#[derive(Parser, Debug)]
#[command(name = "jrun-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to .jrun/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Runtime installation root (overrides JAVA_HOME)
    #[arg(long)]
    java_home: Option<PathBuf>,

    /// Seconds to wait for the program after asking it to stop
    #[arg(long)]
    linger_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for the port
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("jrun bridge v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| BridgeConfig::default_path(Path::new(".")));
    let mut config = BridgeConfig::load(&config_path)?;

    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(home) = args.java_home {
        config.runtime_home = Some(home);
    }
    if let Some(secs) = args.linger_secs {
        config.linger_secs = secs;
    }

    let session_config = config.session_config()?;
    let controller = Arc::new(SessionController::bind(session_config).await?);
    let port = controller.port()?;
    info!("Session {} listening on port {}", controller.id(), port);
    println!("{}", port);

    // Spawn shutdown signal handler
    let controller_handle = Arc::clone(&controller);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        controller_handle.shutdown();
    });

    let summary = controller.run().await?;

    match summary.exit_code() {
        Some(code) => info!(
            "Session {} complete, program exited with code {}",
            summary.session_id, code
        ),
        None => info!(
            "Session {} complete in state {}",
            summary.session_id, summary.state
        ),
    }
    if summary.termination_signals > 0 {
        info!(
            "Sent {} termination signal(s)",
            summary.termination_signals
        );
    }

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
