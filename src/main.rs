//! Zephyr Daemon - node-level container workload management
//!
//! Manages the lifecycle of containerized servers on a single host:
//! install, start, stop, restart, kill, console streaming, and telemetry,
//! exposed over an HTTP/WebSocket API.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod cmd;

#[derive(Parser)]
#[command(name = "zephyr-daemon")]
#[command(about = "Zephyr container workload daemon")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = zephyr_daemon::config::DEFAULT_PATH)]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable testing mode (canned template, local data paths)
    #[arg(short, long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("zephyr_daemon={log_level}").into()),
        )
        .init();

    // The daemon is launched by its supervisor, not by hand.
    if std::env::var("ZEPHYR_DAEMON_IGNITION").as_deref() != Ok("true") {
        error!("this binary should be run by the app itself or in development mode");
        return Ok(());
    }

    if let Err(e) = cmd::root::run(&cli.config, cli.debug, cli.test).await {
        error!("daemon error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
