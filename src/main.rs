//! HyperFleet daemon - microVM and container orchestration.
//!
//! Clients submit declarative machine specs over HTTP; the daemon spawns
//! and supervises the matching Firecracker, Cloud Hypervisor or Docker
//! workloads, wires up guest networking, and proxies exposed guest ports.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod cmd;

#[derive(Parser)]
#[command(name = "hyperfleet-daemon")]
#[command(about = "MicroVM and container orchestration daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "hyperfleet.yml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hyperfleet_daemon={}", log_level).into()),
        )
        .init();

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run(&cli.config).await?;
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("Daemon error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
