use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LogConfig, LogFormat};
use gatekeeper::console::Command;
use gatekeeper::gateway::AdmissionGateway;
use gatekeeper::ratelimit::LimiterRegistry;

/// Drive a message admission gateway from stdin.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Service configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rate limit rules file, overriding the configured one
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    if let Some(rules) = cli.rules {
        config.rate_limiting.rules_path = Some(rules.display().to_string());
    }

    init_tracing(&config.log);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Duplicate principals and invalid rates are fatal here.
    let rules = config.rate_limits()?;
    info!(
        principals = rules.limits.len(),
        aggregate_default_qps = ?rules.aggregate_default_qps,
        "Rate limits loaded"
    );

    let registry = Arc::new(LimiterRegistry::new(&rules));
    let (gateway, mut dispatched) = AdmissionGateway::<String>::new(registry);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };
                match Command::parse(&line) {
                    Some(Ok(command)) => println!("{}", command.execute(&gateway)),
                    Some(Err(e)) => warn!(error = %e, "Ignoring input"),
                    None => {}
                }
            }
            Some(dispatch) = dispatched.recv() => {
                println!(
                    "dispatched from {} ({}): {}",
                    dispatch.client, dispatch.principal, dispatch.message
                );
            }
            _ = &mut shutdown => break,
        }
    }

    gateway.shutdown();
    info!("Gatekeeper stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    match log.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
