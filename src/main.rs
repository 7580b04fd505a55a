use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::gate::{Gate, Replenisher};
use floodgate::http::HttpServer;
use floodgate::ratelimit::{IdleEviction, MonotonicClock, PolicySummary};

/// Multi-strategy request rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration, print the resolved policies and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!("Starting Floodgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => FloodgateConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => FloodgateConfig::default(),
    };
    info!(
        http_addr = %config.server.http_addr,
        policies = config.limits.policies.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(
        config
            .limits
            .into_registry(Arc::new(MonotonicClock::new()))
            .context("invalid rate limit configuration")?,
    );

    if cli.check {
        let summaries: Vec<PolicySummary> = registry
            .policies()
            .iter()
            .map(|registered| registered.policy().summary())
            .collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    let mut gate = Gate::new(Arc::clone(&registry));
    if let Some(timeout) = config.gate.queue_timeout() {
        gate = gate.with_queue_timeout(timeout);
    }

    let replenisher = Replenisher::new(Arc::clone(&registry))
        .with_interval(config.gate.replenish_interval())
        .spawn();
    let eviction = IdleEviction::new(Arc::clone(&registry))
        .with_idle_timeout(config.gate.idle_eviction())
        .with_sweep_interval(config.gate.sweep_interval())
        .spawn();

    let server = HttpServer::new(config.server.http_addr, Arc::new(gate));

    info!("Starting HTTP server on {}", config.server.http_addr);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    replenisher.abort();
    eviction.abort();

    info!("Floodgate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
