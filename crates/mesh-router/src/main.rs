//! meshrouterd - PQC mesh router daemon
//!
//! Keeps the peer registry healthy (probing and discovery) and can build a
//! chained connection through the mesh on request.

use anyhow::Context;
use clap::Parser;
use mesh_router::config::Config;
use mesh_router::peer::split_host_port;
use mesh_router::MeshRouter;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    init_logging(&config);

    info!("meshrouterd v{} - PQC mesh router", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Router error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "meshrouterd={level},mesh_router={level},pqc_tunnel={level}"
        ))
    });

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let router = Arc::new(
        MeshRouter::new(config.router_config()).context("failed to initialize mesh router")?,
    );
    info!("Node {} ({})", router.node_id(), router.tunnels().mode());

    router.start();

    if let Some(target) = &config.probe_target {
        probe_target(&router, target).await?;
    }

    // Spawn stats reporter
    let stats_router = router.clone();
    let stats_interval = Duration::from_secs(config.stats_interval_secs);
    let stats_task = tokio::spawn(async move {
        let mut ticker = interval(stats_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match serde_json::to_string(&stats_router.stats()) {
                Ok(stats) => info!("Router stats: {}", stats),
                Err(e) => warn!("Failed to encode router stats: {}", e),
            }
        }
    });

    // Wait for shutdown
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Received shutdown signal");

    stats_task.abort();
    router.stop().await;
    Ok(())
}

/// Probe all peers once, then build one chained connection and report it
async fn probe_target(router: &MeshRouter, target: &str) -> anyhow::Result<()> {
    let (host, port) = split_host_port(target).context("invalid probe target")?;

    router.trigger_aggressive_healing().await;

    let mut connection = router.connection();
    match connection.connect_multi_hop(&host, port).await {
        Ok(()) => {
            info!(
                "Probe connection to {} established over {} hops",
                target,
                connection.hops_completed()
            );
            for report in connection.hop_reports() {
                if report.encrypted {
                    info!("  {}: PQC-encrypted", report.node_id);
                } else {
                    warn!("  {}: unencrypted", report.node_id);
                }
            }
            connection.close().await;
        }
        Err(e) => warn!(
            "Probe connection to {} failed after {} hops: {}",
            target,
            connection.hops_completed(),
            e
        ),
    }
    Ok(())
}
