//! EVM Load Generator - concurrent transaction load against JSON-RPC nodes
//!
//! Spawns virtual users that lease nonces from shared funding accounts, send
//! value transfers and optionally wait for their receipts.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use evm_loadtest::chain::{ChainProvider, RpcGateway};
use evm_loadtest::config::Settings;
use evm_loadtest::metrics::MetricsServer;
use evm_loadtest::scenario::LoadTestRunner;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting EVM Load Generator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} endpoint(s), {} account(s), {} VU(s)",
        settings.rpc.urls().len(),
        settings.accounts.len(),
        settings.loadtest.vus
    );

    let shutdown = CancellationToken::new();

    // Initialize RPC gateway
    let gateway: Arc<dyn RpcGateway> = Arc::new(ChainProvider::new(&settings.rpc)?);

    let runner = LoadTestRunner::new(&settings, gateway).await?;
    info!(
        "Run {} on chain {}",
        runner.run_id(),
        runner.chain_id()
    );

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let shutdown = shutdown.clone();
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Stop the run on Ctrl+C / SIGTERM
    let signal_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping...");
            shutdown.cancel();
        }
    });

    let result = runner.run(shutdown.clone()).await;

    shutdown.cancel();
    signal_handle.abort();
    if let Some(h) = metrics_handle {
        let _ = h.await;
    }

    let summary = result?;
    if let Some(path) = &settings.loadtest.results_file {
        summary.save_json(path)?;
    }
    for report in &summary.reconciliation {
        if !report.is_clean() {
            warn!(
                "Account {:?} needs manual reconciliation: chain at {}, local next {}, gaps {:?}",
                report.address,
                report.on_chain_nonce,
                report.local.next,
                report.gaps()
            );
        }
    }

    info!("EVM Load Generator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,evm_loadtest=debug,hyper=warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
