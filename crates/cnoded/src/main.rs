#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use cnoded::acceptor;
use cnoded::config::{Args, ServerConfig};
use cnoded::metrics::{start_metrics_server, NodeStats};
use cnoded::publish::publish;
use cnoded::router::CallRouter;
use cnoded::run_with_shutdown;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(args: &Args) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let listener = acceptor::bind(config.listen)
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let port = listener.local_addr()?.port();
    info!("bound to {}", config.listen);

    let _publication = match config.epmd {
        Some(epmd) => Some(
            publish(epmd, &config.name, port)
                .await
                .with_context(|| format!("failed to publish {} via epmd at {epmd}", config.name))?,
        ),
        None => {
            warn!("not publishing to epmd; peers must connect to port {port} directly");
            None
        }
    };

    let stats = NodeStats::new();
    if let Some(metrics_addr) = config.metrics_addr {
        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_addr, stats).await {
                warn!("metrics server error: {}", e);
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                drop(shutdown_tx);
            }
            Err(e) => {
                warn!("cannot listen for shutdown signal: {}", e);
                // Keep the sender alive so the node runs until killed.
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    run_with_shutdown(listener, config, CallRouter::default(), stats, shutdown_rx)
        .await
        .context("server error")?;
    Ok(())
}
