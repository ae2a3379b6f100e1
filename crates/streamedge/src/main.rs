use std::pin::pin;

use anyhow::Result;
use clap::Parser;
use streamedge::Orchestrator;
use streamedge_cli::CliArgs;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

async fn shutdown_signal() {
    let mut sigint = pin!(tokio::signal::ctrl_c());
    #[cfg(unix)]
    {
        let mut sigterm_stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to bind SIGTERM handler");
        let mut sigterm = pin!(sigterm_stream.recv());
        tokio::select! {
            _ = &mut sigint => info!("received SIGINT, shutting down gracefully"),
            _ = &mut sigterm => info!("received SIGTERM, shutting down gracefully"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = &mut sigint => info!("received Ctrl+C, shutting down gracefully"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(instance_id = %args.instance_id, "starting streamedge");

    let orchestrator = Orchestrator::builder(args).build().await?;
    info!("pipeline running");

    shutdown_signal().await;

    orchestrator.shutdown().await;
    Ok(())
}
