use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Autonomous quality-management control plane
#[derive(Parser, Debug)]
#[command(name = "quality-engine")]
#[command(about = "Autonomous quality monitoring and improvement for LLM inference services")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// HTTP adapter bind address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Audit history file path (overrides config)
    #[arg(long, value_name = "FILE")]
    audit_path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting quality engine v{}", env!("CARGO_PKG_VERSION"));

    let overrides = engine_config::ConfigOverrides {
        log_level: cli.verbose.then(|| "debug".to_string()),
        server_bind: cli.bind.clone(),
        audit_path: cli.audit_path.as_ref().map(std::path::PathBuf::from),
    };
    let config = engine_config::EngineConfig::load(
        cli.config.as_ref().map(std::path::PathBuf::from),
        overrides,
    )
    .await?;
    info!("configuration loaded");

    if cli.check_config {
        println!("{:#?}", config);
        return Ok(());
    }

    let server_config = config.server.clone();
    let mut engine = engine_core::QualityEngine::new(config).await?;
    let handle = engine.handle();
    engine.start().await?;

    // The adapter shares the engine's lifecycle through its own signal
    let (adapter_shutdown_tx, adapter_shutdown_rx) = tokio::sync::watch::channel(false);
    let adapter = if server_config.enabled {
        let bind = server_config.bind.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = adapter_server::serve(handle, &bind, adapter_shutdown_rx).await {
                error!("adapter server failed: {}", e);
            }
        }))
    } else {
        None
    };

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");

    let _ = adapter_shutdown_tx.send(true);
    engine.shutdown().await?;
    if let Some(adapter) = adapter {
        let _ = adapter.await;
    }

    info!("quality engine shut down");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }
    Ok(())
}
