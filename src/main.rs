use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use unichat::cache::MemoryBus;
use unichat::config::Config;
use unichat::files::FileLoader;
use unichat::llm::ClientFactory;
use unichat::server::{AppState, build_app};
use unichat::store::MemoryStore;
use unichat::worker::Manager;

// ============================================================================
// CLI Types
// ============================================================================

/// Unichat - per-user streaming conversation dispatcher
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "unichat.yaml")]
        config: String,

        /// Host to bind to (overrides config file)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => serve(&config, host, port).await,
    }
}

async fn serve(config_path: &str, host: Option<IpAddr>, port: Option<u16>) -> Result<()> {
    let config = Config::load(config_path).context("load configuration")?;

    let host = host
        .map(|h| h.to_string())
        .unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let store = Arc::new(MemoryStore::new());
    let factory = Arc::new(ClientFactory::new(config.provider_base_urls()));
    let loader = FileLoader::new(config.files.base_dir.clone());
    let bus = Arc::new(MemoryBus::new());

    let manager = Manager::with_cache(
        store.clone(),
        factory,
        loader,
        config.dispatcher.to_dispatcher_config(),
        bus,
    );

    let state = AppState {
        manager: manager.clone(),
        store,
        file_base: config.files.base_dir.clone(),
        file_ttl: Duration::from_secs(config.files.ttl_hours * 3600),
    };
    let app = build_app(state, config.server.request_timeout_seconds);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "unichat listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    manager.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    // UNICHAT_WORKER_DEBUG=1 turns on verbose scheduler logging without a
    // full RUST_LOG directive.
    let default_filter = if std::env::var("UNICHAT_WORKER_DEBUG").is_ok_and(|v| v == "1") {
        "info,unichat::worker=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
