//! iccid-verifier - HTTP service for batch SIM verification
//!
//! Loads batches, launches verification runs in the background and exposes
//! pause/resume/stop, results and an SSE progress stream.

use anyhow::{Context, Result};
use clap::Parser;
use iccid_common::config::{resolve_root_folder, ROOT_FOLDER_ENV};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iccid_verifier::config::VerifierConfig;
use iccid_verifier::context::VerifierContext;
use iccid_verifier::{build_router, shutdown_signal, AppState};

#[derive(Parser, Debug)]
#[command(name = "iccid-verifier")]
#[command(about = "Batch SIM identifier verification service")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5790", env = "ICCID_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1", env = "ICCID_BIND")]
    bind: String,

    /// Root folder holding iccid.db and iccid-verifier.toml
    #[arg(short, long)]
    root_folder: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iccid_verifier=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting iccid-verifier v{}", env!("CARGO_PKG_VERSION"));

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), ROOT_FOLDER_ENV);
    info!("Root folder: {}", root_folder.display());

    let config = VerifierConfig::load(&root_folder).context("Failed to load configuration")?;
    info!(
        portal = %config.portal.url,
        webdriver = %config.webdriver.endpoint,
        chunk_size = config.engine.chunk_size,
        "Configuration loaded"
    );

    let context = VerifierContext::open(&root_folder, config)
        .await
        .context("Failed to initialize verifier")?;

    let state = AppState::from_context(&context);
    let service = state.service.clone();
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Release claims so another actor can resume the batches
    service.coordinator().shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
