//! iccid-daemon - standalone supervisor
//!
//! Polls the shared database for RUNNING batches that no live run holds and
//! drives them one at a time. Several daemons may share one database; the
//! batch claim keeps them from driving the same batch.

use anyhow::{Context, Result};
use clap::Parser;
use iccid_common::config::{resolve_root_folder, ROOT_FOLDER_ENV};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iccid_verifier::config::VerifierConfig;
use iccid_verifier::context::VerifierContext;
use iccid_verifier::shutdown_signal;
use iccid_verifier::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "iccid-daemon")]
#[command(about = "Supervisor that drives RUNNING verification batches")]
#[command(version)]
struct Args {
    /// Root folder holding iccid.db and iccid-verifier.toml
    #[arg(short, long)]
    root_folder: Option<String>,

    /// Only drive this batch
    #[arg(short, long)]
    batch: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iccid_verifier=info,iccid_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting iccid-daemon v{}", env!("CARGO_PKG_VERSION"));

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), ROOT_FOLDER_ENV);
    info!("Root folder: {}", root_folder.display());

    let mut config = VerifierConfig::load(&root_folder).context("Failed to load configuration")?;
    if let Some(batch) = args.batch {
        config.supervisor.assigned_batch = Some(batch);
    }

    let context = VerifierContext::open(&root_folder, config)
        .await
        .context("Failed to initialize verifier")?;

    let supervisor = Supervisor::new(
        context.store.clone(),
        context.engine.clone(),
        context.lifecycle.clone(),
        context.config.supervisor.clone(),
    );

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(supervisor.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    worker.await.context("Supervisor task panicked")?;

    info!("Daemon shutdown complete");
    Ok(())
}
