//! iccid-verifier library interface
//!
//! Batch verification engine for SIM identifiers against the activation
//! portal, plus the HTTP service and daemon built on it.

pub mod api;
pub mod browser;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod identifier;
pub mod lifecycle;
pub mod models;
pub mod portal;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, VerifyError, VerifyResult};

use axum::Router;
use chrono::{DateTime, Utc};
use iccid_common::events::EventBus;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::context::VerifierContext;
use crate::coordinator::RunCoordinator;
use crate::service::BatchService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BatchService>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime reporting
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: Arc<BatchService>, event_bus: EventBus) -> Self {
        Self {
            service,
            event_bus,
            startup_time: Utc::now(),
        }
    }

    /// Build the service, coordinator included, from wired components
    pub fn from_context(context: &VerifierContext) -> Self {
        let coordinator = RunCoordinator::new(
            Arc::clone(&context.engine),
            context.lifecycle.clone(),
        );
        let service = Arc::new(BatchService::new(Arc::clone(&context.store), coordinator));
        Self::new(service, context.event_bus.clone())
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::batch_routes())
        .merge(api::record_routes())
        .merge(api::run_routes())
        .merge(api::health_routes())
        .route("/events", axum::routing::get(api::event_stream))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolves when the process receives Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
