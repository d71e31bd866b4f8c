//! HTTP API handlers for iccid-verifier
//!
//! REST endpoints for the caller-facing batch operations plus an SSE stream
//! of verification events.

pub mod batches;
pub mod health;
pub mod records;
pub mod runs;
pub mod sse;

pub use batches::batch_routes;
pub use health::health_routes;
pub use records::record_routes;
pub use runs::run_routes;
pub use sse::event_stream;
