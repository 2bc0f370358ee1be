//! Room relay for collaborative editing.
//!
//! Provides:
//! - POST publish and SSE subscribe on one configurable path
//! - Opaque forwarding of end-to-end sealed frames (client boundary)
//! - Durable room state and snapshot answers for plain frames (server boundary)
//! - A health endpoint with registry counters

pub mod config;
pub mod relay;
pub mod routes;
pub mod state_store;

use std::sync::Arc;

use axum::{Router, extract::DefaultBodyLimit, routing::get};
use collab_core::RoomRegistry;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::relay::Relay;
use crate::state_store::{MemoryStateStore, StateStore};

pub use config::EncryptionBoundary;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub relay: Relay,
}

impl AppState {
    /// State with a fresh registry and an in-memory state store.
    pub fn new(config: Config) -> Self {
        Self::with_store(config, RoomRegistry::new(), Arc::new(MemoryStateStore::new()))
    }

    pub fn with_store(config: Config, registry: RoomRegistry, store: Arc<dyn StateStore>) -> Self {
        let relay = Relay::new(registry, config.boundary, store);
        Self { config, relay }
    }
}

/// Build the relay router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            &state.config.base_path,
            get(routes::subscribe).post(routes::publish),
        )
        .route("/healthz", get(routes::health))
        .layer(DefaultBodyLimit::max(state.config.max_frame_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
