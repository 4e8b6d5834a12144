//! HTTP API surface.

mod events;
mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use nimbus_cloud::CloudManager;
use tower_http::cors::CorsLayer;

/// Builds the API router.
pub fn router(manager: Arc<CloudManager>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/v1/cloud/instances",
            post(handlers::create_instance).get(handlers::list_instances),
        )
        .route(
            "/api/v1/cloud/instances/:id",
            get(handlers::get_instance).delete(handlers::terminate_instance),
        )
        .route("/api/v1/cloud/instances/:id/start", post(handlers::start_instance))
        .route("/api/v1/cloud/instances/:id/stop", post(handlers::stop_instance))
        .route("/api/v1/cloud/instances/:id/connect", get(handlers::connection_info))
        .route("/api/v1/cloud/instances/:id/logs", get(handlers::logs))
        .route("/api/v1/cloud/instances/:id/exec", post(handlers::exec))
        .route("/api/v1/cloud/quota", get(handlers::quota))
        .route("/api/v1/cloud/summary", get(handlers::summary))
        .route("/api/v1/cloud/events", get(events::stream_events))
        .layer(CorsLayer::permissive())
        .with_state(manager)
}
