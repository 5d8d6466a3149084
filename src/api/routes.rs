use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use super::handlers;
use crate::service::MusicFinder;

pub fn create_router(finder: Arc<MusicFinder>) -> Router {
    let static_dir = finder.config().static_dir.clone();

    Router::new()
        // Front-end
        .route("/", get(handlers::index))
        .route("/favicon.ico", get(handlers::favicon))
        .nest_service("/static", ServeDir::new(static_dir))
        // API
        .route("/health", get(handlers::health))
        .route("/search", post(handlers::search))
        .route("/download", post(handlers::download))
        .with_state(finder)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
