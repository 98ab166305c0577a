// Presentation layer - HTTP boundary for ingestion adapters and exporters
pub mod app_state;
pub mod handlers;

use crate::presentation::app_state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route(
            "/timeseries/:id/data",
            get(handlers::get_data)
                .post(handlers::append_data)
                .put(handlers::replace_data),
        )
        .route("/timeseries/:id/data/stream", get(handlers::stream_data))
        .route("/timeseries/:id/bottom", get(handlers::bottom))
        .route("/autoprocesses/:id/execute", post(handlers::execute_autoprocess))
        .with_state(state)
}
