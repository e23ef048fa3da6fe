//! API layer -- axum routes, handlers, and middleware.

mod error;
mod routes;
pub mod state;

pub use self::error::ApiError;
use self::state::AppState;
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Build the application router with all API routes. Run directories are
/// served read-only under `/artifacts/{runId}/...`.
pub fn router(state: AppState) -> Router {
    let artifacts = ServeDir::new(state.pipeline.runs_dir());
    Router::new()
        .merge(routes::api_routes())
        .nest_service("/artifacts", artifacts)
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
