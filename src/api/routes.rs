//! Router construction

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api::handlers;
use crate::middleware::auth::AuthLayer;
use crate::AppState;

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let settings = state.settings.clone();

    let api_routes = Router::new()
        .route("/tools/:tool/jobs", post(handlers::create_job))
        .route("/tools/:tool/batches", post(handlers::create_batch))
        .route("/jobs", get(handlers::list_jobs))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id/cancel", post(handlers::cancel_job))
        .route("/credits", get(handlers::get_credits))
        .layer(AuthLayer::from_config(&settings.auth));

    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .nest("/v1", api_routes);

    // Local buckets are served from the same process
    if settings.storage.backend == "local" {
        if let Some(mount) = local_mount_path(&settings.storage.url_prefix) {
            router = router.nest_service(&mount, ServeDir::new(&settings.storage.base_path));
        }
    }

    router
        .layer(TimeoutLayer::new(Duration::from_secs(
            settings.server.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Path component of the public URL prefix, if it names one
fn local_mount_path(url_prefix: &str) -> Option<String> {
    let url = reqwest::Url::parse(url_prefix).ok()?;
    let path = url.path().trim_end_matches('/');
    (!path.is_empty()).then(|| path.to_string())
}
