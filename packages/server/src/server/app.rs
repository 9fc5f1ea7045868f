//! Application setup: shared state and the axum router.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::domains::transcription::JobStore;
use crate::kernel::audit::AuditLog;
use crate::kernel::broker::TaskBroker;
use crate::kernel::model_pool::ModelPool;
use crate::server::middleware::{require_api_key, ApiKeyValidator, RateLimiter};
use crate::server::routes;

/// Shared handles, created once at process init. Tests construct their own
/// instances over the in-memory doubles.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn TaskBroker>,
    pub audit: Arc<dyn AuditLog>,
    pub pool: Arc<ModelPool>,
    pub auth: Arc<ApiKeyValidator>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

pub fn build_app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/health", get(routes::admin_health_handler))
        .route("/admin/errors", get(routes::admin_errors_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    // Leave headroom over the upload cap so the size check in the handler
    // is what answers 413, not the body-limit layer.
    let body_limit = state.config.max_upload_size_bytes() as usize + (1 << 20);

    Router::new()
        .route("/", get(routes::root_handler))
        .route("/health", get(routes::health_handler))
        .route("/transcribe", post(routes::submit_handler))
        .route(
            "/transcribe/:id",
            get(routes::job_status_handler).delete(routes::cancel_handler),
        )
        .route("/jobs", get(routes::list_jobs_handler))
        .merge(admin)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
