mod health;
mod metrics;
mod proxy;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use proxy::proxy_handler;

use axum::handler::Handler;
use axum::{Router, middleware, routing::get};
use std::sync::Arc;
use crate::middleware::admission_control;
use crate::state::AppState;

// health and metrics stay reachable for over-limit clients,
// everything else goes through admission control to the upstream
pub fn router(state: Arc<AppState>) -> Router {
    let guarded = proxy_handler
        .layer(middleware::from_fn_with_state(state.filter.clone(), admission_control))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback_service(guarded)
        .with_state(state)
}
