pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::context::Clock;
use crate::health::HealthChecker;
use crate::services::webhook_processor::WebhookProcessor;

/// Shared state for the ingress routes
#[derive(Clone)]
pub struct ApiState {
    pub processor: Arc<WebhookProcessor>,
    pub health: HealthChecker,
    pub clock: Arc<dyn Clock>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/webhooks/{provider}", post(webhooks::handle_webhook))
        .route("/health", get(webhooks::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
