//! HTTP surface
//!
//! OpenAI-compatible chat completions plus model listing, prompt preview,
//! reload and readiness routes.

pub mod error;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::service::ChatService;

pub use error::ApiError;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    /// Applies to non-streaming completions only
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(service: Arc<ChatService>, request_timeout: Duration) -> Self {
        Self {
            service,
            request_timeout,
        }
    }
}

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/models", get(handlers::list_models))
        .route("/debug/prompt", post(handlers::debug_prompt));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/admin/reload", post(handlers::reload))
        .nest("/v1", v1_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
