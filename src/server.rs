//! Shared application state and router assembly.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

use crate::access_log::AccessLogSink;
use crate::event_stream::{self, SseRegistry};
use crate::proxy_service::{self, UpstreamClient};
use crate::rate_limiter::RateLimiter;
use crate::route_cache::RouteCache;
use crate::route_store::RouteStore;

/// Everything a request handler needs, cloned into each task.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RouteStore>,
    pub cache: Arc<RouteCache>,
    pub limiter: Arc<dyn RateLimiter>,
    pub sink: Arc<dyn AccessLogSink>,
    pub registry: Arc<SseRegistry>,
    pub client: UpstreamClient,
    pub upstream_timeout: Duration,
}

/// The full gateway router.
///
/// Explicit endpoints (admin CRUD, the live stream, health) are matched
/// first; everything else falls through to the proxy pipeline.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/dashboard/stream", get(stream))
        .merge(crate::admin::router())
        .fallback(proxy_service::proxy_handler)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn stream(State(state): State<AppState>) -> impl IntoResponse {
    event_stream::sse_response(&state.registry)
}
