//! Management API for routes.
//!
//! All endpoints live under `/routes` and are mounted before the proxy
//! fallback, so they always win over the catch-all. Writes go straight to
//! the store (the authoritative state, not the cache) and trigger an
//! immediate cache refresh so the proxy sees the change without waiting
//! for the next scheduled tick.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;
use tracing::warn;

use crate::route_store::{Route, RouteDraft, RouteStoreError};
use crate::server::AppState;

/// Errors surfaced by the admin API.
#[derive(Error, Debug)]
pub enum AdminError {
    /// Unique-path constraint violation (maps to 409).
    #[error("A route with that path already exists.")]
    DuplicatePath,

    /// Unknown route id (maps to 404).
    #[error("Route not found")]
    NotFound,

    /// Payload failed validation (maps to 400).
    #[error("{0}")]
    Invalid(String),

    /// Store failure (maps to 500).
    #[error("storage error: {0}")]
    Store(RouteStoreError),
}

impl From<RouteStoreError> for AdminError {
    fn from(err: RouteStoreError) -> Self {
        match err {
            RouteStoreError::DuplicatePath => AdminError::DuplicatePath,
            other => AdminError::Store(other),
        }
    }
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match self {
            AdminError::DuplicatePath => StatusCode::CONFLICT,
            AdminError::NotFound => StatusCode::NOT_FOUND,
            AdminError::Invalid(_) => StatusCode::BAD_REQUEST,
            AdminError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        if let AdminError::Store(e) = &self {
            warn!(error = %e, "route store failure in admin API");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

/// Admin routes, merged into the main router ahead of the fallback.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/routes", get(list_routes).post(create_route))
        .route(
            "/routes/{id}",
            get(get_route).put(update_route).delete(delete_route),
        )
}

/// Refresh the proxy's route snapshot after a write. A refresh failure
/// keeps the previous snapshot; the write itself already succeeded.
async fn refresh_cache(state: &AppState) {
    if let Err(e) = state.cache.refresh().await {
        warn!(error = %e, "route cache refresh after admin write failed");
    }
}

async fn create_route(
    State(state): State<AppState>,
    Json(draft): Json<RouteDraft>,
) -> Result<(StatusCode, Json<Route>), AdminError> {
    draft.validate().map_err(AdminError::Invalid)?;
    let created = state.store.insert(draft).await?;
    refresh_cache(&state).await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_routes(State(state): State<AppState>) -> Result<Json<Vec<Route>>, AdminError> {
    let routes = state.store.find_all().await?;
    Ok(Json(routes))
}

async fn get_route(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Route>, AdminError> {
    let route = state.store.find_by_id(id).await?.ok_or(AdminError::NotFound)?;
    Ok(Json(route))
}

async fn update_route(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(draft): Json<RouteDraft>,
) -> Result<Json<Route>, AdminError> {
    draft.validate().map_err(AdminError::Invalid)?;
    let updated = state
        .store
        .update(id, draft)
        .await?
        .ok_or(AdminError::NotFound)?;
    refresh_cache(&state).await;
    Ok(Json(updated))
}

async fn delete_route(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AdminError> {
    if !state.store.delete(id).await? {
        return Err(AdminError::NotFound);
    }
    refresh_cache(&state).await;
    Ok(StatusCode::NO_CONTENT)
}
