//! Health check endpoint

use crate::error::ApiResult;
use crate::models::ErrorResponse;
use crate::ApiState;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    /// Plans in the catalog; zero means the store was never bootstrapped
    pub plans: usize,
}

/// Health check
///
/// Reads the catalog, so a broken store reports 503.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<Arc<ApiState>>) -> ApiResult<Json<HealthResponse>> {
    let plans = state.platform.catalog.list_plans().await?.len();
    Ok(Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        plans,
    }))
}
