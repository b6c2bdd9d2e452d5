//! Entitlement check endpoints

use super::feature_key;
use crate::error::ApiResult;
use crate::{models::*, ApiState};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/:tenant_id/entitlements", get(list_entitlements))
        .route("/:tenant_id/entitlements/:feature_key", get(check_entitlement))
}

/// Decisions for every catalog feature
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/entitlements",
    params(("tenant_id" = Uuid, Path,)),
    responses(
        (status = 200, body = ApiResponse<Vec<EntitlementView>>),
        (status = 404, description = "Unknown tenant", body = ErrorResponse)
    ),
    tag = "entitlements"
)]
pub async fn list_entitlements(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Vec<EntitlementView>>>> {
    let decisions = state.platform.resolver.list_entitlements(tenant_id).await?;
    Ok(Json(ApiResponse::success(
        decisions.into_iter().map(EntitlementView::from).collect(),
    )))
}

/// Check one feature
///
/// Denials are regular decisions (`allowed = false` with a reason), not
/// errors; nothing is written.
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/entitlements/{feature_key}",
    params(("tenant_id" = Uuid, Path,), ("feature_key" = String, Path,)),
    responses(
        (status = 200, body = ApiResponse<EntitlementView>),
        (status = 404, description = "Unknown tenant or feature", body = ErrorResponse)
    ),
    tag = "entitlements"
)]
pub async fn check_entitlement(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, raw_key)): Path<(Uuid, String)>,
) -> ApiResult<Json<ApiResponse<EntitlementView>>> {
    let key = feature_key(&raw_key)?;
    let decision = state.platform.check_entitlement(tenant_id, &key).await?;
    Ok(Json(ApiResponse::success(decision.into())))
}
