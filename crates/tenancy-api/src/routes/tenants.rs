//! Tenant management endpoints

use super::feature_key;
use crate::error::{ApiError, ApiResult};
use crate::{models::*, ApiState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::sync::Arc;
use tenancy_core::{FeatureOverride, Limit, TenantUpdate};
use uuid::Uuid;

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(list_tenants).post(create_tenant))
        .route("/:tenant_id", get(get_tenant).patch(update_tenant))
        .route("/:tenant_id/suspend", post(suspend_tenant))
        .route("/:tenant_id/reactivate", post(reactivate_tenant))
        .route("/:tenant_id/features", get(list_tenant_features))
        .route(
            "/:tenant_id/features/:feature_key/override",
            put(set_override).delete(clear_override),
        )
}

/// Create tenant
#[utoipa::path(
    post,
    path = "/api/v1/tenants",
    request_body = TenantCreate,
    responses(
        (status = 201, description = "Tenant created", body = ApiResponse<TenantView>),
        (status = 400, description = "Invalid name", body = ErrorResponse)
    ),
    tag = "tenants"
)]
pub async fn create_tenant(
    State(state): State<Arc<ApiState>>,
    Json(input): Json<TenantCreate>,
) -> ApiResult<(StatusCode, Json<ApiResponse<TenantView>>)> {
    let tenant = state.platform.registry.create(&input.name).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(tenant.into()))))
}

/// List tenants, oldest first
#[utoipa::path(
    get,
    path = "/api/v1/tenants",
    responses((status = 200, body = ApiResponse<Vec<TenantView>>)),
    tag = "tenants"
)]
pub async fn list_tenants(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<ApiResponse<Vec<TenantView>>>> {
    let tenants = state.platform.registry.list().await?;
    Ok(Json(ApiResponse::success(
        tenants.into_iter().map(TenantView::from).collect(),
    )))
}

/// Get tenant by ID
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}",
    params(("tenant_id" = Uuid, Path,)),
    responses(
        (status = 200, body = ApiResponse<TenantView>),
        (status = 404, description = "Unknown tenant", body = ErrorResponse)
    ),
    tag = "tenants"
)]
pub async fn get_tenant(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<TenantView>>> {
    let tenant = state.platform.registry.get(tenant_id).await?;
    Ok(Json(ApiResponse::success(tenant.into())))
}

/// Rename tenant
#[utoipa::path(
    patch,
    path = "/api/v1/tenants/{tenant_id}",
    params(("tenant_id" = Uuid, Path,)),
    request_body = TenantPatch,
    responses(
        (status = 200, body = ApiResponse<TenantView>),
        (status = 400, description = "Invalid name", body = ErrorResponse),
        (status = 404, description = "Unknown tenant", body = ErrorResponse)
    ),
    tag = "tenants"
)]
pub async fn update_tenant(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<TenantPatch>,
) -> ApiResult<Json<ApiResponse<TenantView>>> {
    let tenant = state
        .platform
        .registry
        .update(tenant_id, TenantUpdate { name: input.name })
        .await?;
    Ok(Json(ApiResponse::success(tenant.into())))
}

/// Suspend tenant
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/suspend",
    params(("tenant_id" = Uuid, Path,)),
    responses(
        (status = 200, body = ApiResponse<TenantView>),
        (status = 409, description = "Tenant already expired", body = ErrorResponse)
    ),
    tag = "tenants"
)]
pub async fn suspend_tenant(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<TenantView>>> {
    let tenant = state.platform.registry.suspend(tenant_id).await?;
    Ok(Json(ApiResponse::success(tenant.into())))
}

/// Lift a suspension
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/reactivate",
    params(("tenant_id" = Uuid, Path,)),
    responses((status = 200, body = ApiResponse<TenantView>)),
    tag = "tenants"
)]
pub async fn reactivate_tenant(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<TenantView>>> {
    let tenant = state.platform.registry.reactivate(tenant_id).await?;
    Ok(Json(ApiResponse::success(tenant.into())))
}

/// Feature rows: overrides and usage counters
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/features",
    params(("tenant_id" = Uuid, Path,)),
    responses(
        (status = 200, body = ApiResponse<Vec<TenantFeatureView>>),
        (status = 404, description = "Unknown tenant", body = ErrorResponse)
    ),
    tag = "tenants"
)]
pub async fn list_tenant_features(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Vec<TenantFeatureView>>>> {
    let rows = state.platform.registry.tenant_features(tenant_id).await?;
    Ok(Json(ApiResponse::success(
        rows.into_iter().map(TenantFeatureView::from).collect(),
    )))
}

/// Set a tenant-specific feature override
#[utoipa::path(
    put,
    path = "/api/v1/tenants/{tenant_id}/features/{feature_key}/override",
    params(("tenant_id" = Uuid, Path,), ("feature_key" = String, Path,)),
    request_body = OverrideRequest,
    responses(
        (status = 200, body = ApiResponse<TenantFeatureView>),
        (status = 400, description = "Empty or expired override", body = ErrorResponse)
    ),
    tag = "tenants"
)]
pub async fn set_override(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, raw_key)): Path<(Uuid, String)>,
    Json(input): Json<OverrideRequest>,
) -> ApiResult<Json<ApiResponse<TenantFeatureView>>> {
    let key = feature_key(&raw_key)?;
    let limit = match (input.limit, input.unlimited) {
        (Some(_), true) => {
            return Err(ApiError::BadRequest(
                "limit and unlimited are mutually exclusive".into(),
            ))
        }
        (Some(cap), false) => Some(Limit::Capped(cap)),
        (None, true) => Some(Limit::Unlimited),
        (None, false) => None,
    };

    let row = state
        .platform
        .registry
        .set_feature_override(
            tenant_id,
            &key,
            FeatureOverride {
                is_enabled: input.is_enabled,
                limit,
                expires_at: input.expires_at,
            },
        )
        .await?;
    Ok(Json(ApiResponse::success(row.into())))
}

/// Drop a feature override
#[utoipa::path(
    delete,
    path = "/api/v1/tenants/{tenant_id}/features/{feature_key}/override",
    params(("tenant_id" = Uuid, Path,), ("feature_key" = String, Path,)),
    responses(
        (status = 200, body = ApiResponse<TenantFeatureView>),
        (status = 404, description = "Unknown tenant or feature", body = ErrorResponse)
    ),
    tag = "tenants"
)]
pub async fn clear_override(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, raw_key)): Path<(Uuid, String)>,
) -> ApiResult<Json<ApiResponse<TenantFeatureView>>> {
    let key = feature_key(&raw_key)?;
    let row = state
        .platform
        .registry
        .clear_feature_override(tenant_id, &key)
        .await?;
    Ok(Json(ApiResponse::success(row.into())))
}
