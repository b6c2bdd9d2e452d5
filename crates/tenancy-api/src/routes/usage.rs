//! Usage metering endpoints

use super::feature_key;
use crate::error::ApiResult;
use crate::{models::*, ApiState};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tenancy_core::RecordOptions;
use uuid::Uuid;

const DEFAULT_EVENT_PAGE: usize = 50;

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route(
            "/:tenant_id/usage/:feature_key",
            post(record_usage).delete(reset_usage),
        )
        .route("/:tenant_id/usage/:feature_key/release", post(release_usage))
        .route("/:tenant_id/usage/:feature_key/events", get(usage_events))
}

/// Record usage against the tenant's limit
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/usage/{feature_key}",
    params(("tenant_id" = Uuid, Path,), ("feature_key" = String, Path,)),
    request_body = UsageRequest,
    responses(
        (status = 200, description = "Recorded, or replayed for a known idempotency key", body = ApiResponse<UsageReceiptView>),
        (status = 402, description = "No active subscription", body = ErrorResponse),
        (status = 403, description = "Feature not entitled or tenant inactive", body = ErrorResponse),
        (status = 429, description = "Quota exceeded", body = ErrorResponse)
    ),
    tag = "usage"
)]
pub async fn record_usage(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, raw_key)): Path<(Uuid, String)>,
    Json(input): Json<UsageRequest>,
) -> ApiResult<Json<ApiResponse<UsageReceiptView>>> {
    let key = feature_key(&raw_key)?;
    let options = RecordOptions {
        allow_overage: input.allow_overage,
        idempotency_key: input.idempotency_key,
    };
    let receipt = state
        .platform
        .record_usage(tenant_id, &key, input.amount, &options)
        .await?;
    Ok(Json(ApiResponse::success(receipt.into())))
}

/// Zero the counter
#[utoipa::path(
    delete,
    path = "/api/v1/tenants/{tenant_id}/usage/{feature_key}",
    params(("tenant_id" = Uuid, Path,), ("feature_key" = String, Path,)),
    responses((status = 200, body = ApiResponse<TenantFeatureView>)),
    tag = "usage"
)]
pub async fn reset_usage(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, raw_key)): Path<(Uuid, String)>,
) -> ApiResult<Json<ApiResponse<TenantFeatureView>>> {
    let key = feature_key(&raw_key)?;
    let row = state.platform.metering.reset_usage(tenant_id, &key).await?;
    Ok(Json(ApiResponse::success(row.into())))
}

/// Give units back to a gauge such as workspaces or storage
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/usage/{feature_key}/release",
    params(("tenant_id" = Uuid, Path,), ("feature_key" = String, Path,)),
    request_body = ReleaseRequest,
    responses((status = 200, body = ApiResponse<UsageReceiptView>)),
    tag = "usage"
)]
pub async fn release_usage(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, raw_key)): Path<(Uuid, String)>,
    Json(input): Json<ReleaseRequest>,
) -> ApiResult<Json<ApiResponse<UsageReceiptView>>> {
    let key = feature_key(&raw_key)?;
    let receipt = state
        .platform
        .metering
        .release_usage(tenant_id, &key, input.amount)
        .await?;
    Ok(Json(ApiResponse::success(receipt.into())))
}

/// Usage audit trail, newest first
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/usage/{feature_key}/events",
    params(
        ("tenant_id" = Uuid, Path,),
        ("feature_key" = String, Path,),
        ("limit" = Option<usize>, Query, description = "Page size, 1..=1000")
    ),
    responses((status = 200, body = ApiResponse<Vec<UsageEventView>>)),
    tag = "usage"
)]
pub async fn usage_events(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, raw_key)): Path<(Uuid, String)>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<ApiResponse<Vec<UsageEventView>>>> {
    let key = feature_key(&raw_key)?;
    let events = state
        .platform
        .metering
        .usage_events(tenant_id, &key, query.limit.unwrap_or(DEFAULT_EVENT_PAGE))
        .await?;
    Ok(Json(ApiResponse::success(
        events.into_iter().map(UsageEventView::from).collect(),
    )))
}
