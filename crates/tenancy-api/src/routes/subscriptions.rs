//! Subscription lifecycle endpoints

use crate::error::ApiResult;
use crate::{models::*, ApiState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use std::sync::Arc;
use tenancy_core::{CancelMode, SubscribeRequest, Subscription, TenancyError, TenantId};
use uuid::Uuid;

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/:tenant_id/subscription", get(get_subscription).post(subscribe))
        .route("/:tenant_id/subscription/usage", get(subscription_usage))
        .route("/:tenant_id/subscription/activate", post(activate))
        .route("/:tenant_id/subscription/cancel", post(cancel))
        .route("/:tenant_id/subscription/resume", post(resume))
        .route("/:tenant_id/subscription/change-plan", post(change_plan))
        .route("/:tenant_id/subscriptions", get(list_subscriptions))
}

/// Live subscription after any due rollover has been persisted
async fn live(state: &ApiState, tenant_id: TenantId) -> ApiResult<Subscription> {
    state.platform.registry.get(tenant_id).await?;
    let live = state
        .platform
        .lifecycle
        .ensure_current(tenant_id, Utc::now())
        .await?;
    Ok(live.ok_or(TenancyError::NoActiveSubscription(tenant_id))?)
}

/// Subscribe to a plan
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/subscription",
    params(("tenant_id" = Uuid, Path,)),
    request_body = SubscribeBody,
    responses(
        (status = 201, body = ApiResponse<SubscriptionView>),
        (status = 404, description = "Unknown tenant or plan", body = ErrorResponse),
        (status = 409, description = "Tenant already subscribed", body = ErrorResponse)
    ),
    tag = "subscriptions"
)]
pub async fn subscribe(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<SubscribeBody>,
) -> ApiResult<(StatusCode, Json<ApiResponse<SubscriptionView>>)> {
    let plan = state.platform.catalog.get_plan_by_slug(&input.plan).await?;
    let subscription = state
        .platform
        .lifecycle
        .subscribe(
            tenant_id,
            SubscribeRequest {
                plan_id: plan.plan_id,
                billing_cycle: input.billing_cycle,
                with_trial: input.with_trial,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(subscription.into()))))
}

/// Current subscription
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/subscription",
    params(("tenant_id" = Uuid, Path,)),
    responses(
        (status = 200, body = ApiResponse<SubscriptionView>),
        (status = 402, description = "No active subscription", body = ErrorResponse)
    ),
    tag = "subscriptions"
)]
pub async fn get_subscription(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<SubscriptionView>>> {
    let sub = live(&state, tenant_id).await?;
    Ok(Json(ApiResponse::success(sub.into())))
}

/// Subscription history, newest first
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/subscriptions",
    params(("tenant_id" = Uuid, Path,)),
    responses((status = 200, body = ApiResponse<Vec<SubscriptionView>>)),
    tag = "subscriptions"
)]
pub async fn list_subscriptions(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Vec<SubscriptionView>>>> {
    let subs = state.platform.lifecycle.list_subscriptions(tenant_id).await?;
    Ok(Json(ApiResponse::success(
        subs.into_iter().map(SubscriptionView::from).collect(),
    )))
}

/// Workspaces, storage and executions in the current period
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/subscription/usage",
    params(("tenant_id" = Uuid, Path,)),
    responses((status = 200, body = ApiResponse<SubscriptionUsageView>)),
    tag = "subscriptions"
)]
pub async fn subscription_usage(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<SubscriptionUsageView>>> {
    let usage = state.platform.lifecycle.subscription_usage(tenant_id).await?;
    Ok(Json(ApiResponse::success(usage.into())))
}

/// Convert a trial into a paid subscription
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/subscription/activate",
    params(("tenant_id" = Uuid, Path,)),
    responses(
        (status = 200, body = ApiResponse<SubscriptionView>),
        (status = 402, description = "No active subscription", body = ErrorResponse),
        (status = 409, description = "Subscription is not trialing", body = ErrorResponse)
    ),
    tag = "subscriptions"
)]
pub async fn activate(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<SubscriptionView>>> {
    let sub = live(&state, tenant_id).await?;
    let activated = state.platform.lifecycle.activate(sub.subscription_id).await?;
    Ok(Json(ApiResponse::success(activated.into())))
}

/// Cancel at period end (default) or immediately
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/subscription/cancel",
    params(("tenant_id" = Uuid, Path,)),
    request_body = CancelBody,
    responses((status = 200, body = ApiResponse<SubscriptionView>)),
    tag = "subscriptions"
)]
pub async fn cancel(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Json<ApiResponse<SubscriptionView>>> {
    let mode = match body.map(|Json(b)| b.immediately) {
        Some(true) => CancelMode::Immediately,
        _ => CancelMode::AtPeriodEnd,
    };
    let sub = live(&state, tenant_id).await?;
    let cancelled = state
        .platform
        .lifecycle
        .cancel(sub.subscription_id, mode)
        .await?;
    Ok(Json(ApiResponse::success(cancelled.into())))
}

/// Undo a pending cancel-at-period-end
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/subscription/resume",
    params(("tenant_id" = Uuid, Path,)),
    responses(
        (status = 200, body = ApiResponse<SubscriptionView>),
        (status = 409, description = "No pending cancellation", body = ErrorResponse)
    ),
    tag = "subscriptions"
)]
pub async fn resume(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<SubscriptionView>>> {
    let sub = live(&state, tenant_id).await?;
    let resumed = state.platform.lifecycle.resume(sub.subscription_id).await?;
    Ok(Json(ApiResponse::success(resumed.into())))
}

/// Move to another plan within the current period
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{tenant_id}/subscription/change-plan",
    params(("tenant_id" = Uuid, Path,)),
    request_body = ChangePlanBody,
    responses(
        (status = 200, body = ApiResponse<PlanChangeView>),
        (status = 402, description = "No active subscription", body = ErrorResponse)
    ),
    tag = "subscriptions"
)]
pub async fn change_plan(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<ChangePlanBody>,
) -> ApiResult<Json<ApiResponse<PlanChangeView>>> {
    let plan = state.platform.catalog.get_plan_by_slug(&input.plan).await?;
    let change = state
        .platform
        .lifecycle
        .change_plan(tenant_id, plan.plan_id)
        .await?;
    Ok(Json(ApiResponse::success(change.into())))
}
