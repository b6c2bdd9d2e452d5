//! Plan catalog endpoints

use crate::error::ApiResult;
use crate::{models::*, ApiState};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(list_plans))
        .route("/:slug", get(get_plan))
        .route("/:slug/features", get(list_plan_features))
}

/// List plans
#[utoipa::path(
    get,
    path = "/api/v1/plans",
    responses((status = 200, body = ApiResponse<Vec<PlanView>>)),
    tag = "plans"
)]
pub async fn list_plans(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<ApiResponse<Vec<PlanView>>>> {
    let plans = state.platform.catalog.list_plans().await?;
    Ok(Json(ApiResponse::success(
        plans.into_iter().map(PlanView::from).collect(),
    )))
}

/// Get plan by slug
#[utoipa::path(
    get,
    path = "/api/v1/plans/{slug}",
    params(("slug" = String, Path,)),
    responses(
        (status = 200, body = ApiResponse<PlanView>),
        (status = 404, description = "Unknown plan", body = ErrorResponse)
    ),
    tag = "plans"
)]
pub async fn get_plan(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
) -> ApiResult<Json<ApiResponse<PlanView>>> {
    let plan = state.platform.catalog.get_plan_by_slug(&slug).await?;
    Ok(Json(ApiResponse::success(plan.into())))
}

/// Features a plan grants
#[utoipa::path(
    get,
    path = "/api/v1/plans/{slug}/features",
    params(("slug" = String, Path,)),
    responses(
        (status = 200, body = ApiResponse<Vec<PlanFeatureView>>),
        (status = 404, description = "Unknown plan", body = ErrorResponse)
    ),
    tag = "plans"
)]
pub async fn list_plan_features(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
) -> ApiResult<Json<ApiResponse<Vec<PlanFeatureView>>>> {
    let plan = state.platform.catalog.get_plan_by_slug(&slug).await?;
    let features = state.platform.catalog.list_features_for_plan(plan.plan_id).await?;
    Ok(Json(ApiResponse::success(
        features.into_iter().map(PlanFeatureView::from).collect(),
    )))
}
