//! Tenancy Entitlement API
//!
//! REST surface over the tenancy platform: tenants, entitlement checks,
//! usage metering, subscriptions and the plan catalog.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          TENANCY API (axum)                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   TraceLayer  │  TimeoutLayer  │  CORS  │  OpenAPI (utoipa)     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐ │
//! │  │   Tenants    │  │ Entitlements │  │    Usage     │  │Subscriptions│ │
//! │  │  overrides   │  │  (read-only) │  │ record/reset │  │ cancel/plan │ │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └─────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              TenancyPlatform (tenancy-core)                     │   │
//! │  │        InMemoryStore  │  SqliteStore (tenancy-sqlite)           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Rollover sweeper: periodic sweep_due until shutdown                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod sweeper;

use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tenancy_core::TenancyPlatform;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use config::{AppConfig, ServerConfig};
pub use error::{ApiError, ApiResult};
pub use models::*;

/// API state
#[derive(Clone)]
pub struct ApiState {
    /// Tenancy services
    pub platform: Arc<TenancyPlatform>,
}

impl ApiState {
    /// Wrap a platform
    pub fn new(platform: Arc<TenancyPlatform>) -> Self {
        Self { platform }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Tenancy Entitlement API",
        version = "1.0.0",
        description = "Tenants, plan entitlements, usage metering and subscriptions",
        license(name = "Apache-2.0")
    ),
    paths(
        routes::health::health_check,
        routes::tenants::create_tenant,
        routes::tenants::list_tenants,
        routes::tenants::get_tenant,
        routes::tenants::update_tenant,
        routes::tenants::suspend_tenant,
        routes::tenants::reactivate_tenant,
        routes::tenants::list_tenant_features,
        routes::tenants::set_override,
        routes::tenants::clear_override,
        routes::entitlements::list_entitlements,
        routes::entitlements::check_entitlement,
        routes::usage::record_usage,
        routes::usage::reset_usage,
        routes::usage::release_usage,
        routes::usage::usage_events,
        routes::subscriptions::subscribe,
        routes::subscriptions::get_subscription,
        routes::subscriptions::list_subscriptions,
        routes::subscriptions::subscription_usage,
        routes::subscriptions::activate,
        routes::subscriptions::cancel,
        routes::subscriptions::resume,
        routes::subscriptions::change_plan,
        routes::plans::list_plans,
        routes::plans::get_plan,
        routes::plans::list_plan_features,
    ),
    components(
        schemas(
            ErrorResponse, routes::health::HealthResponse,
            TenantView, TenantCreate, TenantPatch, TenantFeatureView, OverrideRequest,
            EntitlementView,
            UsageRequest, ReleaseRequest, UsageReceiptView, UsageEventView,
            SubscribeBody, CancelBody, ChangePlanBody,
            SubscriptionView, PlanChangeView, SubscriptionUsageView,
            PlanView, PlanFeatureView
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "tenants", description = "Tenant management and feature overrides"),
        (name = "entitlements", description = "Entitlement checks"),
        (name = "usage", description = "Usage metering"),
        (name = "subscriptions", description = "Subscription lifecycle"),
        (name = "plans", description = "Plan catalog")
    )
)]
pub struct ApiDoc;

/// Build the API router
pub fn build_router(state: ApiState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(CorsLayer::permissive()),
        )
        .with_state(Arc::new(state))
}

fn api_routes() -> Router<Arc<ApiState>> {
    Router::new()
        .nest(
            "/tenants",
            routes::tenants::router()
                .merge(routes::entitlements::router())
                .merge(routes::usage::router())
                .merge(routes::subscriptions::router()),
        )
        .nest("/plans", routes::plans::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{json, Value};

    async fn server() -> TestServer {
        let platform = TenancyPlatform::in_memory();
        platform.bootstrap().await.unwrap();
        let app = build_router(ApiState::new(Arc::new(platform)), Duration::from_secs(5));
        TestServer::new(app).unwrap()
    }

    async fn create_tenant(server: &TestServer, plan: Option<&str>) -> String {
        let created = server
            .post("/api/v1/tenants")
            .json(&json!({ "name": "Acme" }))
            .await;
        created.assert_status(StatusCode::CREATED);
        let tenant_id = created.json::<Value>()["data"]["tenant_id"]
            .as_str()
            .unwrap()
            .to_string();

        if let Some(plan) = plan {
            server
                .post(&format!("/api/v1/tenants/{tenant_id}/subscription"))
                .json(&json!({ "plan": plan }))
                .await
                .assert_status(StatusCode::CREATED);
        }
        tenant_id
    }

    #[tokio::test]
    async fn test_health_and_openapi() {
        let server = server().await;

        let health = server.get("/health").await;
        health.assert_status_ok();
        assert_eq!(health.json::<Value>()["plans"], 3);

        let doc = server.get("/api-docs/openapi.json").await.json::<Value>();
        let paths = &doc["paths"];
        assert!(paths["/api/v1/tenants/{tenant_id}/usage/{feature_key}"].is_object());
        assert!(paths["/api/v1/tenants/{tenant_id}"]["patch"].is_object());
        assert!(paths["/api/v1/tenants/{tenant_id}/features"]["get"].is_object());
        assert!(paths["/api/v1/tenants/{tenant_id}/features/{feature_key}/override"]["delete"].is_object());
        assert!(paths["/api/v1/tenants/{tenant_id}/subscriptions"]["get"].is_object());
        assert!(paths["/api/v1/tenants/{tenant_id}/subscription/activate"]["post"].is_object());
        assert!(paths["/api/v1/tenants/{tenant_id}/subscription/resume"]["post"].is_object());
        assert!(paths["/api/v1/plans/{slug}"]["get"].is_object());
    }

    #[tokio::test]
    async fn test_quota_flow() {
        let server = server().await;
        let tenant_id = create_tenant(&server, Some("pro")).await;
        let usage = format!("/api/v1/tenants/{tenant_id}/usage/workflows");

        for _ in 0..5 {
            server.post(&usage).json(&json!({ "amount": 1 })).await.assert_status_ok();
        }

        let check = server
            .get(&format!("/api/v1/tenants/{tenant_id}/entitlements/workflows"))
            .await
            .json::<Value>();
        assert_eq!(check["data"]["allowed"], false);
        assert_eq!(check["data"]["remaining"], 0);
        assert_eq!(check["data"]["reason"], "quota_exhausted");

        let rejected = server.post(&usage).json(&json!({})).await;
        rejected.assert_status(StatusCode::TOO_MANY_REQUESTS);
        let body = rejected.json::<Value>();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "quota_exceeded");

        let events = server
            .get(&format!("{usage}/events?limit=2"))
            .await
            .json::<Value>();
        assert_eq!(events["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_subscription_is_payment_required() {
        let server = server().await;
        let tenant_id = create_tenant(&server, None).await;

        let response = server
            .post(&format!("/api/v1/tenants/{tenant_id}/usage/workflows"))
            .json(&json!({ "amount": 1 }))
            .await;
        response.assert_status(StatusCode::PAYMENT_REQUIRED);
        assert_eq!(response.json::<Value>()["error"]["code"], "no_active_subscription");

        server
            .get(&format!("/api/v1/tenants/{tenant_id}/subscription"))
            .await
            .assert_status(StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let server = server().await;

        server
            .get(&format!("/api/v1/tenants/{}", uuid::Uuid::new_v4()))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        let tenant_id = create_tenant(&server, Some("free")).await;
        server
            .get(&format!("/api/v1/tenants/{tenant_id}/entitlements/Not-A-Key"))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        server
            .get(&format!("/api/v1/tenants/{tenant_id}/entitlements/ghost"))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        let both = server
            .put(&format!("/api/v1/tenants/{tenant_id}/features/workflows/override"))
            .json(&json!({ "limit": 10, "unlimited": true }))
            .await;
        both.assert_status(StatusCode::BAD_REQUEST);

        server
            .post(&format!("/api/v1/tenants/{tenant_id}/subscription"))
            .json(&json!({ "plan": "pro" }))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_suspended_tenant_forbidden() {
        let server = server().await;
        let tenant_id = create_tenant(&server, Some("pro")).await;

        server
            .post(&format!("/api/v1/tenants/{tenant_id}/suspend"))
            .await
            .assert_status_ok();
        server
            .post(&format!("/api/v1/tenants/{tenant_id}/usage/agents"))
            .json(&json!({ "amount": 1 }))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let back = server
            .post(&format!("/api/v1/tenants/{tenant_id}/reactivate"))
            .await
            .json::<Value>();
        assert_eq!(back["data"]["status"], "active");
    }

    #[tokio::test]
    async fn test_override_and_plan_change() {
        let server = server().await;
        let tenant_id = create_tenant(&server, Some("free")).await;

        let set = server
            .put(&format!("/api/v1/tenants/{tenant_id}/features/sso/override"))
            .json(&json!({ "is_enabled": true }))
            .await;
        set.assert_status_ok();
        let sso = server
            .get(&format!("/api/v1/tenants/{tenant_id}/entitlements/sso"))
            .await
            .json::<Value>();
        assert_eq!(sso["data"]["allowed"], true);

        let change = server
            .post(&format!("/api/v1/tenants/{tenant_id}/subscription/change-plan"))
            .json(&json!({ "plan": "pro" }))
            .await;
        change.assert_status_ok();
        let body = change.json::<Value>();
        assert_eq!(body["data"]["previous"]["status"], "superseded");
        assert_eq!(body["data"]["current"]["status"], "active");

        let cancelled = server
            .post(&format!("/api/v1/tenants/{tenant_id}/subscription/cancel"))
            .json(&json!({}))
            .await
            .json::<Value>();
        assert_eq!(cancelled["data"]["cancel_at_period_end"], true);
    }

    #[tokio::test]
    async fn test_plan_catalog() {
        let server = server().await;

        let plans = server.get("/api/v1/plans").await.json::<Value>();
        assert_eq!(plans["data"].as_array().unwrap().len(), 3);

        let features = server.get("/api/v1/plans/pro/features").await.json::<Value>();
        let workflows = features["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["feature_key"] == "workflows")
            .unwrap();
        assert_eq!(workflows["limit"], 5);

        server
            .get("/api/v1/plans/platinum/features")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
