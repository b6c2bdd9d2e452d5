//! API Models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tenancy_core::{
    BillingCycle, DecisionReason, EntitlementDecision, FeatureKind, GrantSource, Limit, Plan,
    PlanChange, PlanFeature, Remaining, Subscription, SubscriptionStatus, SubscriptionUsage,
    Tenant, TenantFeature, TenantStatus, UsageEvent, UsageEventKind, UsageReceipt, UsageReset,
};
use utoipa::ToSchema;
use uuid::Uuid;

/// Standard API response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// `(limit, unlimited)` pair; `limit` is null for unlimited or absent limits
fn limit_fields(limit: Option<&Limit>) -> (Option<u64>, bool) {
    match limit {
        Some(Limit::Unlimited) => (None, true),
        Some(Limit::Capped(cap)) => (Some(*cap), false),
        None => (None, false),
    }
}

fn remaining_value(remaining: Remaining) -> Option<u64> {
    match remaining {
        Remaining::Unlimited => None,
        Remaining::Count(n) => Some(n),
    }
}

// ============ Tenants ============

/// Tenant
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TenantView {
    pub tenant_id: Uuid,
    pub name: String,
    #[schema(value_type = String, example = "active")]
    pub status: TenantStatus,
    pub plan_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Tenant> for TenantView {
    fn from(t: Tenant) -> Self {
        Self {
            tenant_id: t.tenant_id,
            name: t.name,
            status: t.status,
            plan_id: t.plan_id,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

/// Tenant creation request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantCreate {
    pub name: String,
}

/// Tenant update request
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct TenantPatch {
    pub name: Option<String>,
}

/// Override and counter row of one feature
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TenantFeatureView {
    pub feature_key: String,
    pub is_enabled: Option<bool>,
    pub limit: Option<u64>,
    pub unlimited: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub period_start: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<TenantFeature> for TenantFeatureView {
    fn from(row: TenantFeature) -> Self {
        let (limit, unlimited) = limit_fields(row.limit.as_ref());
        Self {
            feature_key: row.feature_key.into(),
            is_enabled: row.is_enabled,
            limit,
            unlimited,
            expires_at: row.expires_at,
            usage_count: row.usage_count,
            period_start: row.period_start,
            updated_at: row.updated_at,
        }
    }
}

/// Tenant-specific override; omitted fields fall back to the plan
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct OverrideRequest {
    pub is_enabled: Option<bool>,
    /// Capped limit; mutually exclusive with `unlimited`
    pub limit: Option<u64>,
    #[serde(default)]
    pub unlimited: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============ Entitlements ============

/// Entitlement decision
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EntitlementView {
    pub feature_key: String,
    #[schema(value_type = String, example = "metered")]
    pub kind: FeatureKind,
    pub allowed: bool,
    pub enabled: bool,
    #[schema(value_type = String, example = "granted")]
    pub reason: DecisionReason,
    #[schema(value_type = Option<String>, example = "plan")]
    pub source: Option<GrantSource>,
    pub limit: Option<u64>,
    pub unlimited: bool,
    pub usage: u64,
    /// Null when unlimited
    pub remaining: Option<u64>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

impl From<EntitlementDecision> for EntitlementView {
    fn from(d: EntitlementDecision) -> Self {
        let (limit, unlimited) = limit_fields(d.limit.as_ref());
        Self {
            feature_key: d.feature_key.into(),
            kind: d.kind,
            allowed: d.allowed,
            enabled: d.enabled,
            reason: d.reason,
            source: d.source,
            limit,
            unlimited,
            usage: d.usage,
            remaining: remaining_value(d.remaining),
            period_start: d.period.map(|p| p.start),
            period_end: d.period.map(|p| p.end),
        }
    }
}

// ============ Usage ============

/// Usage increment request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UsageRequest {
    #[serde(default = "one")]
    pub amount: u64,
    #[serde(default)]
    pub allow_overage: bool,
    pub idempotency_key: Option<String>,
}

fn one() -> u64 {
    1
}

/// Usage release request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReleaseRequest {
    pub amount: u64,
}

/// Usage write result
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageReceiptView {
    pub tenant_id: Uuid,
    pub feature_key: String,
    pub usage_count: u64,
    /// Null when unlimited
    pub remaining: Option<u64>,
    #[schema(value_type = String, example = "consumed")]
    pub kind: UsageEventKind,
    pub replayed: bool,
}

impl From<UsageReceipt> for UsageReceiptView {
    fn from(r: UsageReceipt) -> Self {
        Self {
            tenant_id: r.tenant_id,
            feature_key: r.feature_key.into(),
            usage_count: r.usage_count,
            remaining: remaining_value(r.remaining),
            kind: r.kind,
            replayed: r.replayed,
        }
    }
}

/// Usage audit event
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageEventView {
    pub event_id: Uuid,
    #[schema(value_type = String, example = "consumed")]
    pub kind: UsageEventKind,
    pub amount: u64,
    pub usage_after: u64,
    pub idempotency_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl From<UsageEvent> for UsageEventView {
    fn from(e: UsageEvent) -> Self {
        Self {
            event_id: e.event_id,
            kind: e.kind,
            amount: e.amount,
            usage_after: e.usage_after,
            idempotency_key: e.idempotency_key,
            occurred_at: e.occurred_at,
        }
    }
}

/// Event page query
#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    pub limit: Option<usize>,
}

// ============ Subscriptions ============

/// Subscribe request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubscribeBody {
    /// Plan slug
    pub plan: String,
    #[schema(value_type = Option<String>, example = "monthly")]
    pub billing_cycle: Option<BillingCycle>,
    #[serde(default)]
    pub with_trial: bool,
}

/// Cancel request
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CancelBody {
    /// End now instead of at the period end
    #[serde(default)]
    pub immediately: bool,
}

/// Plan change request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChangePlanBody {
    /// Plan slug
    pub plan: String,
}

/// Subscription
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionView {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    #[schema(value_type = String, example = "active")]
    pub status: SubscriptionStatus,
    #[schema(value_type = String, example = "monthly")]
    pub billing_cycle: BillingCycle,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<Uuid>,
    pub version: u64,
}

impl From<Subscription> for SubscriptionView {
    fn from(s: Subscription) -> Self {
        Self {
            subscription_id: s.subscription_id,
            tenant_id: s.tenant_id,
            plan_id: s.plan_id,
            status: s.status,
            billing_cycle: s.billing_cycle,
            current_period_start: s.current_period_start,
            current_period_end: s.current_period_end,
            trial_end: s.trial_end,
            cancel_at_period_end: s.cancel_at_period_end,
            cancelled_at: s.cancelled_at,
            expires_at: s.expires_at,
            superseded_by: s.superseded_by,
            version: s.version,
        }
    }
}

/// Plan change result
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlanChangeView {
    pub previous: SubscriptionView,
    pub current: SubscriptionView,
    /// Negative amounts are credits
    #[schema(value_type = String, example = "14.50")]
    pub proration_amount: Decimal,
    pub effective_at: DateTime<Utc>,
}

impl From<PlanChange> for PlanChangeView {
    fn from(c: PlanChange) -> Self {
        Self {
            previous: c.previous.into(),
            current: c.current.into(),
            proration_amount: c.proration_amount,
            effective_at: c.effective_at,
        }
    }
}

/// Rolling counters of the live subscription
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionUsageView {
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    #[schema(value_type = String, example = "active")]
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub current_workspaces: u64,
    pub current_storage_mb: u64,
    pub current_executions_this_month: u64,
}

impl From<SubscriptionUsage> for SubscriptionUsageView {
    fn from(u: SubscriptionUsage) -> Self {
        Self {
            subscription_id: u.subscription_id,
            plan_id: u.plan_id,
            status: u.status,
            period_start: u.period.start,
            period_end: u.period.end,
            current_workspaces: u.current_workspaces,
            current_storage_mb: u.current_storage_mb,
            current_executions_this_month: u.current_executions_this_month,
        }
    }
}

// ============ Plans ============

/// Plan
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlanView {
    pub plan_id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: String,
    #[schema(value_type = String, example = "29")]
    pub price: Decimal,
    pub currency: String,
    #[schema(value_type = String, example = "monthly")]
    pub billing_cycle: BillingCycle,
    pub trial_days: u32,
    pub is_active: bool,
}

impl From<Plan> for PlanView {
    fn from(p: Plan) -> Self {
        Self {
            plan_id: p.plan_id,
            slug: p.slug,
            name: p.name,
            description: p.description,
            price: p.price,
            currency: p.currency,
            billing_cycle: p.billing_cycle,
            trial_days: p.trial_days,
            is_active: p.is_active,
        }
    }
}

/// Feature as granted by a plan
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlanFeatureView {
    pub feature_key: String,
    pub name: String,
    #[schema(value_type = String, example = "metered")]
    pub kind: FeatureKind,
    #[schema(value_type = String, example = "billing_period")]
    pub reset: UsageReset,
    pub enabled: bool,
    pub limit: Option<u64>,
    pub unlimited: bool,
}

impl From<PlanFeature> for PlanFeatureView {
    fn from(pf: PlanFeature) -> Self {
        let (limit, unlimited) = match pf.feature.kind {
            FeatureKind::Metered => limit_fields(Some(&pf.entitlement.limit)),
            FeatureKind::Toggle => (None, false),
        };
        Self {
            feature_key: pf.feature.key.into(),
            name: pf.feature.name,
            kind: pf.feature.kind,
            reset: pf.feature.reset,
            enabled: pf.entitlement.enabled,
            limit,
            unlimited,
        }
    }
}
