//! Error types for the tenancy core

use crate::model::{FeatureKey, PlanId, SubscriptionId, TenantId};
use thiserror::Error;

/// Tenancy error type
///
/// Business outcomes (`QuotaExceeded`, `NoActiveSubscription`, ...) and
/// infrastructure failures share one enum so that callers can match on the
/// variant and decide whether to retry with [`TenancyError::is_retryable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TenancyError {
    /// Feature key is not in the catalog
    #[error("unknown feature: {0}")]
    UnknownFeature(FeatureKey),

    /// Tenant does not exist
    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    /// Plan does not exist
    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    /// Subscription does not exist
    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    /// Tenant has no subscription inside an active billing period
    #[error("tenant {0} has no active subscription")]
    NoActiveSubscription(TenantId),

    /// Tenant is suspended or expired
    #[error("tenant {tenant_id} is {status}")]
    TenantInactive {
        /// Tenant
        tenant_id: TenantId,
        /// Current status
        status: String,
    },

    /// Feature is disabled for the tenant or absent from its plan
    #[error("feature {feature} is not entitled for tenant {tenant_id}")]
    FeatureNotEntitled {
        /// Tenant
        tenant_id: TenantId,
        /// Feature
        feature: FeatureKey,
    },

    /// Increment would exceed a capped limit
    #[error("quota exceeded for {feature}: limit {limit}, usage {usage}, requested {requested}")]
    QuotaExceeded {
        /// Feature
        feature: FeatureKey,
        /// Effective limit
        limit: u64,
        /// Usage before the request
        usage: u64,
        /// Requested amount
        requested: u64,
    },

    /// State machine transition not allowed from the current state
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Input rejected at the boundary
    #[error("validation error: {0}")]
    Validation(String),

    /// Write collided with existing state (duplicate key, live subscription)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Row lock contention; safe to retry with backoff
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Operation exceeded its deadline and was rolled back
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// Transaction or commit failure in the backing store
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl TenancyError {
    /// Whether the operation may succeed if retried unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict(_) | Self::Timeout(_) | Self::Persistence(_)
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownFeature(_) => "unknown_feature",
            Self::UnknownTenant(_) => "unknown_tenant",
            Self::UnknownPlan(_) => "unknown_plan",
            Self::UnknownSubscription(_) => "unknown_subscription",
            Self::NoActiveSubscription(_) => "no_active_subscription",
            Self::TenantInactive { .. } => "tenant_inactive",
            Self::FeatureNotEntitled { .. } => "feature_not_entitled",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Timeout(_) => "timeout",
            Self::Persistence(_) => "persistence_failure",
        }
    }

    pub(crate) fn unknown_plan_id(plan_id: PlanId) -> Self {
        Self::UnknownPlan(plan_id.to_string())
    }
}

/// Result type for tenancy operations
pub type TenancyResult<T> = Result<T, TenancyError>;
