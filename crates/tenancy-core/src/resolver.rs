//! Entitlement Resolver
//!
//! Read-only: given a tenant and a feature, decides whether the feature may
//! be used right now and how much quota remains.
//!
//! Resolution order:
//! 1. unexpired tenant override (a complete override grants on its own)
//! 2. plan entitlement via the live subscription's effective period
//! 3. default deny

use crate::error::{TenancyError, TenancyResult};
use crate::model::*;
use crate::store::{TenancyStore, UsageContext, UsageKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Granted,
    /// Capped limit reached
    QuotaExhausted,
    /// Entitlement exists but is switched off
    FeatureDisabled,
    /// The plan does not bind the feature
    NotInPlan,
    NoActiveSubscription,
    TenantInactive,
}

/// Where the effective entitlement came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    Override,
    Plan,
    /// Partial override merged over the plan entitlement
    OverrideAndPlan,
}

/// Outcome of an entitlement check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementDecision {
    pub tenant_id: TenantId,
    pub feature_key: FeatureKey,
    pub kind: FeatureKind,
    pub allowed: bool,
    pub remaining: Remaining,
    pub reason: DecisionReason,
    /// `None` when nothing grants the feature
    pub source: Option<GrantSource>,
    /// Effective switch after merging override and plan
    pub enabled: bool,
    /// Effective limit for metered features
    pub limit: Option<Limit>,
    /// Usage counted against the effective period
    pub usage: u64,
    /// Effective billing period, if the tenant has one
    pub period: Option<Period>,
}

impl EntitlementDecision {
    fn denied(ctx: &UsageContext, reason: DecisionReason, usage: u64, period: Option<Period>) -> Self {
        Self {
            tenant_id: ctx.tenant.tenant_id,
            feature_key: ctx.feature.key.clone(),
            kind: ctx.feature.kind,
            allowed: false,
            remaining: Remaining::Count(0),
            reason,
            source: None,
            enabled: false,
            limit: None,
            usage,
            period,
        }
    }

    /// Map a denial to the error metering reports
    pub fn denial_error(&self, tenant_status: TenantStatus) -> Option<TenancyError> {
        match self.reason {
            DecisionReason::Granted | DecisionReason::QuotaExhausted => None,
            DecisionReason::NoActiveSubscription => {
                Some(TenancyError::NoActiveSubscription(self.tenant_id))
            }
            DecisionReason::FeatureDisabled | DecisionReason::NotInPlan => {
                Some(TenancyError::FeatureNotEntitled {
                    tenant_id: self.tenant_id,
                    feature: self.feature_key.clone(),
                })
            }
            DecisionReason::TenantInactive => Some(TenancyError::TenantInactive {
                tenant_id: self.tenant_id,
                status: tenant_status.to_string(),
            }),
        }
    }
}

/// Decide an entitlement from a loaded context
///
/// Pure; the same function backs the read-only check and the decision taken
/// under the row lock when recording usage.
pub fn resolve(ctx: &UsageContext, now: DateTime<Utc>) -> EntitlementDecision {
    let period = ctx
        .subscription
        .as_ref()
        .and_then(|s| s.effective_period(now));
    let usage = ctx.row.usage_in(&ctx.feature, period.as_ref());

    if !ctx.tenant.status.is_usable() {
        return EntitlementDecision::denied(ctx, DecisionReason::TenantInactive, usage, period);
    }

    let ov = ctx
        .row
        .override_active(now)
        .then(|| ctx.row.feature_override());

    let (enabled, limit, source) = match (&ov, period, &ctx.plan_entitlement) {
        (Some(ov), _, _) if ov.is_complete() => (
            ov.is_enabled.unwrap_or(false),
            ov.limit.unwrap_or(Limit::Capped(0)),
            GrantSource::Override,
        ),
        (_, None, _) => {
            return EntitlementDecision::denied(ctx, DecisionReason::NoActiveSubscription, usage, None)
        }
        (_, Some(_), None) => {
            return EntitlementDecision::denied(ctx, DecisionReason::NotInPlan, usage, period)
        }
        (Some(ov), Some(_), Some(plan)) => (
            ov.is_enabled.unwrap_or(plan.enabled),
            ov.limit.unwrap_or(plan.limit),
            GrantSource::OverrideAndPlan,
        ),
        (None, Some(_), Some(plan)) => (plan.enabled, plan.limit, GrantSource::Plan),
    };

    let (allowed, remaining, reason, limit) = match ctx.feature.kind {
        FeatureKind::Toggle => {
            let remaining = if enabled { Remaining::Unlimited } else { Remaining::Count(0) };
            (enabled, remaining, if enabled { DecisionReason::Granted } else { DecisionReason::FeatureDisabled }, None)
        }
        FeatureKind::Metered if !enabled => {
            (false, Remaining::Count(0), DecisionReason::FeatureDisabled, Some(limit))
        }
        FeatureKind::Metered => {
            let allowed = limit.has_headroom(usage);
            let reason = if allowed { DecisionReason::Granted } else { DecisionReason::QuotaExhausted };
            (allowed, limit.remaining(usage), reason, Some(limit))
        }
    };

    EntitlementDecision {
        tenant_id: ctx.tenant.tenant_id,
        feature_key: ctx.feature.key.clone(),
        kind: ctx.feature.kind,
        allowed,
        remaining,
        reason,
        source: Some(source),
        enabled,
        limit,
        usage,
        period,
    }
}

/// Limit in force for a row: an active override first, then the plan
pub fn effective_limit(ctx: &UsageContext, now: DateTime<Utc>) -> Option<Limit> {
    ctx.row
        .limit
        .filter(|_| ctx.row.override_active(now))
        .or_else(|| ctx.plan_entitlement.as_ref().map(|e| e.limit))
}

/// Entitlement resolver service
pub struct EntitlementResolver {
    store: Arc<dyn TenancyStore>,
}

impl EntitlementResolver {
    pub fn new(store: Arc<dyn TenancyStore>) -> Self {
        Self { store }
    }

    /// Is the tenant permitted to use the feature now, and how much remains
    pub async fn check_entitlement(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
    ) -> TenancyResult<EntitlementDecision> {
        self.check_entitlement_at(tenant_id, feature_key, Utc::now()).await
    }

    /// [`Self::check_entitlement`] at an explicit instant
    pub async fn check_entitlement_at(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        now: DateTime<Utc>,
    ) -> TenancyResult<EntitlementDecision> {
        let ctx = self
            .store
            .load_usage_context(&UsageKey::new(tenant_id, feature_key.clone()))
            .await?;
        let decision = resolve(&ctx, now);
        debug!(
            tenant_id = %tenant_id,
            feature = %feature_key,
            allowed = decision.allowed,
            reason = ?decision.reason,
            usage = decision.usage,
            "Entitlement checked"
        );
        Ok(decision)
    }

    /// Decisions for every catalog feature, ordered by key
    pub async fn list_entitlements(&self, tenant_id: TenantId) -> TenancyResult<Vec<EntitlementDecision>> {
        if self.store.get_tenant(tenant_id).await?.is_none() {
            return Err(TenancyError::UnknownTenant(tenant_id));
        }

        let now = Utc::now();
        let mut decisions = Vec::new();
        for feature in self.store.list_features().await? {
            decisions.push(self.check_entitlement_at(tenant_id, &feature.key, now).await?);
        }
        Ok(decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn ctx(limit: Limit, usage: u64) -> UsageContext {
        let start = at(2025, 1, 1);
        let tenant = Tenant::new("Acme", start).unwrap();
        let key = FeatureKey::new("workflows").unwrap();
        let plan_id = Uuid::new_v4();
        let subscription = Subscription::active(tenant.tenant_id, plan_id, BillingCycle::Monthly, start);
        let mut row = TenantFeature::fresh(tenant.tenant_id, key.clone(), start);
        row.usage_count = usage;
        row.period_start = Some(start);

        UsageContext {
            feature: Feature::metered(key.clone(), "Workflows", UsageReset::Never),
            plan_entitlement: Some(PlanEntitlement {
                plan_id,
                feature_key: key,
                enabled: true,
                limit,
            }),
            subscription: Some(subscription),
            tenant,
            row,
        }
    }

    #[test]
    fn test_pro_workflows_exhausted() {
        let decision = resolve(&ctx(Limit::Capped(5), 5), at(2025, 1, 15));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, Remaining::Count(0));
        assert_eq!(decision.reason, DecisionReason::QuotaExhausted);
        assert_eq!(decision.source, Some(GrantSource::Plan));
    }

    #[test]
    fn test_headroom_remaining() {
        let decision = resolve(&ctx(Limit::Capped(5), 3), at(2025, 1, 15));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Remaining::Count(2));
    }

    #[test]
    fn test_no_subscription_denies() {
        let mut c = ctx(Limit::Capped(5), 0);
        c.subscription = None;
        let decision = resolve(&c, at(2025, 1, 15));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::NoActiveSubscription);
        assert!(decision.denial_error(TenantStatus::Active).is_some());
    }

    #[test]
    fn test_suspended_tenant_denied() {
        let mut c = ctx(Limit::Unlimited, 0);
        c.tenant.status = TenantStatus::Suspended;
        let decision = resolve(&c, at(2025, 1, 15));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::TenantInactive);
    }

    #[test]
    fn test_feature_missing_from_plan() {
        let mut c = ctx(Limit::Capped(5), 0);
        c.plan_entitlement = None;
        let decision = resolve(&c, at(2025, 1, 15));
        assert_eq!(decision.reason, DecisionReason::NotInPlan);
        assert!(matches!(
            decision.denial_error(TenantStatus::Active),
            Some(TenancyError::FeatureNotEntitled { .. })
        ));
    }

    #[test]
    fn test_complete_override_without_subscription() {
        let mut c = ctx(Limit::Capped(5), 2);
        c.subscription = None;
        c.row.is_enabled = Some(true);
        c.row.limit = Some(Limit::Capped(3));

        let decision = resolve(&c, at(2025, 1, 15));
        assert!(decision.allowed);
        assert_eq!(decision.source, Some(GrantSource::Override));
        assert_eq!(decision.remaining, Remaining::Count(1));
    }

    #[test]
    fn test_partial_override_merges_over_plan() {
        let mut c = ctx(Limit::Capped(5), 5);
        c.row.limit = Some(Limit::Capped(50));

        let decision = resolve(&c, at(2025, 1, 15));
        assert!(decision.allowed);
        assert_eq!(decision.source, Some(GrantSource::OverrideAndPlan));
        assert_eq!(decision.remaining, Remaining::Count(45));
    }

    #[test]
    fn test_expired_override_ignored() {
        let mut c = ctx(Limit::Capped(5), 5);
        c.row.limit = Some(Limit::Unlimited);
        c.row.expires_at = Some(at(2025, 1, 10));

        let decision = resolve(&c, at(2025, 1, 15));
        assert!(!decision.allowed);
        assert_eq!(decision.source, Some(GrantSource::Plan));
    }

    #[test]
    fn test_disabled_toggle() {
        let mut c = ctx(Limit::Unlimited, 0);
        c.feature = Feature::toggle(c.feature.key.clone(), "SSO");
        c.plan_entitlement.as_mut().unwrap().enabled = false;

        let decision = resolve(&c, at(2025, 1, 15));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::FeatureDisabled);
        assert_eq!(decision.limit, None);
    }

    #[test]
    fn test_period_usage_resets_lazily() {
        let mut c = ctx(Limit::Capped(100), 100);
        c.feature.reset = UsageReset::BillingPeriod;

        let january = resolve(&c, at(2025, 1, 20));
        assert!(!january.allowed);

        let february = resolve(&c, at(2025, 2, 3));
        assert!(february.allowed);
        assert_eq!(february.usage, 0);
        assert_eq!(february.period.unwrap().start, at(2025, 2, 1));
    }

    #[test]
    fn test_cancelled_at_period_end_lapses() {
        let mut c = ctx(Limit::Capped(5), 0);
        c.subscription.as_mut().unwrap().cancel_at_period_end = true;

        assert!(resolve(&c, at(2025, 1, 31)).allowed);
        let after = resolve(&c, at(2025, 2, 1) + Duration::hours(1));
        assert_eq!(after.reason, DecisionReason::NoActiveSubscription);
    }

    proptest! {
        #[test]
        fn prop_unlimited_always_allowed(usage in any::<u64>(), day in 0i64..365) {
            let c = ctx(Limit::Unlimited, usage);
            let decision = resolve(&c, at(2025, 1, 1) + Duration::days(day));
            prop_assert!(decision.allowed);
            prop_assert_eq!(decision.remaining, Remaining::Unlimited);
        }

        #[test]
        fn prop_capped_allows_iff_below_limit(limit in 0u64..1_000, usage in 0u64..2_000) {
            let decision = resolve(&ctx(Limit::Capped(limit), usage), at(2025, 1, 15));
            prop_assert_eq!(decision.allowed, usage < limit);
            prop_assert_eq!(decision.remaining, Remaining::Count(limit.saturating_sub(usage)));
        }
    }
}
