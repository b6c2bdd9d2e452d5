//! Subscription Lifecycle
//!
//! ```text
//!   subscribe ──► trialing ──activate──► active ◄──┐
//!                    │                     │  │    │ rollover
//!                    │ lapse               │  └────┘
//!                    ▼                     ├──cancel──► cancelled
//!                 expired ◄── term ends ───┤
//!                                          └──change_plan──► superseded
//! ```
//!
//! Every save goes through the subscription's version (compare-and-set), so
//! two workers racing on the same transition apply it once.

use crate::catalog::{keys, PlanCatalog};
use crate::config::LifecycleConfig;
use crate::error::{TenancyError, TenancyResult};
use crate::metering::UsageMeter;
use crate::model::*;
use crate::registry::TenantRegistry;
use crate::retry::{with_backoff, Backoff};
use crate::store::{TenancyStore, UsageKey};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Subscribe request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: PlanId,
    /// Defaults to the plan's cycle
    pub billing_cycle: Option<BillingCycle>,
    /// Start with the plan's trial, if it offers one
    pub with_trial: bool,
}

/// How to cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Keep entitlements until the current period ends
    #[default]
    AtPeriodEnd,
    Immediately,
}

/// Result of [`SubscriptionLifecycle::rollover`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RolloverOutcome {
    /// Advanced to `period`; `counters_reset` period-scoped counters zeroed
    Rolled { period: Period, counters_reset: usize },
    /// Period has not ended, or another worker already rolled it
    NotDue,
    /// Period ended after a cancel-at-period-end
    Closed,
    /// Trial lapsed or fixed term ran out
    Expired,
}

/// Result of a plan change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanChange {
    pub previous: Subscription,
    pub current: Subscription,
    /// Price difference for the rest of the period (negative = credit)
    pub proration_amount: Decimal,
    pub effective_at: DateTime<Utc>,
}

/// Counts from [`SubscriptionLifecycle::sweep_due`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub rolled: usize,
    pub closed: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Rolling counters of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionUsage {
    pub subscription_id: SubscriptionId,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub period: Period,
    pub current_workspaces: u64,
    pub current_storage_mb: u64,
    pub current_executions_this_month: u64,
}

/// Subscription lifecycle service
pub struct SubscriptionLifecycle {
    store: Arc<dyn TenancyStore>,
    catalog: Arc<PlanCatalog>,
    registry: Arc<TenantRegistry>,
    meter: Arc<UsageMeter>,
    config: LifecycleConfig,
}

impl SubscriptionLifecycle {
    pub fn new(
        store: Arc<dyn TenancyStore>,
        catalog: Arc<PlanCatalog>,
        registry: Arc<TenantRegistry>,
        meter: Arc<UsageMeter>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            registry,
            meter,
            config,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.rollover_retries, self.config.retry_backoff_ms)
    }

    /// Start a subscription for a tenant without a live one
    pub async fn subscribe(
        &self,
        tenant_id: TenantId,
        request: SubscribeRequest,
    ) -> TenancyResult<Subscription> {
        let now = Utc::now();
        self.registry.get(tenant_id).await?;
        let plan = self.catalog.get_plan(request.plan_id).await?;
        if !plan.is_active {
            return Err(TenancyError::Validation(format!(
                "plan {} is not open for new subscriptions",
                plan.slug
            )));
        }

        // a lapsed trial must not block a new subscription
        if let Some(live) = self.ensure_current(tenant_id, now).await? {
            return Err(TenancyError::Conflict(format!(
                "tenant {tenant_id} already has {} subscription {}",
                live.status, live.subscription_id
            )));
        }

        let cycle = request.billing_cycle.unwrap_or(plan.billing_cycle);
        let subscription = if request.with_trial && plan.trial_days > 0 {
            Subscription::trial(tenant_id, plan.plan_id, cycle, plan.trial_days, now)
        } else {
            Subscription::active(tenant_id, plan.plan_id, cycle, now)
        };
        self.store.insert_subscription(&subscription).await?;

        let status = match subscription.status {
            SubscriptionStatus::Trialing => TenantStatus::Trial,
            _ => TenantStatus::Active,
        };
        self.registry
            .apply_subscription(tenant_id, Some(plan.plan_id), Some(status), now)
            .await?;

        info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription.subscription_id,
            plan = %plan.slug,
            status = %subscription.status,
            period_end = %subscription.current_period_end,
            "Subscription started"
        );
        Ok(subscription)
    }

    /// Convert a trial into a paid subscription starting now
    pub async fn activate(&self, subscription_id: SubscriptionId) -> TenancyResult<Subscription> {
        let now = Utc::now();
        let sub = self.get_subscription(subscription_id).await?;
        if sub.status != SubscriptionStatus::Trialing {
            return Err(TenancyError::InvalidTransition {
                from: sub.status.to_string(),
                to: SubscriptionStatus::Active.to_string(),
            });
        }

        let period = sub.billing_cycle.period_from(now);
        let mut next = sub.clone();
        next.status = SubscriptionStatus::Active;
        next.billing_anchor = now;
        next.current_period_start = period.start;
        next.current_period_end = period.end;
        next.touch(now);
        self.save(&next, sub.version).await?;

        self.registry
            .apply_subscription(sub.tenant_id, Some(sub.plan_id), Some(TenantStatus::Active), now)
            .await?;
        info!(subscription_id = %subscription_id, "Trial converted to paid subscription");
        Ok(next)
    }

    /// Move the tenant to another plan
    ///
    /// The live subscription is superseded, not overwritten; its successor
    /// keeps the billing period so period usage carries over.
    pub async fn change_plan(&self, tenant_id: TenantId, new_plan_id: PlanId) -> TenancyResult<PlanChange> {
        let now = Utc::now();
        let new_plan = self.catalog.get_plan(new_plan_id).await?;
        if !new_plan.is_active {
            return Err(TenancyError::Validation(format!(
                "plan {} is not open for new subscriptions",
                new_plan.slug
            )));
        }

        let old = self
            .ensure_current(tenant_id, now)
            .await?
            .ok_or(TenancyError::NoActiveSubscription(tenant_id))?;
        if old.plan_id == new_plan_id {
            return Err(TenancyError::Validation(format!(
                "tenant {tenant_id} is already on plan {}",
                new_plan.slug
            )));
        }
        let old_plan = self.catalog.get_plan(old.plan_id).await?;

        let mut current = old.clone();
        current.subscription_id = uuid::Uuid::new_v4();
        current.plan_id = new_plan_id;
        current.superseded_by = None;
        current.version = 0;
        current.created_at = now;
        current.updated_at = now;

        let mut previous = old.clone();
        previous.status = SubscriptionStatus::Superseded;
        previous.superseded_by = Some(current.subscription_id);
        previous.touch(now);

        if !self
            .store
            .replace_subscription(&previous, old.version, &current)
            .await?
        {
            return Err(TenancyError::ConcurrencyConflict(format!(
                "subscription {} changed during plan change",
                old.subscription_id
            )));
        }
        self.registry
            .apply_subscription(tenant_id, Some(new_plan_id), None, now)
            .await?;

        let proration_amount = if old.status == SubscriptionStatus::Active {
            prorate(&old.current_period(), now, old_plan.price, new_plan.price)
        } else {
            Decimal::ZERO
        };

        info!(
            tenant_id = %tenant_id,
            from = %old_plan.slug,
            to = %new_plan.slug,
            %proration_amount,
            "Plan changed"
        );
        Ok(PlanChange {
            previous,
            current,
            proration_amount,
            effective_at: now,
        })
    }

    /// Apply the transition due at `now`, if any
    ///
    /// Idempotent: once one caller has advanced the period, later calls for
    /// the same period report `NotDue`.
    pub async fn rollover(
        &self,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> TenancyResult<RolloverOutcome> {
        with_backoff("rollover", self.backoff(), TenancyError::is_retryable, || async move {
            let sub = self.get_subscription(subscription_id).await?;
            self.advance(&sub, now).await
        })
        .await
    }

    /// Cancel a live subscription
    pub async fn cancel(
        &self,
        subscription_id: SubscriptionId,
        mode: CancelMode,
    ) -> TenancyResult<Subscription> {
        let now = Utc::now();
        let sub = self.get_subscription(subscription_id).await?;
        if !sub.status.is_live() {
            return Err(TenancyError::InvalidTransition {
                from: sub.status.to_string(),
                to: SubscriptionStatus::Cancelled.to_string(),
            });
        }

        let mut next = sub.clone();
        match mode {
            CancelMode::AtPeriodEnd if sub.cancel_at_period_end => return Ok(sub),
            CancelMode::AtPeriodEnd => {
                next.cancel_at_period_end = true;
                next.cancelled_at = Some(now);
            }
            CancelMode::Immediately => {
                next.status = SubscriptionStatus::Cancelled;
                next.cancelled_at = Some(now);
            }
        }
        next.touch(now);
        self.save(&next, sub.version).await?;

        if next.status == SubscriptionStatus::Cancelled {
            self.registry
                .apply_subscription(sub.tenant_id, None, None, now)
                .await?;
        }
        info!(subscription_id = %subscription_id, ?mode, "Subscription cancelled");
        Ok(next)
    }

    /// Undo a pending cancel-at-period-end
    pub async fn resume(&self, subscription_id: SubscriptionId) -> TenancyResult<Subscription> {
        let now = Utc::now();
        let sub = self.get_subscription(subscription_id).await?;
        if !sub.status.is_live() || !sub.cancel_at_period_end || now >= sub.current_period_end {
            return Err(TenancyError::InvalidTransition {
                from: sub.status.to_string(),
                to: sub.status.to_string(),
            });
        }

        let mut next = sub.clone();
        next.cancel_at_period_end = false;
        next.cancelled_at = None;
        next.touch(now);
        self.save(&next, sub.version).await?;
        info!(subscription_id = %subscription_id, "Subscription resumed");
        Ok(next)
    }

    /// Expire a subscription whose trial or term has run out
    pub async fn expire(
        &self,
        subscription_id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> TenancyResult<Subscription> {
        let sub = self.get_subscription(subscription_id).await?;
        if sub.pending_transition(now) != Some(Transition::Expire) {
            return Err(TenancyError::InvalidTransition {
                from: sub.status.to_string(),
                to: SubscriptionStatus::Expired.to_string(),
            });
        }
        self.finish(&sub, SubscriptionStatus::Expired, now).await
    }

    /// Persist whatever transition the tenant's live subscription is due for
    ///
    /// Returns the live subscription afterwards, `None` if it ended.
    pub async fn ensure_current(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> TenancyResult<Option<Subscription>> {
        with_backoff("ensure_current", self.backoff(), TenancyError::is_retryable, || async move {
            let Some(sub) = self.store.live_subscription(tenant_id).await? else {
                return Ok(None);
            };
            if sub.pending_transition(now).is_none() {
                return Ok(Some(sub));
            }
            self.advance(&sub, now).await?;
            self.store.live_subscription(tenant_id).await
        })
        .await
    }

    /// Advance every due live subscription (background sweeper)
    pub async fn sweep_due(&self, now: DateTime<Utc>) -> TenancyResult<SweepReport> {
        let mut report = SweepReport::default();
        let live = self
            .store
            .list_live_subscriptions(self.config.sweep_batch_size)
            .await?;

        for sub in live {
            report.examined += 1;
            if sub.pending_transition(now).is_none() {
                continue;
            }
            match self.rollover(sub.subscription_id, now).await {
                Ok(RolloverOutcome::Rolled { .. }) => report.rolled += 1,
                Ok(RolloverOutcome::Closed) => report.closed += 1,
                Ok(RolloverOutcome::Expired) => report.expired += 1,
                Ok(RolloverOutcome::NotDue) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(subscription_id = %sub.subscription_id, error = %err, "Rollover failed");
                }
            }
        }

        if report.rolled + report.closed + report.expired + report.failed > 0 {
            info!(?report, "Subscription sweep finished");
        }
        Ok(report)
    }

    pub async fn get_subscription(&self, subscription_id: SubscriptionId) -> TenancyResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or(TenancyError::UnknownSubscription(subscription_id))
    }

    /// The tenant's trialing/active subscription, as persisted
    pub async fn active_subscription(&self, tenant_id: TenantId) -> TenancyResult<Option<Subscription>> {
        self.registry.get(tenant_id).await?;
        self.store.live_subscription(tenant_id).await
    }

    /// Subscription history, newest first
    pub async fn list_subscriptions(&self, tenant_id: TenantId) -> TenancyResult<Vec<Subscription>> {
        self.registry.get(tenant_id).await?;
        self.store.list_subscriptions(tenant_id).await
    }

    /// Workspaces, storage and executions counted against the current period
    pub async fn subscription_usage(&self, tenant_id: TenantId) -> TenancyResult<SubscriptionUsage> {
        let now = Utc::now();
        let sub = self
            .active_subscription(tenant_id)
            .await?
            .ok_or(TenancyError::NoActiveSubscription(tenant_id))?;
        let period = sub
            .effective_period(now)
            .ok_or(TenancyError::NoActiveSubscription(tenant_id))?;

        Ok(SubscriptionUsage {
            subscription_id: sub.subscription_id,
            tenant_id,
            plan_id: sub.plan_id,
            status: sub.status,
            period,
            current_workspaces: self.counter(tenant_id, keys::MAX_WORKSPACES, &period).await?,
            current_storage_mb: self.counter(tenant_id, keys::STORAGE_MB, &period).await?,
            current_executions_this_month: self
                .counter(tenant_id, keys::EXECUTIONS_PER_MONTH, &period)
                .await?,
        })
    }

    async fn counter(&self, tenant_id: TenantId, key: &'static str, period: &Period) -> TenancyResult<u64> {
        let key = FeatureKey::from_static(key);
        let Some(feature) = self.store.get_feature(&key).await? else {
            return Ok(0);
        };
        let row = self
            .store
            .get_tenant_feature(&UsageKey::new(tenant_id, key))
            .await?;
        Ok(row.map_or(0, |r| r.usage_in(&feature, Some(period))))
    }

    async fn save(&self, next: &Subscription, expected_version: u64) -> TenancyResult<()> {
        if self
            .store
            .compare_and_save_subscription(next, expected_version)
            .await?
        {
            Ok(())
        } else {
            Err(TenancyError::ConcurrencyConflict(format!(
                "subscription {} was modified concurrently",
                next.subscription_id
            )))
        }
    }

    async fn advance(&self, sub: &Subscription, now: DateTime<Utc>) -> TenancyResult<RolloverOutcome> {
        match sub.pending_transition(now) {
            None => Ok(RolloverOutcome::NotDue),
            Some(Transition::Close) => {
                self.finish(sub, SubscriptionStatus::Cancelled, now).await?;
                Ok(RolloverOutcome::Closed)
            }
            Some(Transition::Expire) => {
                self.finish(sub, SubscriptionStatus::Expired, now).await?;
                Ok(RolloverOutcome::Expired)
            }
            Some(Transition::Rollover) => {
                let Some(next) = sub.rolled_over(now) else {
                    return Ok(RolloverOutcome::NotDue);
                };
                self.save(&next, sub.version).await?;

                let period = next.current_period();
                let mut counters_reset = 0;
                for feature in self.store.list_features().await? {
                    if feature.is_period_scoped()
                        && self
                            .meter
                            .reset_usage_for_period(sub.tenant_id, &feature.key, period.start)
                            .await?
                    {
                        counters_reset += 1;
                    }
                }

                info!(
                    subscription_id = %sub.subscription_id,
                    tenant_id = %sub.tenant_id,
                    period_start = %period.start,
                    period_end = %period.end,
                    counters_reset,
                    "Subscription rolled over"
                );
                Ok(RolloverOutcome::Rolled { period, counters_reset })
            }
        }
    }

    async fn finish(
        &self,
        sub: &Subscription,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> TenancyResult<Subscription> {
        let mut next = sub.clone();
        next.status = status;
        next.touch(now);
        self.save(&next, sub.version).await?;

        let tenant_status = (status == SubscriptionStatus::Expired).then_some(TenantStatus::Expired);
        self.registry
            .apply_subscription(sub.tenant_id, None, tenant_status, now)
            .await?;
        info!(subscription_id = %sub.subscription_id, tenant_id = %sub.tenant_id, %status, "Subscription ended");
        Ok(next)
    }
}

/// Price difference for the unused part of `period`, rounded to cents
fn prorate(period: &Period, at: DateTime<Utc>, old_price: Decimal, new_price: Decimal) -> Decimal {
    let total = (period.end - period.start).num_seconds();
    let left = (period.end - at).num_seconds().clamp(0, total.max(0));
    if total <= 0 {
        return Decimal::ZERO;
    }
    ((new_price - old_price) * Decimal::from(left) / Decimal::from(total)).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSeed;
    use crate::config::MeteringConfig;
    use crate::metering::RecordOptions;
    use crate::store::{InMemoryStore, SubscriptionRepository, UsageRepository};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<InMemoryStore>,
        catalog: Arc<PlanCatalog>,
        registry: Arc<TenantRegistry>,
        meter: Arc<UsageMeter>,
        lifecycle: SubscriptionLifecycle,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let catalog = Arc::new(PlanCatalog::new(store.clone()));
        catalog.apply_seed(&CatalogSeed::standard()).await.unwrap();
        let registry = Arc::new(TenantRegistry::new(store.clone()));
        let meter = Arc::new(UsageMeter::new(store.clone(), MeteringConfig::default()));
        let lifecycle = SubscriptionLifecycle::new(
            store.clone(),
            catalog.clone(),
            registry.clone(),
            meter.clone(),
            LifecycleConfig::default(),
        );
        Harness { store, catalog, registry, meter, lifecycle }
    }

    async fn plan(h: &Harness, slug: &str) -> Plan {
        h.catalog.get_plan_by_slug(slug).await.unwrap()
    }

    fn paid(plan: &Plan) -> SubscribeRequest {
        SubscribeRequest { plan_id: plan.plan_id, billing_cycle: None, with_trial: false }
    }

    /// Move a live subscription's first period `days_ago` into the past
    ///
    /// With `days_ago > 31` the stored period has ended and a rollover is due.
    async fn backdate(h: &Harness, sub: &Subscription, days_ago: i64) -> Subscription {
        let anchor = Utc::now() - Duration::days(days_ago);
        let period = sub.billing_cycle.period_from(anchor);
        let mut old = sub.clone();
        old.billing_anchor = anchor;
        old.created_at = anchor;
        old.current_period_start = period.start;
        old.current_period_end = period.end;
        if old.trial_end.is_some() {
            old.trial_end = Some(period.end);
        }
        old.touch(Utc::now());
        assert!(h.store.compare_and_save_subscription(&old, sub.version).await.unwrap());
        old
    }

    #[tokio::test]
    async fn test_subscribe_sets_tenant_plan() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let pro = plan(&h, "pro").await;

        let sub = h.lifecycle.subscribe(tenant.tenant_id, paid(&pro)).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);

        let tenant = h.registry.get(tenant.tenant_id).await.unwrap();
        assert_eq!(tenant.plan_id, Some(pro.plan_id));
        assert_eq!(tenant.status, TenantStatus::Active);

        let err = h.lifecycle.subscribe(tenant.tenant_id, paid(&pro)).await.unwrap_err();
        assert!(matches!(err, TenancyError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_trial_then_activate() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let pro = plan(&h, "pro").await;

        let trial = h
            .lifecycle
            .subscribe(tenant.tenant_id, SubscribeRequest { with_trial: true, ..paid(&pro) })
            .await
            .unwrap();
        assert_eq!(trial.status, SubscriptionStatus::Trialing);
        assert_eq!(h.registry.get(tenant.tenant_id).await.unwrap().status, TenantStatus::Trial);

        let active = h.lifecycle.activate(trial.subscription_id).await.unwrap();
        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(h.registry.get(tenant.tenant_id).await.unwrap().status, TenantStatus::Active);

        let err = h.lifecycle.activate(trial.subscription_id).await.unwrap_err();
        assert!(matches!(err, TenancyError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_rollover_is_idempotent() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let sub = h.lifecycle.subscribe(tenant.tenant_id, paid(&plan(&h, "pro").await)).await.unwrap();
        let executions = FeatureKey::new(keys::EXECUTIONS_PER_MONTH).unwrap();

        let sub = backdate(&h, &sub, 40).await;
        let during = sub.current_period_start + Duration::days(1);
        h.meter
            .record_usage_at(tenant.tenant_id, &executions, 7, &RecordOptions::default(), during)
            .await
            .unwrap();

        let now = Utc::now();
        let first = h.lifecycle.rollover(sub.subscription_id, now).await.unwrap();
        assert!(matches!(first, RolloverOutcome::Rolled { counters_reset: 1, .. }));
        let second = h.lifecycle.rollover(sub.subscription_id, now).await.unwrap();
        assert_eq!(second, RolloverOutcome::NotDue);

        let usage = h.lifecycle.subscription_usage(tenant.tenant_id).await.unwrap();
        assert_eq!(usage.current_executions_this_month, 0);
        let rolled = h.lifecycle.get_subscription(sub.subscription_id).await.unwrap();
        assert!(rolled.current_period().contains(now));

        let row = h
            .store
            .get_tenant_feature(&UsageKey::new(tenant.tenant_id, executions))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.usage_count, 0);
    }

    #[tokio::test]
    async fn test_gauge_counters_survive_rollover() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let sub = h.lifecycle.subscribe(tenant.tenant_id, paid(&plan(&h, "pro").await)).await.unwrap();
        let workspaces = FeatureKey::new(keys::MAX_WORKSPACES).unwrap();

        h.meter.record_usage(tenant.tenant_id, &workspaces, 3).await.unwrap();
        let sub = backdate(&h, &sub, 40).await;
        h.lifecycle.rollover(sub.subscription_id, Utc::now()).await.unwrap();

        let usage = h.lifecycle.subscription_usage(tenant.tenant_id).await.unwrap();
        assert_eq!(usage.current_workspaces, 3);
    }

    #[tokio::test]
    async fn test_cancel_at_period_end() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let sub = h.lifecycle.subscribe(tenant.tenant_id, paid(&plan(&h, "pro").await)).await.unwrap();

        let cancelled = h.lifecycle.cancel(sub.subscription_id, CancelMode::AtPeriodEnd).await.unwrap();
        assert!(cancelled.cancel_at_period_end);
        assert_eq!(cancelled.status, SubscriptionStatus::Active);

        let sub = backdate(&h, &cancelled, 40).await;
        let outcome = h.lifecycle.rollover(sub.subscription_id, Utc::now()).await.unwrap();
        assert_eq!(outcome, RolloverOutcome::Closed);

        let closed = h.lifecycle.get_subscription(sub.subscription_id).await.unwrap();
        assert_eq!(closed.status, SubscriptionStatus::Cancelled);
        assert!(h.lifecycle.active_subscription(tenant.tenant_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_pending_cancel() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let sub = h.lifecycle.subscribe(tenant.tenant_id, paid(&plan(&h, "pro").await)).await.unwrap();

        h.lifecycle.cancel(sub.subscription_id, CancelMode::AtPeriodEnd).await.unwrap();
        let resumed = h.lifecycle.resume(sub.subscription_id).await.unwrap();
        assert!(!resumed.cancel_at_period_end);
        assert!(resumed.cancelled_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_immediately_denies_usage() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let sub = h.lifecycle.subscribe(tenant.tenant_id, paid(&plan(&h, "pro").await)).await.unwrap();

        h.lifecycle.cancel(sub.subscription_id, CancelMode::Immediately).await.unwrap();
        let err = h
            .meter
            .record_usage(tenant.tenant_id, &FeatureKey::new(keys::WORKFLOWS).unwrap(), 1)
            .await
            .unwrap_err();
        assert_eq!(err, TenancyError::NoActiveSubscription(tenant.tenant_id));

        let again = h.lifecycle.cancel(sub.subscription_id, CancelMode::Immediately).await;
        assert!(matches!(again, Err(TenancyError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_lapsed_trial_expires_tenant() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let pro = plan(&h, "pro").await;
        let trial = h
            .lifecycle
            .subscribe(tenant.tenant_id, SubscribeRequest { with_trial: true, ..paid(&pro) })
            .await
            .unwrap();

        let later = trial.current_period_end + Duration::hours(1);
        let expired = h.lifecycle.expire(trial.subscription_id, later).await.unwrap();
        assert_eq!(expired.status, SubscriptionStatus::Expired);
        assert_eq!(h.registry.get(tenant.tenant_id).await.unwrap().status, TenantStatus::Expired);

        // a new subscription revives the tenant
        h.lifecycle.subscribe(tenant.tenant_id, paid(&pro)).await.unwrap();
        assert_eq!(h.registry.get(tenant.tenant_id).await.unwrap().status, TenantStatus::Active);
    }

    #[tokio::test]
    async fn test_expire_before_due_rejected() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let sub = h.lifecycle.subscribe(tenant.tenant_id, paid(&plan(&h, "pro").await)).await.unwrap();

        let err = h.lifecycle.expire(sub.subscription_id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, TenancyError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_change_plan_supersedes() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let pro = plan(&h, "pro").await;
        let enterprise = plan(&h, "enterprise").await;
        let old = h.lifecycle.subscribe(tenant.tenant_id, paid(&pro)).await.unwrap();

        let executions = FeatureKey::new(keys::EXECUTIONS_PER_MONTH).unwrap();
        h.meter.record_usage(tenant.tenant_id, &executions, 11).await.unwrap();

        let change = h.lifecycle.change_plan(tenant.tenant_id, enterprise.plan_id).await.unwrap();
        assert_eq!(change.previous.status, SubscriptionStatus::Superseded);
        assert_eq!(change.previous.superseded_by, Some(change.current.subscription_id));
        assert_eq!(change.current.current_period_start, old.current_period_start);
        assert!(change.proration_amount > Decimal::ZERO);

        let history = h.lifecycle.list_subscriptions(tenant.tenant_id).await.unwrap();
        assert_eq!(history.len(), 2);
        let usage = h.lifecycle.subscription_usage(tenant.tenant_id).await.unwrap();
        assert_eq!(usage.plan_id, enterprise.plan_id);
        assert_eq!(usage.current_executions_this_month, 11);

        let same = h.lifecycle.change_plan(tenant.tenant_id, enterprise.plan_id).await;
        assert!(matches!(same, Err(TenancyError::Validation(_))));
    }

    #[tokio::test]
    async fn test_record_after_missed_period_starts_fresh() {
        let h = harness().await;
        let tenant = h.registry.create("Acme").await.unwrap();
        let free = plan(&h, "free").await;
        let sub = h.lifecycle.subscribe(tenant.tenant_id, paid(&free)).await.unwrap();
        let executions = FeatureKey::new(keys::EXECUTIONS_PER_MONTH).unwrap();

        let sub = backdate(&h, &sub, 40).await;
        let during = sub.current_period_start + Duration::days(1);
        let options = RecordOptions::default();
        h.meter
            .record_usage_at(tenant.tenant_id, &executions, 100, &options, during)
            .await
            .unwrap();
        let full = h.meter.record_usage_at(tenant.tenant_id, &executions, 1, &options, during).await;
        assert!(matches!(full, Err(TenancyError::QuotaExceeded { .. })));

        // no rollover persisted yet; the counter already belongs to a past period
        let receipt = h.meter.record_usage(tenant.tenant_id, &executions, 1).await.unwrap();
        assert_eq!(receipt.usage_count, 1);

        let current = h.lifecycle.ensure_current(tenant.tenant_id, Utc::now()).await.unwrap().unwrap();
        assert!(current.current_period().contains(Utc::now()));
        let usage = h.lifecycle.subscription_usage(tenant.tenant_id).await.unwrap();
        assert_eq!(usage.current_executions_this_month, 1);
    }

    #[tokio::test]
    async fn test_sweep_counts_transitions() {
        let h = harness().await;
        let pro = plan(&h, "pro").await;

        let a = h.registry.create("A").await.unwrap();
        let sub_a = h.lifecycle.subscribe(a.tenant_id, paid(&pro)).await.unwrap();
        backdate(&h, &sub_a, 40).await;

        let b = h.registry.create("B").await.unwrap();
        h.lifecycle.subscribe(b.tenant_id, paid(&pro)).await.unwrap();

        let report = h.lifecycle.sweep_due(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.rolled, 1);
        assert_eq!(report.failed, 0);

        let again = h.lifecycle.sweep_due(Utc::now()).await.unwrap();
        assert_eq!(again.rolled, 0);
    }

    #[test]
    fn test_proration() {
        let start = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let period = BillingCycle::Monthly.period_from(start);
        let halfway = start + Duration::days(15);

        assert_eq!(prorate(&period, halfway, dec!(29), dec!(89)), dec!(30.00));
        assert_eq!(prorate(&period, halfway, dec!(89), dec!(29)), dec!(-30.00));
        assert_eq!(prorate(&period, period.end, dec!(29), dec!(89)), Decimal::ZERO);
    }
}
