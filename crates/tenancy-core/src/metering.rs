//! Usage Metering
//!
//! Records consumption of metered features. Every write is a single
//! check-and-increment run by the store under the usage row's write lock, so
//! concurrent requests for the same tenant and feature can never overshoot a
//! capped limit.

use crate::config::MeteringConfig;
use crate::error::{TenancyError, TenancyResult};
use crate::model::*;
use crate::resolver::{effective_limit, resolve};
use crate::retry::{with_backoff, Backoff};
use crate::store::{TenancyStore, UsageContext, UsageDecider, UsageKey, UsageMutation, UsageWrite};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const MAX_EVENT_PAGE: usize = 1_000;

/// Options for [`UsageMeter::record_usage_with`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordOptions {
    /// Record past a capped limit instead of failing
    pub allow_overage: bool,
    /// Repeating a key for the same tenant and feature replays the first write
    pub idempotency_key: Option<String>,
}

/// Result of a usage write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReceipt {
    pub tenant_id: TenantId,
    pub feature_key: FeatureKey,
    /// Counter after the write
    pub usage_count: u64,
    pub remaining: Remaining,
    pub kind: UsageEventKind,
    /// The idempotency key matched an earlier write; nothing was recorded
    pub replayed: bool,
}

/// Usage metering service
pub struct UsageMeter {
    store: Arc<dyn TenancyStore>,
    config: MeteringConfig,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn TenancyStore>, config: MeteringConfig) -> Self {
        Self { store, config }
    }

    /// Record `amount` units, failing with `QuotaExceeded` past the limit
    pub async fn record_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        amount: u64,
    ) -> TenancyResult<UsageReceipt> {
        self.record_usage_with(tenant_id, feature_key, amount, &RecordOptions::default())
            .await
    }

    /// Record with overage / idempotency options
    pub async fn record_usage_with(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        amount: u64,
        options: &RecordOptions,
    ) -> TenancyResult<UsageReceipt> {
        self.record_usage_at(tenant_id, feature_key, amount, options, Utc::now())
            .await
    }

    /// Record at an explicit instant
    pub async fn record_usage_at(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        amount: u64,
        options: &RecordOptions,
        now: DateTime<Utc>,
    ) -> TenancyResult<UsageReceipt> {
        if amount == 0 {
            return Err(TenancyError::Validation("amount must be positive".into()));
        }
        if let Some(idem) = &options.idempotency_key {
            if idem.is_empty() || idem.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(TenancyError::Validation(format!(
                    "idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
        }

        let allow_overage = options.allow_overage;
        let decide = |ctx: &UsageContext| -> TenancyResult<Option<UsageMutation>> {
            ensure_metered(&ctx.feature)?;

            let decision = resolve(ctx, now);
            if let Some(err) = decision.denial_error(ctx.tenant.status) {
                return Err(err);
            }

            let limit = decision.limit.unwrap_or(Limit::Unlimited);
            let usage = decision.usage;
            let next = usage
                .checked_add(amount)
                .ok_or_else(|| TenancyError::Validation("usage counter overflow".into()))?;

            let kind = if limit.admits(usage, amount) {
                UsageEventKind::Consumed
            } else if allow_overage {
                UsageEventKind::Overage
            } else {
                return Err(TenancyError::QuotaExceeded {
                    feature: ctx.feature.key.clone(),
                    limit: limit.cap().unwrap_or(u64::MAX),
                    usage,
                    requested: amount,
                });
            };

            Ok(Some(UsageMutation {
                usage_count: next,
                period_start: decision.period.map(|p| p.start).or(ctx.row.period_start),
                kind,
                amount,
                remaining: limit.remaining(next),
            }))
        };

        let key = UsageKey::new(tenant_id, feature_key.clone());
        let write = self
            .mutate("record_usage", &key, options.idempotency_key.as_deref(), now, &decide)
            .await?;

        if let Some(mutation) = &write.mutation {
            if mutation.kind == UsageEventKind::Overage {
                warn!(
                    tenant_id = %tenant_id,
                    feature = %feature_key,
                    usage = mutation.usage_count,
                    amount,
                    "Usage recorded past limit"
                );
            } else {
                debug!(tenant_id = %tenant_id, feature = %feature_key, usage = mutation.usage_count, "Usage recorded");
            }
        }

        self.receipt(&key, write, now).await
    }

    /// Return `amount` units to a gauge-like counter (saturating at zero)
    pub async fn release_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        amount: u64,
    ) -> TenancyResult<UsageReceipt> {
        if amount == 0 {
            return Err(TenancyError::Validation("amount must be positive".into()));
        }

        let now = Utc::now();
        let decide = |ctx: &UsageContext| -> TenancyResult<Option<UsageMutation>> {
            ensure_metered(&ctx.feature)?;

            let decision = resolve(ctx, now);
            let next = decision.usage.saturating_sub(amount);
            Ok(Some(UsageMutation {
                usage_count: next,
                period_start: decision.period.map(|p| p.start).or(ctx.row.period_start),
                kind: UsageEventKind::Released,
                amount: decision.usage - next,
                remaining: decision
                    .limit
                    .map_or(Remaining::Count(0), |limit| limit.remaining(next)),
            }))
        };

        let key = UsageKey::new(tenant_id, feature_key.clone());
        let write = self.mutate("release_usage", &key, None, now, &decide).await?;
        self.receipt(&key, write, now).await
    }

    /// Zero the counter unconditionally
    pub async fn reset_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
    ) -> TenancyResult<TenantFeature> {
        let now = Utc::now();
        let decide = |ctx: &UsageContext| -> TenancyResult<Option<UsageMutation>> {
            let period = ctx
                .subscription
                .as_ref()
                .and_then(|s| s.effective_period(now));
            Ok(Some(reset_mutation(
                ctx,
                period.map(|p| p.start).or(ctx.row.period_start),
                now,
            )))
        };

        let key = UsageKey::new(tenant_id, feature_key.clone());
        let write = self.mutate("reset_usage", &key, None, now, &decide).await?;
        info!(tenant_id = %tenant_id, feature = %feature_key, "Usage reset");
        Ok(write.row)
    }

    /// Zero the counter if it still belongs to a period before `period_start`
    ///
    /// Increments already stamped with the new period are kept, so a late
    /// rollover never wipes fresh usage. Returns whether anything was reset.
    pub async fn reset_usage_for_period(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        period_start: DateTime<Utc>,
    ) -> TenancyResult<bool> {
        let now = Utc::now();
        let decide = |ctx: &UsageContext| -> TenancyResult<Option<UsageMutation>> {
            let stale = ctx.row.period_start.map_or(true, |start| start < period_start);
            if !stale || ctx.row.usage_count == 0 {
                return Ok(None);
            }
            Ok(Some(reset_mutation(ctx, Some(period_start), now)))
        };

        let key = UsageKey::new(tenant_id, feature_key.clone());
        let write = self
            .mutate("reset_usage_for_period", &key, None, now, &decide)
            .await?;
        Ok(write.mutation.is_some())
    }

    /// Audit trail for one counter, newest first
    pub async fn usage_events(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        limit: usize,
    ) -> TenancyResult<Vec<UsageEvent>> {
        if self.store.get_tenant(tenant_id).await?.is_none() {
            return Err(TenancyError::UnknownTenant(tenant_id));
        }
        self.store
            .usage_events(
                &UsageKey::new(tenant_id, feature_key.clone()),
                limit.clamp(1, MAX_EVENT_PAGE),
            )
            .await
    }

    /// Run one store mutation under the deadline, retrying lock contention
    ///
    /// A timed-out attempt is dropped mid-flight, which rolls its
    /// transaction back.
    async fn mutate(
        &self,
        what: &str,
        key: &UsageKey,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
        decide: UsageDecider<'_>,
    ) -> TenancyResult<UsageWrite> {
        let deadline = self.config.operation_timeout();
        let timeout_ms = self.config.operation_timeout_ms;

        with_backoff(
            what,
            Backoff::new(self.config.conflict_retries, self.config.retry_backoff_ms),
            |err| matches!(err, TenancyError::ConcurrencyConflict(_)),
            || async move {
                tokio::time::timeout(
                    deadline,
                    self.store.mutate_usage(key, idempotency_key, now, decide),
                )
                .await
                .unwrap_or_else(|_| Err(TenancyError::Timeout(timeout_ms)))
            },
        )
        .await
    }

    async fn receipt(
        &self,
        key: &UsageKey,
        write: UsageWrite,
        now: DateTime<Utc>,
    ) -> TenancyResult<UsageReceipt> {
        let replayed = write.replayed();
        let (usage_count, kind, remaining) = match (write.mutation, write.event) {
            (Some(mutation), _) => (mutation.usage_count, mutation.kind, mutation.remaining),
            (None, Some(event)) => {
                let ctx = self.store.load_usage_context(key).await?;
                (event.usage_after, event.kind, resolve(&ctx, now).remaining)
            }
            (None, None) => {
                return Err(TenancyError::Persistence(
                    "usage write produced no event".into(),
                ))
            }
        };

        if replayed {
            debug!(tenant_id = %key.tenant_id, feature = %key.feature_key, "Usage write replayed");
        }

        Ok(UsageReceipt {
            tenant_id: key.tenant_id,
            feature_key: key.feature_key.clone(),
            usage_count,
            remaining,
            kind,
            replayed,
        })
    }
}

fn ensure_metered(feature: &Feature) -> TenancyResult<()> {
    if feature.kind != FeatureKind::Metered {
        return Err(TenancyError::Validation(format!(
            "feature {} is a toggle and has no usage counter",
            feature.key
        )));
    }
    Ok(())
}

fn reset_mutation(
    ctx: &UsageContext,
    period_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> UsageMutation {
    let limit = effective_limit(ctx, now).unwrap_or(Limit::Unlimited);
    UsageMutation {
        usage_count: 0,
        period_start,
        kind: UsageEventKind::Reset,
        amount: ctx.row.usage_count,
        remaining: limit.remaining(0),
    }
}
