//! Repository trait implementations

use crate::codec::{self, limit_columns, opt_ts, to_i64, ts};
use crate::{db_err, SqliteStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tenancy_core::store::{
    CatalogRepository, SubscriptionRepository, TenantRepository, UsageContext, UsageDecider,
    UsageKey, UsageRepository, UsageWrite,
};
use tenancy_core::*;
use tracing::debug;
use uuid::Uuid;

const LIVE_STATUSES: &str = "('trialing', 'active')";

fn unique_or(err: sqlx::Error, message: impl FnOnce() -> String) -> TenancyError {
    match db_err(err) {
        TenancyError::Conflict(_) => TenancyError::Conflict(message()),
        other => other,
    }
}

fn row_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ============ Shared queries ============

async fn fetch_tenant(conn: &mut SqliteConnection, tenant_id: TenantId) -> TenancyResult<Option<Tenant>> {
    sqlx::query("SELECT * FROM tenants WHERE tenant_id = ?")
        .bind(tenant_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(|row| codec::tenant(&row))
        .transpose()
}

async fn fetch_feature(conn: &mut SqliteConnection, key: &FeatureKey) -> TenancyResult<Option<Feature>> {
    sqlx::query("SELECT * FROM features WHERE feature_key = ?")
        .bind(key.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(|row| codec::feature(&row))
        .transpose()
}

async fn fetch_entitlement(
    conn: &mut SqliteConnection,
    plan_id: PlanId,
    key: &FeatureKey,
) -> TenancyResult<Option<PlanEntitlement>> {
    sqlx::query("SELECT * FROM plan_entitlements WHERE plan_id = ? AND feature_key = ?")
        .bind(plan_id.to_string())
        .bind(key.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(|row| codec::entitlement(&row))
        .transpose()
}

async fn fetch_live(conn: &mut SqliteConnection, tenant_id: TenantId) -> TenancyResult<Option<Subscription>> {
    sqlx::query(&format!(
        "SELECT * FROM subscriptions WHERE tenant_id = ? AND status IN {LIVE_STATUSES}"
    ))
    .bind(tenant_id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .map(|row| codec::subscription(&row))
    .transpose()
}

async fn fetch_row(conn: &mut SqliteConnection, key: &UsageKey) -> TenancyResult<Option<TenantFeature>> {
    sqlx::query("SELECT * FROM tenant_features WHERE tenant_id = ? AND feature_key = ?")
        .bind(key.tenant_id.to_string())
        .bind(key.feature_key.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(|row| codec::tenant_feature(&row))
        .transpose()
}

/// Take the database write lock inside a fresh transaction
///
/// A no-op update is the first statement, so the lock is acquired before
/// anything is read and never needs upgrading.
async fn lock_tenant(conn: &mut SqliteConnection, tenant_id: TenantId) -> TenancyResult<()> {
    let touched = sqlx::query("UPDATE tenants SET updated_at = updated_at WHERE tenant_id = ?")
        .bind(tenant_id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    if touched.rows_affected() == 0 {
        return Err(TenancyError::UnknownTenant(tenant_id));
    }
    Ok(())
}

async fn load_context(
    conn: &mut SqliteConnection,
    key: &UsageKey,
    now: DateTime<Utc>,
) -> TenancyResult<UsageContext> {
    let tenant = fetch_tenant(conn, key.tenant_id)
        .await?
        .ok_or(TenancyError::UnknownTenant(key.tenant_id))?;
    let feature = fetch_feature(conn, &key.feature_key)
        .await?
        .ok_or_else(|| TenancyError::UnknownFeature(key.feature_key.clone()))?;
    let row = fetch_row(conn, key)
        .await?
        .unwrap_or_else(|| TenantFeature::fresh(key.tenant_id, key.feature_key.clone(), now));
    let subscription = fetch_live(conn, key.tenant_id).await?;
    let plan_entitlement = match &subscription {
        Some(sub) => fetch_entitlement(conn, sub.plan_id, &key.feature_key).await?,
        None => None,
    };

    Ok(UsageContext {
        tenant,
        feature,
        subscription,
        plan_entitlement,
        row,
    })
}

async fn insert_subscription_row(
    conn: &mut SqliteConnection,
    sub: &Subscription,
) -> TenancyResult<()> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions (
            subscription_id, tenant_id, plan_id, status, billing_cycle, billing_anchor,
            current_period_start, current_period_end, trial_end, cancel_at_period_end,
            cancelled_at, expires_at, superseded_by, version, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(sub.subscription_id.to_string())
    .bind(sub.tenant_id.to_string())
    .bind(sub.plan_id.to_string())
    .bind(sub.status.as_str())
    .bind(sub.billing_cycle.as_str())
    .bind(ts(sub.billing_anchor))
    .bind(ts(sub.current_period_start))
    .bind(ts(sub.current_period_end))
    .bind(opt_ts(sub.trial_end))
    .bind(sub.cancel_at_period_end)
    .bind(opt_ts(sub.cancelled_at))
    .bind(opt_ts(sub.expires_at))
    .bind(sub.superseded_by.map(|id| id.to_string()))
    .bind(to_i64("version", sub.version)?)
    .bind(ts(sub.created_at))
    .bind(ts(sub.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        unique_or(e, || {
            format!("tenant {} already has a live subscription", sub.tenant_id)
        })
    })?;
    Ok(())
}

/// Versioned overwrite; `false` when the stored version moved on
async fn compare_and_update(
    conn: &mut SqliteConnection,
    sub: &Subscription,
    expected_version: u64,
) -> TenancyResult<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE subscriptions SET
            plan_id = ?, status = ?, billing_cycle = ?, billing_anchor = ?,
            current_period_start = ?, current_period_end = ?, trial_end = ?,
            cancel_at_period_end = ?, cancelled_at = ?, expires_at = ?, superseded_by = ?,
            version = ?, updated_at = ?
        WHERE subscription_id = ? AND version = ?
        "#,
    )
    .bind(sub.plan_id.to_string())
    .bind(sub.status.as_str())
    .bind(sub.billing_cycle.as_str())
    .bind(ts(sub.billing_anchor))
    .bind(ts(sub.current_period_start))
    .bind(ts(sub.current_period_end))
    .bind(opt_ts(sub.trial_end))
    .bind(sub.cancel_at_period_end)
    .bind(opt_ts(sub.cancelled_at))
    .bind(opt_ts(sub.expires_at))
    .bind(sub.superseded_by.map(|id| id.to_string()))
    .bind(to_i64("version", sub.version)?)
    .bind(ts(sub.updated_at))
    .bind(sub.subscription_id.to_string())
    .bind(to_i64("version", expected_version)?)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        unique_or(e, || {
            format!("tenant {} already has a live subscription", sub.tenant_id)
        })
    })?;

    if updated.rows_affected() == 1 {
        return Ok(true);
    }

    let exists = sqlx::query("SELECT 1 FROM subscriptions WHERE subscription_id = ?")
        .bind(sub.subscription_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    match exists {
        Some(_) => Ok(false),
        None => Err(TenancyError::UnknownSubscription(sub.subscription_id)),
    }
}

// ============ Catalog ============

#[async_trait]
impl CatalogRepository for SqliteStore {
    async fn insert_feature(&self, feature: &Feature) -> TenancyResult<()> {
        sqlx::query(
            "INSERT INTO features (feature_key, name, description, kind, reset) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(feature.key.as_str())
        .bind(&feature.name)
        .bind(&feature.description)
        .bind(feature.kind.as_str())
        .bind(feature.reset.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or(e, || format!("feature {} exists", feature.key)))?;
        Ok(())
    }

    async fn get_feature(&self, key: &FeatureKey) -> TenancyResult<Option<Feature>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_feature(&mut conn, key).await
    }

    async fn list_features(&self) -> TenancyResult<Vec<Feature>> {
        sqlx::query("SELECT * FROM features ORDER BY feature_key")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(codec::feature)
            .collect()
    }

    async fn insert_plan(&self, plan: &Plan) -> TenancyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (
                plan_id, slug, name, description, price, currency,
                billing_cycle, trial_days, is_active, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(plan.plan_id.to_string())
        .bind(&plan.slug)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price.to_string())
        .bind(&plan.currency)
        .bind(plan.billing_cycle.as_str())
        .bind(i64::from(plan.trial_days))
        .bind(plan.is_active)
        .bind(ts(plan.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or(e, || format!("plan {} exists", plan.slug)))?;
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> TenancyResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE plans SET
                slug = ?, name = ?, description = ?, price = ?, currency = ?,
                billing_cycle = ?, trial_days = ?, is_active = ?
            WHERE plan_id = ?
            "#,
        )
        .bind(&plan.slug)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price.to_string())
        .bind(&plan.currency)
        .bind(plan.billing_cycle.as_str())
        .bind(i64::from(plan.trial_days))
        .bind(plan.is_active)
        .bind(plan.plan_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or(e, || format!("plan {} exists", plan.slug)))?;

        if updated.rows_affected() == 0 {
            return Err(TenancyError::UnknownPlan(plan.plan_id.to_string()));
        }
        Ok(())
    }

    async fn get_plan(&self, plan_id: PlanId) -> TenancyResult<Option<Plan>> {
        sqlx::query("SELECT * FROM plans WHERE plan_id = ?")
            .bind(plan_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| codec::plan(&row))
            .transpose()
    }

    async fn get_plan_by_slug(&self, slug: &str) -> TenancyResult<Option<Plan>> {
        sqlx::query("SELECT * FROM plans WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| codec::plan(&row))
            .transpose()
    }

    async fn list_plans(&self) -> TenancyResult<Vec<Plan>> {
        sqlx::query("SELECT * FROM plans ORDER BY slug")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(codec::plan)
            .collect()
    }

    async fn upsert_entitlement(&self, entitlement: &PlanEntitlement) -> TenancyResult<()> {
        let (is_unlimited, limit_value) = limit_columns(&entitlement.limit)?;
        sqlx::query(
            r#"
            INSERT INTO plan_entitlements (plan_id, feature_key, enabled, is_unlimited, limit_value)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (plan_id, feature_key) DO UPDATE SET
                enabled = excluded.enabled,
                is_unlimited = excluded.is_unlimited,
                limit_value = excluded.limit_value
            "#,
        )
        .bind(entitlement.plan_id.to_string())
        .bind(entitlement.feature_key.as_str())
        .bind(entitlement.enabled)
        .bind(is_unlimited)
        .bind(limit_value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_entitlement(
        &self,
        plan_id: PlanId,
        key: &FeatureKey,
    ) -> TenancyResult<Option<PlanEntitlement>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_entitlement(&mut conn, plan_id, key).await
    }

    async fn list_entitlements(&self, plan_id: PlanId) -> TenancyResult<Vec<PlanEntitlement>> {
        sqlx::query("SELECT * FROM plan_entitlements WHERE plan_id = ? ORDER BY feature_key")
            .bind(plan_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(codec::entitlement)
            .collect()
    }
}

// ============ Tenants ============

#[async_trait]
impl TenantRepository for SqliteStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> TenancyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (tenant_id, name, status, plan_id, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant.tenant_id.to_string())
        .bind(&tenant.name)
        .bind(tenant.status.as_str())
        .bind(tenant.plan_id.map(|id| id.to_string()))
        .bind(to_i64("version", tenant.version)?)
        .bind(ts(tenant.created_at))
        .bind(ts(tenant.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or(e, || format!("tenant {} exists", tenant.tenant_id)))?;
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> TenancyResult<Option<Tenant>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_tenant(&mut conn, tenant_id).await
    }

    async fn list_tenants(&self) -> TenancyResult<Vec<Tenant>> {
        sqlx::query("SELECT * FROM tenants ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(codec::tenant)
            .collect()
    }

    async fn compare_and_save_tenant(
        &self,
        tenant: &Tenant,
        expected_version: u64,
    ) -> TenancyResult<bool> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let updated = sqlx::query(
            r#"
            UPDATE tenants SET name = ?, status = ?, plan_id = ?, version = ?, updated_at = ?
            WHERE tenant_id = ? AND version = ?
            "#,
        )
        .bind(&tenant.name)
        .bind(tenant.status.as_str())
        .bind(tenant.plan_id.map(|id| id.to_string()))
        .bind(to_i64("version", tenant.version)?)
        .bind(ts(tenant.updated_at))
        .bind(tenant.tenant_id.to_string())
        .bind(to_i64("version", expected_version)?)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        match fetch_tenant(&mut conn, tenant.tenant_id).await? {
            Some(_) => Ok(false),
            None => Err(TenancyError::UnknownTenant(tenant.tenant_id)),
        }
    }
}

// ============ Subscriptions ============

#[async_trait]
impl SubscriptionRepository for SqliteStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> TenancyResult<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        insert_subscription_row(&mut conn, subscription).await
    }

    async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> TenancyResult<Option<Subscription>> {
        sqlx::query("SELECT * FROM subscriptions WHERE subscription_id = ?")
            .bind(subscription_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| codec::subscription(&row))
            .transpose()
    }

    async fn live_subscription(&self, tenant_id: TenantId) -> TenancyResult<Option<Subscription>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_live(&mut conn, tenant_id).await
    }

    async fn list_subscriptions(&self, tenant_id: TenantId) -> TenancyResult<Vec<Subscription>> {
        sqlx::query(
            "SELECT * FROM subscriptions WHERE tenant_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(codec::subscription)
        .collect()
    }

    async fn list_live_subscriptions(&self, limit: usize) -> TenancyResult<Vec<Subscription>> {
        sqlx::query(&format!(
            "SELECT * FROM subscriptions WHERE status IN {LIVE_STATUSES} \
             ORDER BY current_period_end LIMIT ?"
        ))
        .bind(row_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(codec::subscription)
        .collect()
    }

    async fn compare_and_save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: u64,
    ) -> TenancyResult<bool> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        compare_and_update(&mut conn, subscription, expected_version).await
    }

    async fn replace_subscription(
        &self,
        old: &Subscription,
        expected_version: u64,
        new: &Subscription,
    ) -> TenancyResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        // old leaves the live set before new enters it
        if !compare_and_update(&mut tx, old, expected_version).await? {
            return Ok(false);
        }
        insert_subscription_row(&mut tx, new).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}

// ============ Usage ============

#[async_trait]
impl UsageRepository for SqliteStore {
    async fn load_usage_context(&self, key: &UsageKey) -> TenancyResult<UsageContext> {
        // one read transaction gives a consistent snapshot
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ctx = load_context(&mut tx, key, Utc::now()).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(ctx)
    }

    async fn mutate_usage(
        &self,
        key: &UsageKey,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
        decide: UsageDecider<'_>,
    ) -> TenancyResult<UsageWrite> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_tenant(&mut tx, key.tenant_id).await?;
        let ctx = load_context(&mut tx, key, now).await?;

        if let Some(idem) = idempotency_key {
            let original = sqlx::query(
                r#"
                SELECT * FROM usage_events
                WHERE tenant_id = ? AND feature_key = ? AND idempotency_key = ?
                "#,
            )
            .bind(key.tenant_id.to_string())
            .bind(key.feature_key.as_str())
            .bind(idem)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .map(|row| codec::usage_event(&row))
            .transpose()?;

            if let Some(event) = original {
                debug!(tenant_id = %key.tenant_id, feature = %key.feature_key, "Usage replayed");
                return Ok(UsageWrite {
                    row: ctx.row,
                    event: Some(event),
                    mutation: None,
                });
            }
        }

        // dropping the transaction rolls back the lock-taking update
        let Some(mutation) = decide(&ctx)? else {
            return Ok(UsageWrite {
                row: ctx.row,
                event: None,
                mutation: None,
            });
        };

        sqlx::query(
            r#"
            INSERT INTO tenant_features (tenant_id, feature_key, usage_count, period_start, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, feature_key) DO UPDATE SET
                usage_count = excluded.usage_count,
                period_start = excluded.period_start,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.tenant_id.to_string())
        .bind(key.feature_key.as_str())
        .bind(to_i64("usage count", mutation.usage_count)?)
        .bind(opt_ts(mutation.period_start))
        .bind(ts(now))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let event = UsageEvent {
            event_id: Uuid::new_v4(),
            tenant_id: key.tenant_id,
            feature_key: key.feature_key.clone(),
            kind: mutation.kind,
            amount: mutation.amount,
            usage_after: mutation.usage_count,
            idempotency_key: idempotency_key.map(str::to_string),
            occurred_at: now,
        };
        sqlx::query(
            r#"
            INSERT INTO usage_events (
                event_id, tenant_id, feature_key, kind, amount, usage_after,
                idempotency_key, occurred_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.tenant_id.to_string())
        .bind(event.feature_key.as_str())
        .bind(event.kind.as_str())
        .bind(to_i64("amount", event.amount)?)
        .bind(to_i64("usage count", event.usage_after)?)
        .bind(event.idempotency_key.as_deref())
        .bind(ts(event.occurred_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let mut row = ctx.row;
        row.usage_count = mutation.usage_count;
        row.period_start = mutation.period_start;
        row.updated_at = now;
        Ok(UsageWrite {
            row,
            event: Some(event),
            mutation: Some(mutation),
        })
    }

    async fn get_tenant_feature(&self, key: &UsageKey) -> TenancyResult<Option<TenantFeature>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_row(&mut conn, key).await
    }

    async fn list_tenant_features(&self, tenant_id: TenantId) -> TenancyResult<Vec<TenantFeature>> {
        sqlx::query("SELECT * FROM tenant_features WHERE tenant_id = ? ORDER BY feature_key")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(codec::tenant_feature)
            .collect()
    }

    async fn save_override(
        &self,
        key: &UsageKey,
        feature_override: &FeatureOverride,
        now: DateTime<Utc>,
    ) -> TenancyResult<TenantFeature> {
        let (override_unlimited, override_limit) = match &feature_override.limit {
            Some(limit) => {
                let (unlimited, value) = limit_columns(limit)?;
                (Some(unlimited), value)
            }
            None => (None, None),
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_tenant(&mut tx, key.tenant_id).await?;
        if fetch_feature(&mut tx, &key.feature_key).await?.is_none() {
            return Err(TenancyError::UnknownFeature(key.feature_key.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO tenant_features (
                tenant_id, feature_key, override_enabled, override_unlimited, override_limit,
                expires_at, usage_count, period_start, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?)
            ON CONFLICT (tenant_id, feature_key) DO UPDATE SET
                override_enabled = excluded.override_enabled,
                override_unlimited = excluded.override_unlimited,
                override_limit = excluded.override_limit,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.tenant_id.to_string())
        .bind(key.feature_key.as_str())
        .bind(feature_override.is_enabled)
        .bind(override_unlimited)
        .bind(override_limit)
        .bind(opt_ts(feature_override.expires_at))
        .bind(ts(now))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = fetch_row(&mut tx, key)
            .await?
            .ok_or_else(|| TenancyError::Persistence("override row vanished".into()))?;
        tx.commit().await.map_err(db_err)?;
        Ok(row)
    }

    async fn usage_events(&self, key: &UsageKey, limit: usize) -> TenancyResult<Vec<UsageEvent>> {
        sqlx::query(
            r#"
            SELECT * FROM usage_events
            WHERE tenant_id = ? AND feature_key = ?
            ORDER BY rowid DESC
            LIMIT ?
            "#,
        )
        .bind(key.tenant_id.to_string())
        .bind(key.feature_key.as_str())
        .bind(row_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(codec::usage_event)
        .collect()
    }
}
