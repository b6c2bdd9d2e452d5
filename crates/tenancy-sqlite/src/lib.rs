//! SQLite store for the tenancy platform
//!
//! Implements every repository trait of `tenancy-core` on a WAL-mode SQLite
//! database. Usage writes run in one transaction whose first statement takes
//! the database write lock, so the entitlement decision and the counter
//! update observe and produce a single serialized state.

#![warn(missing_docs)]

mod codec;
mod repository;
mod schema;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tenancy_core::TenancyError;
use tracing::info;

/// Writers wait this long for the database lock before reporting contention
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed tenancy store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url` (`sqlite://path` or `sqlite::memory:`) and migrate
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, TenancyError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        // every in-memory connection is its own database
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        }
        .connect_with(options)
        .await
        .map_err(db_err)?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url = %url, "SQLite store ready");
        Ok(store)
    }

    /// Open or create a database file
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self, TenancyError> {
        Self::connect(&format!("sqlite://{}", path.display()), max_connections).await
    }

    /// Create missing tables and indexes
    pub async fn migrate(&self) -> Result<(), TenancyError> {
        for statement in schema::MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map a driver error onto the tenancy taxonomy
///
/// Lock contention (`SQLITE_BUSY`, `SQLITE_LOCKED` and their extended codes)
/// and pool exhaustion are retryable conflicts.
pub(crate) fn db_err(err: sqlx::Error) -> TenancyError {
    match &err {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return TenancyError::Conflict(db.message().to_string());
            }
            if db.is_foreign_key_violation() {
                return TenancyError::Validation(format!(
                    "referenced row missing: {}",
                    db.message()
                ));
            }
            let busy = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6));
            if busy {
                TenancyError::ConcurrencyConflict(db.message().to_string())
            } else {
                TenancyError::Persistence(err.to_string())
            }
        }
        sqlx::Error::PoolTimedOut => {
            TenancyError::ConcurrencyConflict("connection pool exhausted".into())
        }
        _ => TenancyError::Persistence(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as Days, Utc};
    use std::sync::Arc;
    use tenancy_core::catalog::keys;
    use tenancy_core::store::{SubscriptionRepository, TenantRepository, UsageKey, UsageRepository};
    use tenancy_core::*;
    use tempfile::TempDir;

    async fn platform() -> (TempDir, SqliteStore, Arc<TenancyPlatform>) {
        platform_with(TenancyConfig::default()).await
    }

    async fn platform_with(config: TenancyConfig) -> (TempDir, SqliteStore, Arc<TenancyPlatform>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("tenancy.db"), 5).await.unwrap();
        let platform = TenancyPlatform::new(Arc::new(store.clone()), config);
        platform.bootstrap().await.unwrap();
        (dir, store, Arc::new(platform))
    }

    async fn subscribed(platform: &TenancyPlatform, slug: &str) -> Tenant {
        let tenant = platform.registry.create("Acme").await.unwrap();
        let plan = platform.catalog.get_plan_by_slug(slug).await.unwrap();
        platform
            .lifecycle
            .subscribe(
                tenant.tenant_id,
                SubscribeRequest { plan_id: plan.plan_id, billing_cycle: None, with_trial: false },
            )
            .await
            .unwrap();
        tenant
    }

    #[tokio::test]
    async fn test_catalog_roundtrip() {
        let (_dir, _store, platform) = platform().await;

        let plans = platform.catalog.list_plans().await.unwrap();
        let slugs: Vec<_> = plans.iter().map(|p| p.slug.as_str()).collect();
        assert_eq!(slugs, vec!["enterprise", "free", "pro"]);

        let pro = platform.catalog.get_plan_by_slug("pro").await.unwrap();
        assert_eq!(pro.price, rust_decimal_macros::dec!(29));
        let workflows = FeatureKey::new(keys::WORKFLOWS).unwrap();
        let binding = platform
            .catalog
            .get_entitlement(pro.plan_id, &workflows)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binding.limit, Limit::Capped(5));

        // seeding twice changes nothing
        platform.bootstrap().await.unwrap();
        assert_eq!(platform.catalog.list_plans().await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_usage_respects_limit() {
        let (_dir, store, platform) = platform().await;
        let tenant = subscribed(&platform, "pro").await;
        let agents = FeatureKey::new(keys::AGENTS).unwrap();
        platform
            .registry
            .set_feature_override(
                tenant.tenant_id,
                &agents,
                FeatureOverride { is_enabled: None, limit: Some(Limit::Capped(7)), expires_at: None },
            )
            .await
            .unwrap();

        let tenant_id = tenant.tenant_id;
        let mut handles = Vec::new();
        for _ in 0..20 {
            let platform = platform.clone();
            let agents = agents.clone();
            handles.push(tokio::spawn(async move {
                platform.metering.record_usage(tenant_id, &agents, 1).await
            }));
        }

        let mut granted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(TenancyError::QuotaExceeded { limit: 7, .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(granted, 7);
        assert_eq!(rejected, 13);

        let row = store
            .get_tenant_feature(&UsageKey::new(tenant.tenant_id, agents.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.usage_count, 7);
        assert_eq!(row.limit, Some(Limit::Capped(7)));
        let events = store
            .usage_events(&UsageKey::new(tenant.tenant_id, agents), 100)
            .await
            .unwrap();
        assert_eq!(events.len(), 7);
    }

    #[tokio::test]
    async fn test_idempotent_replay() {
        let (_dir, store, platform) = platform().await;
        let tenant = subscribed(&platform, "pro").await;
        let executions = FeatureKey::new(keys::EXECUTIONS_PER_MONTH).unwrap();
        let options = RecordOptions { allow_overage: false, idempotency_key: Some("run-1".into()) };

        let first = platform
            .metering
            .record_usage_with(tenant.tenant_id, &executions, 3, &options)
            .await
            .unwrap();
        let again = platform
            .metering
            .record_usage_with(tenant.tenant_id, &executions, 3, &options)
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(again.replayed);
        assert_eq!(again.usage_count, 3);
        let events = store
            .usage_events(&UsageKey::new(tenant.tenant_id, executions), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].idempotency_key.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_no_subscription_writes_nothing() {
        let (_dir, store, platform) = platform().await;
        let tenant = platform.registry.create("Acme").await.unwrap();
        let workflows = FeatureKey::new(keys::WORKFLOWS).unwrap();

        let err = platform
            .record_usage(tenant.tenant_id, &workflows, 1, &RecordOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, TenancyError::NoActiveSubscription(tenant.tenant_id));

        let usage_key = UsageKey::new(tenant.tenant_id, workflows);
        assert!(store.get_tenant_feature(&usage_key).await.unwrap().is_none());
        assert!(store.usage_events(&usage_key, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollover_is_idempotent() {
        let (_dir, store, platform) = platform().await;
        let tenant = subscribed(&platform, "pro").await;
        let executions = FeatureKey::new(keys::EXECUTIONS_PER_MONTH).unwrap();

        // move the live period 40 days into the past
        let live = store.live_subscription(tenant.tenant_id).await.unwrap().unwrap();
        let anchor = Utc::now() - Days::days(40);
        let period = live.billing_cycle.period_from(anchor);
        let mut old = live.clone();
        old.billing_anchor = anchor;
        old.created_at = anchor;
        old.current_period_start = period.start;
        old.current_period_end = period.end;
        old.touch(Utc::now());
        assert!(store.compare_and_save_subscription(&old, live.version).await.unwrap());

        platform
            .metering
            .record_usage_at(
                tenant.tenant_id,
                &executions,
                7,
                &RecordOptions::default(),
                period.start + Days::days(1),
            )
            .await
            .unwrap();

        let now = Utc::now();
        let first = platform.lifecycle.rollover(old.subscription_id, now).await.unwrap();
        assert!(matches!(first, RolloverOutcome::Rolled { counters_reset: 1, .. }));
        let second = platform.lifecycle.rollover(old.subscription_id, now).await.unwrap();
        assert_eq!(second, RolloverOutcome::NotDue);

        let rolled = store.get_subscription(old.subscription_id).await.unwrap().unwrap();
        assert!(rolled.current_period().contains(now));
        let usage_key = UsageKey::new(tenant.tenant_id, executions);
        let row = store.get_tenant_feature(&usage_key).await.unwrap().unwrap();
        assert_eq!(row.usage_count, 0);
        let kinds: Vec<_> = store
            .usage_events(&usage_key, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![UsageEventKind::Reset, UsageEventKind::Consumed]);
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let mut config = TenancyConfig::default();
        config.metering.operation_timeout_ms = 100;
        let (_dir, store, platform) = platform_with(config).await;
        let tenant = subscribed(&platform, "pro").await;
        let workflows = FeatureKey::new(keys::WORKFLOWS).unwrap();
        platform.metering.record_usage(tenant.tenant_id, &workflows, 2).await.unwrap();

        // another writer holds the database lock past the deadline
        let mut holder = store.pool().acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();

        let err = platform
            .metering
            .record_usage(tenant.tenant_id, &workflows, 1)
            .await
            .unwrap_err();
        assert_eq!(err, TenancyError::Timeout(100));

        sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
        drop(holder);

        let usage_key = UsageKey::new(tenant.tenant_id, workflows.clone());
        let row = store.get_tenant_feature(&usage_key).await.unwrap().unwrap();
        assert_eq!(row.usage_count, 2);
        assert_eq!(store.usage_events(&usage_key, 10).await.unwrap().len(), 1);

        // the abandoned transaction rolls back on its connection worker
        tokio::time::sleep(Duration::from_millis(300)).await;
        let receipt = platform.metering.record_usage(tenant.tenant_id, &workflows, 1).await.unwrap();
        assert_eq!(receipt.usage_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_suspension_survives_concurrent_subscribe() {
        let (_dir, store, platform) = platform().await;
        let plan_id = platform.catalog.get_plan_by_slug("pro").await.unwrap().plan_id;

        for _ in 0..20 {
            let tenant = platform.registry.create("Racer").await.unwrap();
            let tenant_id = tenant.tenant_id;

            let suspend = {
                let platform = platform.clone();
                tokio::spawn(async move { platform.registry.suspend(tenant_id).await })
            };
            let subscribe = {
                let platform = platform.clone();
                tokio::spawn(async move {
                    platform
                        .lifecycle
                        .subscribe(
                            tenant_id,
                            SubscribeRequest { plan_id, billing_cycle: None, with_trial: false },
                        )
                        .await
                })
            };
            suspend.await.unwrap().unwrap();
            subscribe.await.unwrap().unwrap();

            let stored = store.get_tenant(tenant_id).await.unwrap().unwrap();
            assert_eq!(stored.status, TenantStatus::Suspended);
            assert_eq!(stored.plan_id, Some(plan_id));
        }
    }

    #[tokio::test]
    async fn test_stale_tenant_save_rejected() {
        let (_dir, store, platform) = platform().await;
        let tenant = platform.registry.create("Acme").await.unwrap();

        let mut stale = tenant.clone();
        stale.status = TenantStatus::Active;
        stale.touch(Utc::now());
        platform.registry.suspend(tenant.tenant_id).await.unwrap();

        assert!(!store.compare_and_save_tenant(&stale, tenant.version).await.unwrap());
        let stored = store.get_tenant(tenant.tenant_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TenantStatus::Suspended);
        assert_eq!(stored.version, tenant.version + 1);

        let ghost = Tenant::new("Ghost", Utc::now()).unwrap();
        let err = store.compare_and_save_tenant(&ghost, 0).await.unwrap_err();
        assert_eq!(err, TenancyError::UnknownTenant(ghost.tenant_id));
    }

    #[tokio::test]
    async fn test_single_live_subscription() {
        let (_dir, store, platform) = platform().await;
        let tenant = subscribed(&platform, "free").await;
        let pro = platform.catalog.get_plan_by_slug("pro").await.unwrap();

        let second = Subscription::active(tenant.tenant_id, pro.plan_id, BillingCycle::Monthly, Utc::now());
        let err = store.insert_subscription(&second).await.unwrap_err();
        assert!(matches!(err, TenancyError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_compare_and_save_rejects_stale_version() {
        let (_dir, store, platform) = platform().await;
        let tenant = subscribed(&platform, "pro").await;
        let live = store.live_subscription(tenant.tenant_id).await.unwrap().unwrap();

        let mut next = live.clone();
        next.cancel_at_period_end = true;
        next.touch(Utc::now());
        assert!(store.compare_and_save_subscription(&next, live.version).await.unwrap());
        assert!(!store.compare_and_save_subscription(&next, live.version).await.unwrap());

        let stored = store.get_subscription(live.subscription_id).await.unwrap().unwrap();
        assert_eq!(stored, next);
    }

    #[tokio::test]
    async fn test_plan_change_replaces_atomically() {
        let (_dir, store, platform) = platform().await;
        let tenant = subscribed(&platform, "free").await;
        let pro = platform.catalog.get_plan_by_slug("pro").await.unwrap();

        let change = platform.lifecycle.change_plan(tenant.tenant_id, pro.plan_id).await.unwrap();
        assert_eq!(change.previous.status, SubscriptionStatus::Superseded);

        let history = store.list_subscriptions(tenant.tenant_id).await.unwrap();
        assert_eq!(history.len(), 2);
        let live = store.live_subscription(tenant.tenant_id).await.unwrap().unwrap();
        assert_eq!(live.plan_id, pro.plan_id);
    }

    #[tokio::test]
    async fn test_reopen_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenancy.db");
        let tenant = Tenant::new("Durable", Utc::now()).unwrap();
        {
            let store = SqliteStore::open(&path, 2).await.unwrap();
            store.insert_tenant(&tenant).await.unwrap();
            store.close().await;
        }

        let store = SqliteStore::open(&path, 2).await.unwrap();
        let loaded = store.get_tenant(tenant.tenant_id).await.unwrap().unwrap();
        assert_eq!(loaded, tenant);
    }

    #[tokio::test]
    async fn test_unknown_tenant_usage() {
        let (_dir, _store, platform) = platform().await;
        let workflows = FeatureKey::new(keys::WORKFLOWS).unwrap();
        let id = uuid::Uuid::new_v4();

        let err = platform.metering.record_usage(id, &workflows, 1).await.unwrap_err();
        assert_eq!(err, TenancyError::UnknownTenant(id));
    }

    #[tokio::test]
    async fn test_in_memory_url() {
        let store = SqliteStore::connect("sqlite::memory:", 4).await.unwrap();
        let tenant = Tenant::new("Ephemeral", Utc::now()).unwrap();
        store.insert_tenant(&tenant).await.unwrap();
        assert_eq!(store.list_tenants().await.unwrap().len(), 1);
    }
}
