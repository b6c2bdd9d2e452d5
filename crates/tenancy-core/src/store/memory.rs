//! In-memory store (for testing and development)
//!
//! Lock order is always usage row → tables → events. Usage rows live in a
//! sharded map whose entry guard is the per-row write lock.

use super::*;
use crate::error::TenancyError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    features: BTreeMap<FeatureKey, Feature>,
    plans: HashMap<PlanId, Plan>,
    entitlements: BTreeMap<(PlanId, FeatureKey), PlanEntitlement>,
    tenants: HashMap<TenantId, Tenant>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl Tables {
    fn live_subscription(&self, tenant_id: TenantId) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.tenant_id == tenant_id && s.status.is_live())
    }

    fn context(&self, key: &UsageKey, row: TenantFeature) -> TenancyResult<UsageContext> {
        let tenant = self
            .tenants
            .get(&key.tenant_id)
            .cloned()
            .ok_or(TenancyError::UnknownTenant(key.tenant_id))?;
        let feature = self
            .features
            .get(&key.feature_key)
            .cloned()
            .ok_or_else(|| TenancyError::UnknownFeature(key.feature_key.clone()))?;
        let subscription = self.live_subscription(key.tenant_id).cloned();
        let plan_entitlement = subscription.as_ref().and_then(|s| {
            self.entitlements
                .get(&(s.plan_id, key.feature_key.clone()))
                .cloned()
        });

        Ok(UsageContext {
            tenant,
            feature,
            subscription,
            plan_entitlement,
            row,
        })
    }

    fn ensure_row_target(&self, key: &UsageKey) -> TenancyResult<()> {
        if !self.tenants.contains_key(&key.tenant_id) {
            return Err(TenancyError::UnknownTenant(key.tenant_id));
        }
        if !self.features.contains_key(&key.feature_key) {
            return Err(TenancyError::UnknownFeature(key.feature_key.clone()));
        }
        Ok(())
    }
}

/// In-memory tenancy store
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    usage: DashMap<UsageKey, TenantFeature>,
    events: Mutex<Vec<UsageEvent>>,
    processed: DashMap<(UsageKey, String), UsageEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            usage: DashMap::new(),
            events: Mutex::new(Vec::new()),
            processed: DashMap::new(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogRepository for InMemoryStore {
    async fn insert_feature(&self, feature: &Feature) -> TenancyResult<()> {
        let mut tables = self.tables.write();
        if tables.features.contains_key(&feature.key) {
            return Err(TenancyError::Conflict(format!("feature {} exists", feature.key)));
        }
        tables.features.insert(feature.key.clone(), feature.clone());
        Ok(())
    }

    async fn get_feature(&self, key: &FeatureKey) -> TenancyResult<Option<Feature>> {
        Ok(self.tables.read().features.get(key).cloned())
    }

    async fn list_features(&self) -> TenancyResult<Vec<Feature>> {
        Ok(self.tables.read().features.values().cloned().collect())
    }

    async fn insert_plan(&self, plan: &Plan) -> TenancyResult<()> {
        let mut tables = self.tables.write();
        if tables.plans.values().any(|p| p.slug == plan.slug) {
            return Err(TenancyError::Conflict(format!("plan {} exists", plan.slug)));
        }
        tables.plans.insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> TenancyResult<()> {
        let mut tables = self.tables.write();
        if tables
            .plans
            .values()
            .any(|p| p.slug == plan.slug && p.plan_id != plan.plan_id)
        {
            return Err(TenancyError::Conflict(format!("plan {} exists", plan.slug)));
        }
        let slot = tables
            .plans
            .get_mut(&plan.plan_id)
            .ok_or_else(|| TenancyError::unknown_plan_id(plan.plan_id))?;
        *slot = plan.clone();
        Ok(())
    }

    async fn get_plan(&self, plan_id: PlanId) -> TenancyResult<Option<Plan>> {
        Ok(self.tables.read().plans.get(&plan_id).cloned())
    }

    async fn get_plan_by_slug(&self, slug: &str) -> TenancyResult<Option<Plan>> {
        Ok(self
            .tables
            .read()
            .plans
            .values()
            .find(|p| p.slug == slug)
            .cloned())
    }

    async fn list_plans(&self) -> TenancyResult<Vec<Plan>> {
        let mut plans: Vec<_> = self.tables.read().plans.values().cloned().collect();
        plans.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(plans)
    }

    async fn upsert_entitlement(&self, entitlement: &PlanEntitlement) -> TenancyResult<()> {
        self.tables.write().entitlements.insert(
            (entitlement.plan_id, entitlement.feature_key.clone()),
            entitlement.clone(),
        );
        Ok(())
    }

    async fn get_entitlement(
        &self,
        plan_id: PlanId,
        key: &FeatureKey,
    ) -> TenancyResult<Option<PlanEntitlement>> {
        Ok(self
            .tables
            .read()
            .entitlements
            .get(&(plan_id, key.clone()))
            .cloned())
    }

    async fn list_entitlements(&self, plan_id: PlanId) -> TenancyResult<Vec<PlanEntitlement>> {
        Ok(self
            .tables
            .read()
            .entitlements
            .values()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TenantRepository for InMemoryStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> TenancyResult<()> {
        let mut tables = self.tables.write();
        if tables.tenants.contains_key(&tenant.tenant_id) {
            return Err(TenancyError::Conflict(format!("tenant {} exists", tenant.tenant_id)));
        }
        tables.tenants.insert(tenant.tenant_id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> TenancyResult<Option<Tenant>> {
        Ok(self.tables.read().tenants.get(&tenant_id).cloned())
    }

    async fn list_tenants(&self) -> TenancyResult<Vec<Tenant>> {
        let mut tenants: Vec<_> = self.tables.read().tenants.values().cloned().collect();
        tenants.sort_by_key(|t| t.created_at);
        Ok(tenants)
    }

    async fn compare_and_save_tenant(
        &self,
        tenant: &Tenant,
        expected_version: u64,
    ) -> TenancyResult<bool> {
        let mut tables = self.tables.write();
        let slot = tables
            .tenants
            .get_mut(&tenant.tenant_id)
            .ok_or(TenancyError::UnknownTenant(tenant.tenant_id))?;
        if slot.version != expected_version {
            return Ok(false);
        }
        *slot = tenant.clone();
        Ok(true)
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> TenancyResult<()> {
        let mut tables = self.tables.write();
        if subscription.status.is_live() && tables.live_subscription(subscription.tenant_id).is_some() {
            return Err(TenancyError::Conflict(format!(
                "tenant {} already has a live subscription",
                subscription.tenant_id
            )));
        }
        tables
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> TenancyResult<Option<Subscription>> {
        Ok(self.tables.read().subscriptions.get(&subscription_id).cloned())
    }

    async fn live_subscription(&self, tenant_id: TenantId) -> TenancyResult<Option<Subscription>> {
        Ok(self.tables.read().live_subscription(tenant_id).cloned())
    }

    async fn list_subscriptions(&self, tenant_id: TenantId) -> TenancyResult<Vec<Subscription>> {
        let mut subs: Vec<_> = self
            .tables
            .read()
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn list_live_subscriptions(&self, limit: usize) -> TenancyResult<Vec<Subscription>> {
        let mut subs: Vec<_> = self
            .tables
            .read()
            .subscriptions
            .values()
            .filter(|s| s.status.is_live())
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.current_period_end);
        subs.truncate(limit);
        Ok(subs)
    }

    async fn compare_and_save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: u64,
    ) -> TenancyResult<bool> {
        let mut tables = self.tables.write();
        match tables.subscriptions.get(&subscription.subscription_id) {
            None => Err(TenancyError::UnknownSubscription(subscription.subscription_id)),
            Some(stored) if stored.version != expected_version => Ok(false),
            Some(_) => {
                tables
                    .subscriptions
                    .insert(subscription.subscription_id, subscription.clone());
                Ok(true)
            }
        }
    }

    async fn replace_subscription(
        &self,
        old: &Subscription,
        expected_version: u64,
        new: &Subscription,
    ) -> TenancyResult<bool> {
        let mut tables = self.tables.write();
        match tables.subscriptions.get(&old.subscription_id) {
            None => return Err(TenancyError::UnknownSubscription(old.subscription_id)),
            Some(stored) if stored.version != expected_version => return Ok(false),
            Some(_) => {}
        }
        tables.subscriptions.insert(old.subscription_id, old.clone());
        tables.subscriptions.insert(new.subscription_id, new.clone());
        Ok(true)
    }
}

#[async_trait]
impl UsageRepository for InMemoryStore {
    async fn load_usage_context(&self, key: &UsageKey) -> TenancyResult<UsageContext> {
        let row = self.usage.get(key).map(|r| r.value().clone());
        let tables = self.tables.read();
        let row = row.unwrap_or_else(|| {
            TenantFeature::fresh(key.tenant_id, key.feature_key.clone(), Utc::now())
        });
        tables.context(key, row)
    }

    async fn mutate_usage(
        &self,
        key: &UsageKey,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
        decide: UsageDecider<'_>,
    ) -> TenancyResult<UsageWrite> {
        self.tables.read().ensure_row_target(key)?;

        // the entry guard holds the row's shard lock; vacant rows are only
        // inserted once a mutation is decided
        let entry = self.usage.entry(key.clone());
        let current = match &entry {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(_) => TenantFeature::fresh(key.tenant_id, key.feature_key.clone(), now),
        };

        if let Some(idem) = idempotency_key {
            if let Some(original) = self.processed.get(&(key.clone(), idem.to_string())) {
                return Ok(UsageWrite {
                    row: current,
                    event: Some(original.value().clone()),
                    mutation: None,
                });
            }
        }

        let ctx = self.tables.read().context(key, current)?;
        let Some(mutation) = decide(&ctx)? else {
            return Ok(UsageWrite {
                row: ctx.row,
                event: None,
                mutation: None,
            });
        };

        let mut row = ctx.row;
        row.usage_count = mutation.usage_count;
        row.period_start = mutation.period_start;
        row.updated_at = now;
        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.insert(row.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(row.clone());
            }
        }

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
        if let Some(idem) = idempotency_key {
            self.processed
                .insert((key.clone(), idem.to_string()), event.clone());
        }
        self.events.lock().push(event.clone());

        Ok(UsageWrite {
            row,
            event: Some(event),
            mutation: Some(mutation),
        })
    }

    async fn get_tenant_feature(&self, key: &UsageKey) -> TenancyResult<Option<TenantFeature>> {
        Ok(self.usage.get(key).map(|r| r.value().clone()))
    }

    async fn list_tenant_features(&self, tenant_id: TenantId) -> TenancyResult<Vec<TenantFeature>> {
        let mut rows: Vec<_> = self
            .usage
            .iter()
            .filter(|r| r.key().tenant_id == tenant_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.feature_key.cmp(&b.feature_key));
        Ok(rows)
    }

    async fn save_override(
        &self,
        key: &UsageKey,
        feature_override: &FeatureOverride,
        now: DateTime<Utc>,
    ) -> TenancyResult<TenantFeature> {
        self.tables.read().ensure_row_target(key)?;

        let mut entry = self
            .usage
            .entry(key.clone())
            .or_insert_with(|| TenantFeature::fresh(key.tenant_id, key.feature_key.clone(), now));
        entry.value_mut().set_override(feature_override, now);
        Ok(entry.value().clone())
    }

    async fn usage_events(&self, key: &UsageKey, limit: usize) -> TenancyResult<Vec<UsageEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .rev()
            .filter(|e| e.tenant_id == key.tenant_id && e.feature_key == key.feature_key)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn seeded() -> (InMemoryStore, Tenant, Plan, FeatureKey) {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let key = FeatureKey::new("workflows").unwrap();
        let tenant = Tenant::new("Acme", now).unwrap();
        let plan = Plan::new("pro", "Pro", dec!(29), BillingCycle::Monthly, now).unwrap();

        {
            let tables = &mut *store.tables.write();
            tables
                .features
                .insert(key.clone(), Feature::metered(key.clone(), "Workflows", UsageReset::Never));
            tables.tenants.insert(tenant.tenant_id, tenant.clone());
            tables.plans.insert(plan.plan_id, plan.clone());
        }
        (store, tenant, plan, key)
    }

    #[tokio::test]
    async fn test_duplicate_slug_conflicts() {
        let (store, _, plan, _) = seeded();
        let mut dup = plan.clone();
        dup.plan_id = Uuid::new_v4();

        let err = store.insert_plan(&dup).await.unwrap_err();
        assert!(matches!(err, TenancyError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_single_live_subscription() {
        let (store, tenant, plan, _) = seeded();
        let now = Utc::now();
        let first = Subscription::active(tenant.tenant_id, plan.plan_id, BillingCycle::Monthly, now);
        store.insert_subscription(&first).await.unwrap();

        let second = Subscription::active(tenant.tenant_id, plan.plan_id, BillingCycle::Monthly, now);
        let err = store.insert_subscription(&second).await.unwrap_err();
        assert!(matches!(err, TenancyError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_compare_and_save_rejects_stale_version() {
        let (store, tenant, plan, _) = seeded();
        let sub = Subscription::active(tenant.tenant_id, plan.plan_id, BillingCycle::Monthly, Utc::now());
        store.insert_subscription(&sub).await.unwrap();

        let mut next = sub.clone();
        next.touch(Utc::now());
        assert!(store.compare_and_save_subscription(&next, 0).await.unwrap());
        assert!(!store.compare_and_save_subscription(&next, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_decision_writes_nothing() {
        let (store, tenant, _, key) = seeded();
        let usage_key = UsageKey::new(tenant.tenant_id, key);

        let result = store
            .mutate_usage(&usage_key, None, Utc::now(), &|_ctx: &UsageContext| {
                Err(TenancyError::Validation("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.usage_events(&usage_key, 10).await.unwrap().is_empty());
        assert!(store.get_tenant_feature(&usage_key).await.unwrap().is_none());
        assert!(store.list_tenant_features(tenant.tenant_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutate_unknown_tenant() {
        let (store, _, _, key) = seeded();
        let usage_key = UsageKey::new(Uuid::new_v4(), key);

        let err = store
            .mutate_usage(&usage_key, None, Utc::now(), &|_ctx: &UsageContext| {
                unreachable!("decider must not run for unknown tenants")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::UnknownTenant(_)));
        assert!(store.get_tenant_feature(&usage_key).await.unwrap().is_none());
    }
}
