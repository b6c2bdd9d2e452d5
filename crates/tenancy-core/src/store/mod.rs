//! Repositories - persistence abstraction for the tenancy tables
//!
//! Each table family gets an explicit repository trait; services never
//! traverse relations implicitly. The one contended write, the usage
//! counter, goes through [`UsageRepository::mutate_usage`], which loads the
//! whole decision context and applies the caller's decision inside a single
//! transaction that holds the row's write lock.

pub mod memory;

use crate::error::TenancyResult;
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::InMemoryStore;

/// Catalog tables: features, plans, plan entitlements
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Insert feature; `Conflict` if the key exists
    async fn insert_feature(&self, feature: &Feature) -> TenancyResult<()>;

    async fn get_feature(&self, key: &FeatureKey) -> TenancyResult<Option<Feature>>;

    /// All features ordered by key
    async fn list_features(&self) -> TenancyResult<Vec<Feature>>;

    /// Insert plan; `Conflict` if the slug exists
    async fn insert_plan(&self, plan: &Plan) -> TenancyResult<()>;

    /// Administrative edit of an existing plan
    async fn update_plan(&self, plan: &Plan) -> TenancyResult<()>;

    async fn get_plan(&self, plan_id: PlanId) -> TenancyResult<Option<Plan>>;

    async fn get_plan_by_slug(&self, slug: &str) -> TenancyResult<Option<Plan>>;

    /// All plans ordered by slug
    async fn list_plans(&self) -> TenancyResult<Vec<Plan>>;

    /// Insert or replace a plan → feature binding
    async fn upsert_entitlement(&self, entitlement: &PlanEntitlement) -> TenancyResult<()>;

    async fn get_entitlement(
        &self,
        plan_id: PlanId,
        key: &FeatureKey,
    ) -> TenancyResult<Option<PlanEntitlement>>;

    /// Bindings of one plan ordered by feature key
    async fn list_entitlements(&self, plan_id: PlanId) -> TenancyResult<Vec<PlanEntitlement>>;
}

/// Tenant table
#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn insert_tenant(&self, tenant: &Tenant) -> TenancyResult<()>;

    async fn get_tenant(&self, tenant_id: TenantId) -> TenancyResult<Option<Tenant>>;

    async fn list_tenants(&self) -> TenancyResult<Vec<Tenant>>;

    /// Save only if the stored version still equals `expected_version`
    ///
    /// Returns `false` when another writer got there first, `UnknownTenant`
    /// if the row is missing.
    async fn compare_and_save_tenant(
        &self,
        tenant: &Tenant,
        expected_version: u64,
    ) -> TenancyResult<bool>;
}

/// Subscription table
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Insert; `Conflict` if the tenant already has a live subscription
    async fn insert_subscription(&self, subscription: &Subscription) -> TenancyResult<()>;

    async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> TenancyResult<Option<Subscription>>;

    /// The tenant's trialing/active subscription
    async fn live_subscription(&self, tenant_id: TenantId) -> TenancyResult<Option<Subscription>>;

    /// Full history, newest first
    async fn list_subscriptions(&self, tenant_id: TenantId) -> TenancyResult<Vec<Subscription>>;

    /// All trialing/active subscriptions, for the rollover sweep
    async fn list_live_subscriptions(&self, limit: usize) -> TenancyResult<Vec<Subscription>>;

    /// Save only if the stored version still equals `expected_version`
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: u64,
    ) -> TenancyResult<bool>;

    /// Atomically save `old` (now superseded) under CAS and insert `new`
    async fn replace_subscription(
        &self,
        old: &Subscription,
        expected_version: u64,
        new: &Subscription,
    ) -> TenancyResult<bool>;
}

/// Primary key of a usage row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub tenant_id: TenantId,
    pub feature_key: FeatureKey,
}

impl UsageKey {
    pub fn new(tenant_id: TenantId, feature_key: FeatureKey) -> Self {
        Self { tenant_id, feature_key }
    }
}

/// Everything an entitlement decision reads, loaded in one pass
#[derive(Debug, Clone)]
pub struct UsageContext {
    pub tenant: Tenant,
    pub feature: Feature,
    /// Live subscription, if any
    pub subscription: Option<Subscription>,
    /// Binding for the live subscription's plan
    pub plan_entitlement: Option<PlanEntitlement>,
    /// Existing row, or a fresh one when the tenant never touched the feature
    pub row: TenantFeature,
}

/// New counter state decided under the row lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageMutation {
    pub usage_count: u64,
    pub period_start: Option<DateTime<Utc>>,
    pub kind: UsageEventKind,
    pub amount: u64,
    /// Quota left after the write
    pub remaining: Remaining,
}

/// Decision callback run against the locked context
///
/// `Ok(None)` means there is nothing to write.
pub type UsageDecider<'a> =
    &'a (dyn Fn(&UsageContext) -> TenancyResult<Option<UsageMutation>> + Send + Sync);

/// Result of [`UsageRepository::mutate_usage`]
#[derive(Debug, Clone)]
pub struct UsageWrite {
    /// Row after the write
    pub row: TenantFeature,
    /// Recorded event, the original one on replay, `None` if nothing was written
    pub event: Option<UsageEvent>,
    /// `None` on replay or when the decider chose not to write
    pub mutation: Option<UsageMutation>,
}

impl UsageWrite {
    /// Whether an idempotency key matched an earlier write
    pub fn replayed(&self) -> bool {
        self.mutation.is_none() && self.event.is_some()
    }
}

/// Tenant feature rows and usage events
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Read-only context load; `UnknownTenant` / `UnknownFeature` on misses
    async fn load_usage_context(&self, key: &UsageKey) -> TenancyResult<UsageContext>;

    /// Check-and-write a usage counter atomically
    ///
    /// Implementations must lock the row before loading the context, run
    /// `decide` on it, and persist the mutation plus its event in the same
    /// transaction. An error or `None` from `decide` leaves nothing written. A repeated
    /// `idempotency_key` for the same row returns the original event without
    /// calling `decide`.
    async fn mutate_usage(
        &self,
        key: &UsageKey,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
        decide: UsageDecider<'_>,
    ) -> TenancyResult<UsageWrite>;

    async fn get_tenant_feature(&self, key: &UsageKey) -> TenancyResult<Option<TenantFeature>>;

    async fn list_tenant_features(&self, tenant_id: TenantId) -> TenancyResult<Vec<TenantFeature>>;

    /// Upsert override fields, keeping the counter
    async fn save_override(
        &self,
        key: &UsageKey,
        feature_override: &FeatureOverride,
        now: DateTime<Utc>,
    ) -> TenancyResult<TenantFeature>;

    /// Newest first
    async fn usage_events(&self, key: &UsageKey, limit: usize) -> TenancyResult<Vec<UsageEvent>>;
}

/// Full store used by the services
pub trait TenancyStore:
    CatalogRepository + TenantRepository + SubscriptionRepository + UsageRepository
{
}

impl<T> TenancyStore for T where
    T: CatalogRepository + TenantRepository + SubscriptionRepository + UsageRepository
{
}
