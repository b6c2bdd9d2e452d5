//! Tenancy Entitlement Platform
//!
//! Tenants subscribe to plans, plans grant features as switches or numeric
//! limits, and usage of metered features is counted atomically and reset at
//! every billing period rollover.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    TENANCY ENTITLEMENT PLATFORM                         │
//! │                                                                         │
//! │   request(tenant_id, feature)                                           │
//! │        │                                                                │
//! │  ┌─────▼────────────┐   ┌──────────────────┐   ┌──────────────────┐    │
//! │  │   Entitlement    │   │  Usage Metering  │◄──│   Subscription   │    │
//! │  │    Resolver      │   │ check+increment  │   │    Lifecycle     │    │
//! │  │   (read-only)    │   │ under row lock   │   │ rollover/cancel  │    │
//! │  └─────┬────────────┘   └────────┬─────────┘   └────────┬─────────┘    │
//! │        │                         │                      │              │
//! │  ┌─────▼─────────────────────────▼──────────────────────▼───────────┐  │
//! │  │  Tenant Registry  │  Plan/Feature Catalog  │  Repository traits   │  │
//! │  └──────────────────────────────────┬───────────────────────────────┘  │
//! │                                     │                                   │
//! │                 InMemoryStore  │  SqliteStore (tenancy-sqlite)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metering;
pub mod model;
pub mod registry;
pub mod resolver;
mod retry;
pub mod store;

use chrono::Utc;
use std::sync::Arc;

pub use catalog::{CatalogSeed, PlanCatalog, PlanFeature, SeedReport};
pub use config::{ConfigError, LifecycleConfig, MeteringConfig, TenancyConfig};
pub use error::{TenancyError, TenancyResult};
pub use lifecycle::{
    CancelMode, PlanChange, RolloverOutcome, SubscribeRequest, SubscriptionLifecycle,
    SubscriptionUsage, SweepReport,
};
pub use metering::{RecordOptions, UsageMeter, UsageReceipt};
pub use model::*;
pub use registry::{TenantRegistry, TenantUpdate};
pub use resolver::{DecisionReason, EntitlementDecision, EntitlementResolver, GrantSource};
pub use store::{InMemoryStore, TenancyStore};

/// All tenancy services wired to one store
pub struct TenancyPlatform {
    /// Backing store
    pub store: Arc<dyn TenancyStore>,
    /// Plan/feature catalog
    pub catalog: Arc<PlanCatalog>,
    /// Tenant registry
    pub registry: Arc<TenantRegistry>,
    /// Entitlement resolver
    pub resolver: Arc<EntitlementResolver>,
    /// Usage metering
    pub metering: Arc<UsageMeter>,
    /// Subscription lifecycle
    pub lifecycle: Arc<SubscriptionLifecycle>,
    config: TenancyConfig,
}

impl TenancyPlatform {
    /// Create new platform
    pub fn new(store: Arc<dyn TenancyStore>, config: TenancyConfig) -> Self {
        let catalog = Arc::new(PlanCatalog::new(store.clone()));
        let registry = Arc::new(TenantRegistry::new(store.clone()));
        let metering = Arc::new(UsageMeter::new(store.clone(), config.metering.clone()));
        let lifecycle = Arc::new(SubscriptionLifecycle::new(
            store.clone(),
            catalog.clone(),
            registry.clone(),
            metering.clone(),
            config.lifecycle.clone(),
        ));

        Self {
            resolver: Arc::new(EntitlementResolver::new(store.clone())),
            store,
            catalog,
            registry,
            metering,
            lifecycle,
            config,
        }
    }

    /// In-memory platform (for testing and development)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()), TenancyConfig::default())
    }

    /// Configuration the services were built with
    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    /// Apply the configured catalog seed, or the standard one
    pub async fn bootstrap(&self) -> TenancyResult<SeedReport> {
        match &self.config.catalog {
            Some(seed) => self.catalog.apply_seed(seed).await,
            None => self.catalog.apply_seed(&CatalogSeed::standard()).await,
        }
    }

    /// Check entitlement
    pub async fn check_entitlement(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
    ) -> TenancyResult<EntitlementDecision> {
        self.resolver.check_entitlement(tenant_id, feature_key).await
    }

    /// Record usage after persisting any due rollover for the tenant
    pub async fn record_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        amount: u64,
        options: &RecordOptions,
    ) -> TenancyResult<UsageReceipt> {
        let now = Utc::now();
        self.lifecycle.ensure_current(tenant_id, now).await?;
        self.metering
            .record_usage_at(tenant_id, feature_key, amount, options, now)
            .await
    }
}
