//! Plan/Feature Catalog
//!
//! Features, plans and the limits each plan grants. Bootstrapped from a
//! [`CatalogSeed`] (configuration or the built-in standard catalog).

use crate::error::{TenancyError, TenancyResult};
use crate::model::*;
use crate::store::TenancyStore;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Feature keys of the standard catalog
pub mod keys {
    /// Workspaces owned by the tenant (gauge)
    pub const MAX_WORKSPACES: &str = "max_workspaces";
    /// Storage in MB (gauge)
    pub const STORAGE_MB: &str = "storage_mb";
    /// Workflow executions, reset every billing period
    pub const EXECUTIONS_PER_MONTH: &str = "executions_per_month";
    pub const WORKFLOWS: &str = "workflows";
    pub const AGENTS: &str = "agents";
    pub const LLM_TOKENS_PER_MONTH: &str = "llm_tokens_per_month";
    pub const API_ACCESS: &str = "api_access";
    pub const MARKETPLACE_PUBLISH: &str = "marketplace_publish";
    pub const SSO: &str = "sso";
}

/// Feature definition in a seed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureSeed {
    pub key: FeatureKey,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: FeatureKind,
    #[serde(default)]
    pub reset: UsageReset,
}

/// Plan binding in a seed; a missing `limit` means unlimited
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitlementSeed {
    pub feature: FeatureKey,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Option<u64>,
}

fn enabled_by_default() -> bool {
    true
}

fn usd() -> String {
    "USD".into()
}

/// Plan definition in a seed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSeed {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default = "usd")]
    pub currency: String,
    #[serde(default)]
    pub billing_cycle: BillingCycle,
    #[serde(default)]
    pub trial_days: u32,
    #[serde(default)]
    pub entitlements: Vec<EntitlementSeed>,
}

/// Catalog bootstrap data
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogSeed {
    #[serde(default)]
    pub features: Vec<FeatureSeed>,
    #[serde(default)]
    pub plans: Vec<PlanSeed>,
}

impl CatalogSeed {
    /// Built-in `free` / `pro` / `enterprise` catalog
    pub fn standard() -> Self {
        use keys::*;

        let features = vec![
            metered(MAX_WORKSPACES, "Workspaces", UsageReset::Never),
            metered(STORAGE_MB, "Storage (MB)", UsageReset::Never),
            metered(EXECUTIONS_PER_MONTH, "Executions per month", UsageReset::BillingPeriod),
            metered(WORKFLOWS, "Workflows", UsageReset::Never),
            metered(AGENTS, "Agents", UsageReset::Never),
            metered(LLM_TOKENS_PER_MONTH, "LLM tokens per month", UsageReset::BillingPeriod),
            toggle(API_ACCESS, "API access"),
            toggle(MARKETPLACE_PUBLISH, "Marketplace publishing"),
            toggle(SSO, "Single sign-on"),
        ];

        let free = PlanSeed {
            slug: "free".into(),
            name: "Free".into(),
            description: "Try the platform".into(),
            price: Decimal::ZERO,
            currency: usd(),
            billing_cycle: BillingCycle::Monthly,
            trial_days: 0,
            entitlements: vec![
                capped(MAX_WORKSPACES, 1),
                capped(STORAGE_MB, 100),
                capped(EXECUTIONS_PER_MONTH, 100),
                capped(WORKFLOWS, 2),
                capped(AGENTS, 1),
                capped(LLM_TOKENS_PER_MONTH, 10_000),
                switch(API_ACCESS, false),
                switch(MARKETPLACE_PUBLISH, false),
                switch(SSO, false),
            ],
        };

        let pro = PlanSeed {
            slug: "pro".into(),
            name: "Pro".into(),
            description: "For growing teams".into(),
            price: dec!(29.00),
            currency: usd(),
            billing_cycle: BillingCycle::Monthly,
            trial_days: 14,
            entitlements: vec![
                capped(MAX_WORKSPACES, 5),
                capped(STORAGE_MB, 10_000),
                capped(EXECUTIONS_PER_MONTH, 10_000),
                capped(WORKFLOWS, 5),
                capped(AGENTS, 10),
                capped(LLM_TOKENS_PER_MONTH, 1_000_000),
                switch(API_ACCESS, true),
                switch(MARKETPLACE_PUBLISH, true),
                switch(SSO, false),
            ],
        };

        let enterprise = PlanSeed {
            slug: "enterprise".into(),
            name: "Enterprise".into(),
            description: "Unlimited usage and SSO".into(),
            price: dec!(299.00),
            currency: usd(),
            billing_cycle: BillingCycle::Monthly,
            trial_days: 30,
            entitlements: features
                .iter()
                .map(|f| EntitlementSeed {
                    feature: f.key.clone(),
                    enabled: true,
                    limit: None,
                })
                .collect(),
        };

        Self {
            features,
            plans: vec![free, pro, enterprise],
        }
    }
}

fn metered(k: &'static str, name: &str, reset: UsageReset) -> FeatureSeed {
    FeatureSeed {
        key: FeatureKey::from_static(k),
        name: name.into(),
        description: String::new(),
        kind: FeatureKind::Metered,
        reset,
    }
}

fn toggle(k: &'static str, name: &str) -> FeatureSeed {
    FeatureSeed {
        key: FeatureKey::from_static(k),
        name: name.into(),
        description: String::new(),
        kind: FeatureKind::Toggle,
        reset: UsageReset::Never,
    }
}

fn capped(k: &'static str, limit: u64) -> EntitlementSeed {
    EntitlementSeed {
        feature: FeatureKey::from_static(k),
        enabled: true,
        limit: Some(limit),
    }
}

fn switch(k: &'static str, enabled: bool) -> EntitlementSeed {
    EntitlementSeed {
        feature: FeatureKey::from_static(k),
        enabled,
        limit: None,
    }
}

/// Counts from [`PlanCatalog::apply_seed`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub features_created: usize,
    pub plans_created: usize,
    pub entitlements_written: usize,
}

/// A plan binding with its feature definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanFeature {
    pub feature: Feature,
    pub entitlement: PlanEntitlement,
}

/// Plan/Feature catalog service
pub struct PlanCatalog {
    store: Arc<dyn TenancyStore>,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn TenancyStore>) -> Self {
        Self { store }
    }

    /// Add a feature to the catalog
    pub async fn create_feature(&self, feature: Feature) -> TenancyResult<Feature> {
        if self.store.get_feature(&feature.key).await?.is_some() {
            return Err(TenancyError::Validation(format!(
                "feature {} already exists",
                feature.key
            )));
        }
        self.store.insert_feature(&feature).await?;
        info!(feature = %feature.key, kind = %feature.kind, "Feature created");
        Ok(feature)
    }

    pub async fn get_feature(&self, key: &FeatureKey) -> TenancyResult<Feature> {
        self.store
            .get_feature(key)
            .await?
            .ok_or_else(|| TenancyError::UnknownFeature(key.clone()))
    }

    pub async fn list_features(&self) -> TenancyResult<Vec<Feature>> {
        self.store.list_features().await
    }

    /// Add a plan to the catalog
    pub async fn create_plan(&self, plan: Plan) -> TenancyResult<Plan> {
        if self.store.get_plan_by_slug(&plan.slug).await?.is_some() {
            return Err(TenancyError::Validation(format!(
                "plan {} already exists",
                plan.slug
            )));
        }
        self.store.insert_plan(&plan).await?;
        info!(plan = %plan.slug, price = %plan.price, "Plan created");
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: PlanId) -> TenancyResult<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| TenancyError::unknown_plan_id(plan_id))
    }

    pub async fn get_plan_by_slug(&self, slug: &str) -> TenancyResult<Plan> {
        self.store
            .get_plan_by_slug(slug)
            .await?
            .ok_or_else(|| TenancyError::UnknownPlan(slug.to_string()))
    }

    pub async fn list_plans(&self) -> TenancyResult<Vec<Plan>> {
        self.store.list_plans().await
    }

    /// Open or close a plan for new subscriptions
    ///
    /// Existing subscriptions keep their plan either way.
    pub async fn set_plan_active(&self, plan_id: PlanId, is_active: bool) -> TenancyResult<Plan> {
        let mut plan = self.get_plan(plan_id).await?;
        plan.is_active = is_active;
        self.store.update_plan(&plan).await?;
        info!(plan = %plan.slug, is_active, "Plan availability changed");
        Ok(plan)
    }

    /// Bind a feature to a plan, replacing any previous binding
    ///
    /// Toggle features carry no numeric limit; theirs is stored unlimited.
    pub async fn set_entitlement(
        &self,
        plan_id: PlanId,
        feature_key: &FeatureKey,
        enabled: bool,
        limit: Limit,
    ) -> TenancyResult<PlanEntitlement> {
        self.get_plan(plan_id).await?;
        let feature = self.get_feature(feature_key).await?;

        let entitlement = PlanEntitlement {
            plan_id,
            feature_key: feature_key.clone(),
            enabled,
            limit: match feature.kind {
                FeatureKind::Toggle => Limit::Unlimited,
                FeatureKind::Metered => limit,
            },
        };
        self.store.upsert_entitlement(&entitlement).await?;
        Ok(entitlement)
    }

    /// Binding of one feature on one plan, `None` when the plan lacks it
    pub async fn get_entitlement(
        &self,
        plan_id: PlanId,
        feature_key: &FeatureKey,
    ) -> TenancyResult<Option<PlanEntitlement>> {
        self.get_plan(plan_id).await?;
        self.get_feature(feature_key).await?;
        self.store.get_entitlement(plan_id, feature_key).await
    }

    /// Every feature the plan binds, ordered by key
    pub async fn list_features_for_plan(&self, plan_id: PlanId) -> TenancyResult<Vec<PlanFeature>> {
        self.get_plan(plan_id).await?;

        let mut bound = Vec::new();
        for entitlement in self.store.list_entitlements(plan_id).await? {
            let feature = self.get_feature(&entitlement.feature_key).await?;
            bound.push(PlanFeature { feature, entitlement });
        }
        bound.sort_by(|a, b| a.feature.key.cmp(&b.feature.key));
        Ok(bound)
    }

    /// Create missing features and plans, then write every binding
    ///
    /// Existing features and plans are left untouched, so applying the same
    /// seed twice changes nothing.
    pub async fn apply_seed(&self, seed: &CatalogSeed) -> TenancyResult<SeedReport> {
        let mut report = SeedReport::default();
        let now = Utc::now();

        for fs in &seed.features {
            if self.store.get_feature(&fs.key).await?.is_none() {
                self.store
                    .insert_feature(&Feature {
                        key: fs.key.clone(),
                        name: fs.name.clone(),
                        description: fs.description.clone(),
                        kind: fs.kind,
                        reset: fs.reset,
                    })
                    .await?;
                report.features_created += 1;
            }
        }

        for ps in &seed.plans {
            let plan = match self.store.get_plan_by_slug(&ps.slug).await? {
                Some(existing) => existing,
                None => {
                    let mut plan = Plan::new(&ps.slug, &ps.name, ps.price, ps.billing_cycle, now)?;
                    plan.description = ps.description.clone();
                    plan.currency = ps.currency.clone();
                    plan.trial_days = ps.trial_days;
                    self.store.insert_plan(&plan).await?;
                    report.plans_created += 1;
                    plan
                }
            };

            for es in &ps.entitlements {
                let limit = es.limit.map_or(Limit::Unlimited, Limit::Capped);
                self.set_entitlement(plan.plan_id, &es.feature, es.enabled, limit)
                    .await?;
                report.entitlements_written += 1;
            }
        }

        info!(
            features = report.features_created,
            plans = report.plans_created,
            entitlements = report.entitlements_written,
            "Catalog seed applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_standard_seed() {
        let catalog = catalog();
        let report = catalog.apply_seed(&CatalogSeed::standard()).await.unwrap();
        assert_eq!(report.features_created, 9);
        assert_eq!(report.plans_created, 3);

        let pro = catalog.get_plan_by_slug("pro").await.unwrap();
        let workflows = FeatureKey::new(keys::WORKFLOWS).unwrap();
        let ent = catalog
            .get_entitlement(pro.plan_id, &workflows)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ent.limit, Limit::Capped(5));
        assert_eq!(catalog.list_features_for_plan(pro.plan_id).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let catalog = catalog();
        catalog.apply_seed(&CatalogSeed::standard()).await.unwrap();
        let again = catalog.apply_seed(&CatalogSeed::standard()).await.unwrap();

        assert_eq!(again.features_created, 0);
        assert_eq!(again.plans_created, 0);
        assert_eq!(catalog.list_plans().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_feature_rejected() {
        let catalog = catalog();
        let feature = Feature::toggle(FeatureKey::new("sso").unwrap(), "SSO");
        catalog.create_feature(feature.clone()).await.unwrap();

        let err = catalog.create_feature(feature).await.unwrap_err();
        assert!(matches!(err, TenancyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_entitlement_for_unknown_feature() {
        let catalog = catalog();
        let plan = Plan::new("team", "Team", dec!(10), BillingCycle::Monthly, Utc::now()).unwrap();
        let plan = catalog.create_plan(plan).await.unwrap();

        let err = catalog
            .set_entitlement(plan.plan_id, &FeatureKey::new("ghost").unwrap(), true, Limit::Capped(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::UnknownFeature(_)));
    }

    #[tokio::test]
    async fn test_toggle_binding_drops_limit() {
        let catalog = catalog();
        catalog.apply_seed(&CatalogSeed::standard()).await.unwrap();
        let free = catalog.get_plan_by_slug("free").await.unwrap();

        let ent = catalog
            .set_entitlement(free.plan_id, &FeatureKey::new(keys::SSO).unwrap(), true, Limit::Capped(3))
            .await
            .unwrap();
        assert_eq!(ent.limit, Limit::Unlimited);
    }

    #[tokio::test]
    async fn test_unknown_plan_slug() {
        let err = catalog().get_plan_by_slug("platinum").await.unwrap_err();
        assert_eq!(err, TenancyError::UnknownPlan("platinum".into()));
    }
}
