//! Tenant Registry
//!
//! Tenant identity, status and plan assignment, plus the per-tenant feature
//! overrides that take precedence over plan entitlements.

use crate::error::{TenancyError, TenancyResult};
use crate::model::*;
use crate::store::{TenancyStore, UsageKey};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Re-reads after losing a compare-and-save race
const SAVE_RETRIES: u32 = 5;

/// Tenant update request
#[derive(Debug, Clone, Default)]
pub struct TenantUpdate {
    /// New display name
    pub name: Option<String>,
}

/// Tenant registry
pub struct TenantRegistry {
    store: Arc<dyn TenancyStore>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn TenancyStore>) -> Self {
        Self { store }
    }

    /// Create new tenant
    pub async fn create(&self, name: &str) -> TenancyResult<Tenant> {
        let tenant = Tenant::new(name, Utc::now())?;
        self.store.insert_tenant(&tenant).await?;
        info!(tenant_id = %tenant.tenant_id, name = %tenant.name, "Tenant created");
        Ok(tenant)
    }

    /// Get tenant
    pub async fn get(&self, tenant_id: TenantId) -> TenancyResult<Tenant> {
        self.store
            .get_tenant(tenant_id)
            .await?
            .ok_or(TenancyError::UnknownTenant(tenant_id))
    }

    /// List all tenants, oldest first
    pub async fn list(&self) -> TenancyResult<Vec<Tenant>> {
        self.store.list_tenants().await
    }

    /// Update tenant
    pub async fn update(&self, tenant_id: TenantId, update: TenantUpdate) -> TenancyResult<Tenant> {
        let name = match update.name {
            // revalidate through the constructor rules
            Some(name) => Some(Tenant::new(&name, Utc::now())?.name),
            None => None,
        };
        let (tenant, _) = self
            .modify(tenant_id, Utc::now(), |current| {
                let mut next = current.clone();
                if let Some(name) = &name {
                    next.name = name.clone();
                }
                Ok(Some(next))
            })
            .await?;
        Ok(tenant)
    }

    /// Suspend tenant; entitlements are denied until reactivated
    pub async fn suspend(&self, tenant_id: TenantId) -> TenancyResult<Tenant> {
        let (tenant, changed) = self
            .modify(tenant_id, Utc::now(), |current| match current.status {
                TenantStatus::Suspended => Ok(None),
                TenantStatus::Expired => Err(TenancyError::InvalidTransition {
                    from: current.status.to_string(),
                    to: TenantStatus::Suspended.to_string(),
                }),
                TenantStatus::Trial | TenantStatus::Active => {
                    let mut next = current.clone();
                    next.status = TenantStatus::Suspended;
                    Ok(Some(next))
                }
            })
            .await?;
        if changed {
            info!(tenant_id = %tenant_id, "Tenant suspended");
        }
        Ok(tenant)
    }

    /// Lift a suspension; status follows the live subscription
    pub async fn reactivate(&self, tenant_id: TenantId) -> TenancyResult<Tenant> {
        let live = self.store.live_subscription(tenant_id).await?;
        let restored = match live.map(|s| s.status) {
            Some(SubscriptionStatus::Trialing) => TenantStatus::Trial,
            _ => TenantStatus::Active,
        };

        let (tenant, changed) = self
            .modify(tenant_id, Utc::now(), |current| match current.status {
                TenantStatus::Suspended => {
                    let mut next = current.clone();
                    next.status = restored;
                    Ok(Some(next))
                }
                TenantStatus::Trial | TenantStatus::Active => Ok(None),
                TenantStatus::Expired => Err(TenancyError::InvalidTransition {
                    from: current.status.to_string(),
                    to: TenantStatus::Active.to_string(),
                }),
            })
            .await?;
        if changed {
            info!(tenant_id = %tenant_id, status = %tenant.status, "Tenant reactivated");
        }
        Ok(tenant)
    }

    /// Deactivate tenant (status change only; tenants are never deleted)
    pub async fn deactivate(&self, tenant_id: TenantId) -> TenancyResult<Tenant> {
        let (tenant, changed) = self
            .modify(tenant_id, Utc::now(), |current| {
                if current.status == TenantStatus::Expired {
                    return Ok(None);
                }
                let mut next = current.clone();
                next.status = TenantStatus::Expired;
                Ok(Some(next))
            })
            .await?;
        if changed {
            info!(tenant_id = %tenant_id, "Tenant deactivated");
        }
        Ok(tenant)
    }

    /// Record the tenant's plan and subscription-driven status
    ///
    /// An administrative suspension is kept unless the tenant expires.
    pub(crate) async fn apply_subscription(
        &self,
        tenant_id: TenantId,
        plan_id: Option<PlanId>,
        status: Option<TenantStatus>,
        now: DateTime<Utc>,
    ) -> TenancyResult<Tenant> {
        let (tenant, _) = self
            .modify(tenant_id, now, |current| {
                let mut next = current.clone();
                next.plan_id = plan_id;
                if let Some(status) = status {
                    if next.status != TenantStatus::Suspended || status == TenantStatus::Expired {
                        next.status = status;
                    }
                }
                Ok(Some(next))
            })
            .await?;
        Ok(tenant)
    }

    /// Read, change and compare-and-save one tenant
    ///
    /// `change` sees the latest stored row on every attempt and returns
    /// `None` when nothing needs saving. The flag reports whether a write
    /// happened.
    async fn modify<F>(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        change: F,
    ) -> TenancyResult<(Tenant, bool)>
    where
        F: Fn(&Tenant) -> TenancyResult<Option<Tenant>>,
    {
        for attempt in 0..=SAVE_RETRIES {
            let current = self.get(tenant_id).await?;
            let Some(mut next) = change(&current)? else {
                return Ok((current, false));
            };
            next.touch(now);
            if self.store.compare_and_save_tenant(&next, current.version).await? {
                return Ok((next, true));
            }
            debug!(tenant_id = %tenant_id, attempt, "Tenant modified concurrently, retrying");
        }
        Err(TenancyError::ConcurrencyConflict(format!(
            "tenant {tenant_id} was modified concurrently"
        )))
    }

    /// Set a tenant-specific override for one feature
    ///
    /// Usage counters on the row are kept.
    pub async fn set_feature_override(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        feature_override: FeatureOverride,
    ) -> TenancyResult<TenantFeature> {
        let now = Utc::now();
        if feature_override.expires_at.is_some_and(|expires| expires <= now) {
            return Err(TenancyError::Validation(
                "override expiry must be in the future".into(),
            ));
        }
        if feature_override.is_enabled.is_none() && feature_override.limit.is_none() {
            return Err(TenancyError::Validation(
                "override must set is_enabled or limit".into(),
            ));
        }

        self.get(tenant_id).await?;
        let row = self
            .store
            .save_override(
                &UsageKey::new(tenant_id, feature_key.clone()),
                &feature_override,
                now,
            )
            .await?;
        info!(
            tenant_id = %tenant_id,
            feature = %feature_key,
            enabled = ?feature_override.is_enabled,
            limit = ?feature_override.limit,
            "Feature override set"
        );
        Ok(row)
    }

    /// Drop the override; the plan entitlement applies again
    pub async fn clear_feature_override(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
    ) -> TenancyResult<TenantFeature> {
        self.get(tenant_id).await?;
        let row = self
            .store
            .save_override(
                &UsageKey::new(tenant_id, feature_key.clone()),
                &FeatureOverride::default(),
                Utc::now(),
            )
            .await?;
        info!(tenant_id = %tenant_id, feature = %feature_key, "Feature override cleared");
        Ok(row)
    }

    /// Override and usage rows of a tenant
    pub async fn tenant_features(&self, tenant_id: TenantId) -> TenancyResult<Vec<TenantFeature>> {
        self.get(tenant_id).await?;
        self.store.list_tenant_features(tenant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CatalogRepository, InMemoryStore, TenantRepository};
    use uuid::Uuid;

    async fn registry() -> TenantRegistry {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_feature(&Feature::toggle(FeatureKey::new("sso").unwrap(), "SSO"))
            .await
            .unwrap();
        TenantRegistry::new(store)
    }

    #[tokio::test]
    async fn test_tenant_lifecycle() {
        let registry = registry().await;

        let tenant = registry.create("TestCorp").await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(registry.list().await.unwrap().len(), 1);

        let updated = registry
            .update(tenant.tenant_id, TenantUpdate { name: Some("TestCorp Inc".into()) })
            .await
            .unwrap();
        assert_eq!(updated.name, "TestCorp Inc");

        let suspended = registry.suspend(tenant.tenant_id).await.unwrap();
        assert_eq!(suspended.status, TenantStatus::Suspended);

        let back = registry.reactivate(tenant.tenant_id).await.unwrap();
        assert_eq!(back.status, TenantStatus::Active);

        let gone = registry.deactivate(tenant.tenant_id).await.unwrap();
        assert_eq!(gone.status, TenantStatus::Expired);
        assert!(registry.get(tenant.tenant_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_tenant_cannot_be_suspended() {
        let registry = registry().await;
        let tenant = registry.create("Gone").await.unwrap();
        registry.deactivate(tenant.tenant_id).await.unwrap();

        let err = registry.suspend(tenant.tenant_id).await.unwrap_err();
        assert!(matches!(err, TenancyError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_stale_save_loses_to_suspension() {
        let store = Arc::new(InMemoryStore::new());
        let registry = TenantRegistry::new(store.clone());
        let tenant = registry.create("Acme").await.unwrap();

        // a writer that read the tenant before the suspension landed
        let mut stale = tenant.clone();
        stale.plan_id = Some(Uuid::new_v4());
        stale.touch(Utc::now());

        let suspended = registry.suspend(tenant.tenant_id).await.unwrap();
        assert_eq!(suspended.version, tenant.version + 1);
        assert!(!store.compare_and_save_tenant(&stale, tenant.version).await.unwrap());
        assert_eq!(registry.get(tenant.tenant_id).await.unwrap().status, TenantStatus::Suspended);

        // the re-reading path keeps the suspension
        let applied = registry
            .apply_subscription(tenant.tenant_id, stale.plan_id, Some(TenantStatus::Active), Utc::now())
            .await
            .unwrap();
        assert_eq!(applied.status, TenantStatus::Suspended);
        assert_eq!(applied.plan_id, stale.plan_id);
        assert_eq!(applied.version, tenant.version + 2);
    }

    #[tokio::test]
    async fn test_blank_name_rejected() {
        let err = registry().await.create("   ").await.unwrap_err();
        assert!(matches!(err, TenancyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let id = Uuid::new_v4();
        let err = registry().await.get(id).await.unwrap_err();
        assert_eq!(err, TenancyError::UnknownTenant(id));
    }

    #[tokio::test]
    async fn test_override_roundtrip() {
        let registry = registry().await;
        let tenant = registry.create("Acme").await.unwrap();
        let sso = FeatureKey::new("sso").unwrap();

        let row = registry
            .set_feature_override(
                tenant.tenant_id,
                &sso,
                FeatureOverride { is_enabled: Some(true), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(row.is_enabled, Some(true));

        let cleared = registry.clear_feature_override(tenant.tenant_id, &sso).await.unwrap();
        assert_eq!(cleared.feature_override(), FeatureOverride::default());
    }

    #[tokio::test]
    async fn test_override_validation() {
        let registry = registry().await;
        let tenant = registry.create("Acme").await.unwrap();
        let sso = FeatureKey::new("sso").unwrap();

        let empty = registry
            .set_feature_override(tenant.tenant_id, &sso, FeatureOverride::default())
            .await;
        assert!(matches!(empty, Err(TenancyError::Validation(_))));

        let past = registry
            .set_feature_override(
                tenant.tenant_id,
                &sso,
                FeatureOverride {
                    is_enabled: Some(true),
                    limit: None,
                    expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
                },
            )
            .await;
        assert!(matches!(past, Err(TenancyError::Validation(_))));

        let unknown = registry
            .set_feature_override(
                tenant.tenant_id,
                &FeatureKey::new("ghost").unwrap(),
                FeatureOverride { is_enabled: Some(true), ..Default::default() },
            )
            .await;
        assert!(matches!(unknown, Err(TenancyError::UnknownFeature(_))));
    }
}
