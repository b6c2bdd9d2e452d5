//! API Routes

pub mod entitlements;
pub mod health;
pub mod plans;
pub mod subscriptions;
pub mod tenants;
pub mod usage;

use crate::error::ApiResult;
use tenancy_core::FeatureKey;

/// Validate a feature key taken from the path
pub(crate) fn feature_key(raw: &str) -> ApiResult<FeatureKey> {
    Ok(FeatureKey::new(raw)?)
}
