//! Tenancy Data Model

use crate::error::{TenancyError, TenancyResult};
use chrono::{DateTime, Datelike, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tenant ID
pub type TenantId = Uuid;
/// Plan ID
pub type PlanId = Uuid;
/// Subscription ID
pub type SubscriptionId = Uuid;

/// Closed string-backed enums: `as_str`, `FromStr` and `Display` share one table.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Canonical lowercase name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = TenancyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(TenancyError::Validation(format!(
                        "invalid {}: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Validates catalog identifiers (feature keys, plan slugs)
///
/// # Invariants
/// - 1..=64 characters
/// - lowercase ascii, digits, `_`, `.`, `-`
fn validate_identifier(kind: &str, value: &str) -> TenancyResult<()> {
    if value.is_empty() {
        return Err(TenancyError::Validation(format!("{kind} cannot be empty")));
    }
    if value.len() > 64 {
        return Err(TenancyError::Validation(format!("{kind} max 64 characters")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
    {
        return Err(TenancyError::Validation(format!(
            "{kind} must be lowercase alphanumeric, '_', '.' or '-': {value}"
        )));
    }
    Ok(())
}

/// Feature key (Value Object)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureKey(String);

impl FeatureKey {
    /// Create new feature key with validation
    pub fn new(key: impl Into<String>) -> TenancyResult<Self> {
        let key = key.into();
        validate_identifier("feature key", &key)?;
        Ok(Self(key))
    }

    /// Built-in key known to be valid
    pub(crate) fn from_static(key: &'static str) -> Self {
        debug_assert!(validate_identifier("feature key", key).is_ok());
        Self(key.to_string())
    }

    /// Get inner value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FeatureKey {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for FeatureKey {
    type Error = TenancyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FeatureKey> for String {
    fn from(key: FeatureKey) -> Self {
        key.0
    }
}

// ============ Tenants ============

/// Tenant status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Trial,
    Active,
    Suspended,
    Expired,
}

string_enum!(TenantStatus {
    Trial => "trial",
    Active => "active",
    Suspended => "suspended",
    Expired => "expired",
});

impl TenantStatus {
    /// Whether entitlements may be granted at all
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Trial | Self::Active)
    }
}

/// Tenant definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    /// Unique tenant ID
    pub tenant_id: TenantId,
    /// Display name
    pub name: String,
    /// Lifecycle status (never hard-deleted)
    pub status: TenantStatus,
    /// Plan of the live subscription, if any
    pub plan_id: Option<PlanId>,
    /// Bumped on every save, for compare-and-save
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Create new tenant
    pub fn new(name: &str, now: DateTime<Utc>) -> TenancyResult<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TenancyError::Validation("tenant name cannot be empty".into()));
        }
        if name.len() > 200 {
            return Err(TenancyError::Validation("tenant name max 200 characters".into()));
        }
        Ok(Self {
            tenant_id: Uuid::new_v4(),
            name: name.to_string(),
            status: TenantStatus::Active,
            plan_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Advance version and timestamp before a save
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

// ============ Catalog ============

/// Billing cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Annual,
}

string_enum!(BillingCycle {
    Monthly => "monthly",
    Annual => "annual",
});

impl BillingCycle {
    /// Calendar months per period
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Annual => 12,
        }
    }

    /// The period of this cycle that starts at `start`
    pub fn period_from(&self, start: DateTime<Utc>) -> Period {
        Period {
            start,
            end: self.nth_boundary(start, 1),
        }
    }

    /// The period of the schedule anchored at `anchor` that contains `at`
    ///
    /// Boundaries are always computed from the anchor so that month-end
    /// anchors do not drift (Jan 31 -> Feb 28 -> Mar 31).
    pub fn period_containing(&self, anchor: DateTime<Utc>, at: DateTime<Utc>) -> Period {
        if at < anchor {
            return self.period_from(anchor);
        }
        let months_apart =
            (at.year() - anchor.year()) * 12 + at.month() as i32 - anchor.month() as i32;
        let mut n = u32::try_from(months_apart.max(0)).unwrap_or(0) / self.months();

        // the calendar estimate is off by at most one period either way
        while n > 0 && self.nth_boundary(anchor, n) > at {
            n -= 1;
        }
        while self.nth_boundary(anchor, n + 1) <= at {
            n += 1;
        }

        Period {
            start: self.nth_boundary(anchor, n),
            end: self.nth_boundary(anchor, n + 1),
        }
    }

    fn nth_boundary(&self, anchor: DateTime<Utc>, n: u32) -> DateTime<Utc> {
        anchor
            .checked_add_months(Months::new(n.saturating_mul(self.months())))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Half-open billing period `[start, end)`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// Whether `at` falls inside the period
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Plan: a named bundle of entitlements
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub plan_id: PlanId,
    /// Unique slug ("free", "pro", ...)
    pub slug: String,
    pub name: String,
    pub description: String,
    /// Price per billing cycle
    pub price: Decimal,
    pub currency: String,
    /// Default billing cycle for new subscriptions
    pub billing_cycle: BillingCycle,
    /// Trial length offered on subscribe (0 = no trial)
    pub trial_days: u32,
    /// Inactive plans accept no new subscriptions
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Create new plan
    pub fn new(
        slug: &str,
        name: &str,
        price: Decimal,
        billing_cycle: BillingCycle,
        now: DateTime<Utc>,
    ) -> TenancyResult<Self> {
        validate_identifier("plan slug", slug)?;
        if price.is_sign_negative() {
            return Err(TenancyError::Validation("plan price cannot be negative".into()));
        }
        Ok(Self {
            plan_id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: name.to_string(),
            description: String::new(),
            price,
            currency: "USD".into(),
            billing_cycle,
            trial_days: 0,
            is_active: true,
            created_at: now,
        })
    }
}

/// How a feature is gated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// On/off capability
    Toggle,
    /// Counted against a numeric limit
    Metered,
}

string_enum!(FeatureKind {
    Toggle => "toggle",
    Metered => "metered",
});

/// When a metered counter returns to zero
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsageReset {
    /// Gauge-like counters (workspaces, storage)
    #[default]
    Never,
    /// Reset at every billing period rollover
    BillingPeriod,
}

string_enum!(UsageReset {
    Never => "never",
    BillingPeriod => "billing_period",
});

/// Catalog feature
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feature {
    pub key: FeatureKey,
    pub name: String,
    pub description: String,
    pub kind: FeatureKind,
    pub reset: UsageReset,
}

impl Feature {
    /// Metered feature
    pub fn metered(key: FeatureKey, name: &str, reset: UsageReset) -> Self {
        Self {
            key,
            name: name.to_string(),
            description: String::new(),
            kind: FeatureKind::Metered,
            reset,
        }
    }

    /// Toggle feature
    pub fn toggle(key: FeatureKey, name: &str) -> Self {
        Self {
            key,
            name: name.to_string(),
            description: String::new(),
            kind: FeatureKind::Toggle,
            reset: UsageReset::Never,
        }
    }

    /// Whether usage resets at rollover
    pub fn is_period_scoped(&self) -> bool {
        self.kind == FeatureKind::Metered && self.reset == UsageReset::BillingPeriod
    }
}

/// Numeric entitlement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    Capped(u64),
}

impl Limit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Cap value, `None` when unlimited
    pub fn cap(&self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Capped(cap) => Some(*cap),
        }
    }

    /// Whether one more unit fits
    pub fn has_headroom(&self, usage: u64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Capped(cap) => usage < *cap,
        }
    }

    /// Whether `amount` more units fit
    pub fn admits(&self, usage: u64, amount: u64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Capped(cap) => usage.checked_add(amount).is_some_and(|next| next <= *cap),
        }
    }

    /// Quota left at `usage`
    pub fn remaining(&self, usage: u64) -> Remaining {
        match self {
            Self::Unlimited => Remaining::Unlimited,
            Self::Capped(cap) => Remaining::Count(cap.saturating_sub(usage)),
        }
    }
}

/// Quota left for a tenant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    Unlimited,
    Count(u64),
}

/// Plan → Feature binding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanEntitlement {
    pub plan_id: PlanId,
    pub feature_key: FeatureKey,
    pub enabled: bool,
    /// Ignored for toggle features
    pub limit: Limit,
}

// ============ Tenant features ============

/// Tenant-specific override
///
/// Fields left `None` inherit from the plan entitlement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureOverride {
    pub is_enabled: Option<bool>,
    pub limit: Option<Limit>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FeatureOverride {
    /// Override that fully determines the grant on its own
    pub fn is_complete(&self) -> bool {
        self.is_enabled.is_some() && self.limit.is_some()
    }
}

/// Per-tenant override + usage tracker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantFeature {
    pub tenant_id: TenantId,
    pub feature_key: FeatureKey,
    pub is_enabled: Option<bool>,
    pub limit: Option<Limit>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    /// Billing period the counter belongs to
    pub period_start: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TenantFeature {
    /// Row with no override and zero usage
    pub fn fresh(tenant_id: TenantId, feature_key: FeatureKey, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            feature_key,
            is_enabled: None,
            limit: None,
            expires_at: None,
            usage_count: 0,
            period_start: None,
            updated_at: now,
        }
    }

    /// Override fields as a value
    pub fn feature_override(&self) -> FeatureOverride {
        FeatureOverride {
            is_enabled: self.is_enabled,
            limit: self.limit,
            expires_at: self.expires_at,
        }
    }

    /// Replace override fields, keeping usage
    pub fn set_override(&mut self, ov: &FeatureOverride, now: DateTime<Utc>) {
        self.is_enabled = ov.is_enabled;
        self.limit = ov.limit;
        self.expires_at = ov.expires_at;
        self.updated_at = now;
    }

    /// Override present and not expired
    pub fn override_active(&self, now: DateTime<Utc>) -> bool {
        (self.is_enabled.is_some() || self.limit.is_some())
            && self.expires_at.map_or(true, |expires| now < expires)
    }

    /// Usage counted against `period`
    ///
    /// Period-scoped counters stamped with an older period count as zero, so
    /// a rollover that has not been persisted yet is still honoured.
    pub fn usage_in(&self, feature: &Feature, period: Option<&Period>) -> u64 {
        match period {
            Some(period)
                if feature.is_period_scoped()
                    && self.period_start.map_or(true, |start| start < period.start) =>
            {
                0
            }
            _ => self.usage_count,
        }
    }
}

// ============ Subscriptions ============

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Cancelled,
    Expired,
    /// Replaced by an upgrade/downgrade
    Superseded,
}

string_enum!(SubscriptionStatus {
    Trialing => "trialing",
    Active => "active",
    Cancelled => "cancelled",
    Expired => "expired",
    Superseded => "superseded",
});

impl SubscriptionStatus {
    /// Non-terminal: at most one per tenant
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Trialing | Self::Active)
    }
}

/// Transition a live subscription is due for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Advance to the next billing period
    Rollover,
    /// Period ended after cancel-at-period-end
    Close,
    /// Term or trial ran out with no renewal
    Expire,
}

/// Subscription
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub subscription_id: SubscriptionId,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    /// Start of the first paid period; later periods are computed from it
    pub billing_anchor: DateTime<Utc>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// End of a non-renewing term
    pub expires_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<SubscriptionId>,
    /// Optimistic lock, bumped on every save
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Paid subscription starting at `now`
    pub fn active(
        tenant_id: TenantId,
        plan_id: PlanId,
        billing_cycle: BillingCycle,
        now: DateTime<Utc>,
    ) -> Self {
        let period = billing_cycle.period_from(now);
        Self {
            subscription_id: Uuid::new_v4(),
            tenant_id,
            plan_id,
            status: SubscriptionStatus::Active,
            billing_cycle,
            billing_anchor: now,
            current_period_start: period.start,
            current_period_end: period.end,
            trial_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
            expires_at: None,
            superseded_by: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Trial whose only period is the trial window
    pub fn trial(
        tenant_id: TenantId,
        plan_id: PlanId,
        billing_cycle: BillingCycle,
        trial_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let trial_end = now + chrono::Duration::days(i64::from(trial_days));
        Self {
            status: SubscriptionStatus::Trialing,
            current_period_end: trial_end,
            trial_end: Some(trial_end),
            ..Self::active(tenant_id, plan_id, billing_cycle, now)
        }
    }

    /// Persisted current period
    pub fn current_period(&self) -> Period {
        Period {
            start: self.current_period_start,
            end: self.current_period_end,
        }
    }

    /// The billing period that grants entitlements at `now`
    ///
    /// Renewing subscriptions whose persisted period has ended are projected
    /// forward, so readers never depend on a rollover having been written.
    pub fn effective_period(&self, now: DateTime<Utc>) -> Option<Period> {
        let current = self.current_period();
        if now < current.start {
            return None;
        }
        match self.status {
            SubscriptionStatus::Trialing => current.contains(now).then_some(current),
            SubscriptionStatus::Active => {
                if self.expires_at.is_some_and(|expires| now >= expires) {
                    return None;
                }
                if current.contains(now) {
                    return Some(current);
                }
                if self.cancel_at_period_end {
                    return None;
                }
                Some(self.billing_cycle.period_containing(self.billing_anchor, now))
            }
            _ => None,
        }
    }

    /// Transition due at `now`, if any
    pub fn pending_transition(&self, now: DateTime<Utc>) -> Option<Transition> {
        let ended = now >= self.current_period_end;
        match self.status {
            SubscriptionStatus::Trialing if ended => Some(if self.cancel_at_period_end {
                Transition::Close
            } else {
                Transition::Expire
            }),
            SubscriptionStatus::Active => {
                if self.cancel_at_period_end && ended {
                    Some(Transition::Close)
                } else if self.expires_at.is_some_and(|expires| now >= expires) {
                    Some(Transition::Expire)
                } else if ended {
                    Some(Transition::Rollover)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Copy advanced to the period containing `now`, for saving with CAS
    pub fn rolled_over(&self, now: DateTime<Utc>) -> Option<Self> {
        if self.pending_transition(now) != Some(Transition::Rollover) {
            return None;
        }
        let period = self.billing_cycle.period_containing(self.billing_anchor, now);
        let mut next = self.clone();
        next.current_period_start = period.start;
        next.current_period_end = period.end;
        next.touch(now);
        Some(next)
    }

    /// Bump version and timestamp before a save
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

// ============ Usage events ============

/// Usage event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventKind {
    Consumed,
    /// Consumed past the cap with explicit overage
    Overage,
    Released,
    Reset,
}

string_enum!(UsageEventKind {
    Consumed => "consumed",
    Overage => "overage",
    Released => "released",
    Reset => "reset",
});

/// Usage audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub feature_key: FeatureKey,
    pub kind: UsageEventKind,
    pub amount: u64,
    pub usage_after: u64,
    pub idempotency_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
}
