//! Row encoding and decoding

use crate::db_err;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Decode, Row, Sqlite, Type};
use std::fmt::Display;
use std::str::FromStr;
use tenancy_core::{
    Feature, FeatureKey, Limit, Plan, PlanEntitlement, Subscription, TenancyError, TenancyResult,
    Tenant, TenantFeature, UsageEvent,
};
use uuid::Uuid;

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

pub(crate) fn to_i64(what: &str, value: u64) -> TenancyResult<i64> {
    i64::try_from(value)
        .map_err(|_| TenancyError::Validation(format!("{what} exceeds storage range: {value}")))
}

/// `(is_unlimited, limit_value)` columns
pub(crate) fn limit_columns(limit: &Limit) -> TenancyResult<(bool, Option<i64>)> {
    match limit {
        Limit::Unlimited => Ok((true, None)),
        Limit::Capped(cap) => Ok((false, Some(to_i64("limit", *cap)?))),
    }
}

fn corrupt(column: &str, err: impl Display) -> TenancyError {
    TenancyError::Persistence(format!("corrupt column {column}: {err}"))
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> TenancyResult<T>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get(column).map_err(db_err)
}

fn parsed<T>(row: &SqliteRow, column: &str) -> TenancyResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = get(row, column)?;
    raw.parse().map_err(|e| corrupt(column, e))
}

fn opt_parsed<T>(row: &SqliteRow, column: &str) -> TenancyResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = get(row, column)?;
    raw.map(|s| s.parse().map_err(|e| corrupt(column, e)))
        .transpose()
}

fn time(row: &SqliteRow, column: &str) -> TenancyResult<DateTime<Utc>> {
    let raw: String = get(row, column)?;
    parse_time(column, &raw)
}

fn opt_time(row: &SqliteRow, column: &str) -> TenancyResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = get(row, column)?;
    raw.map(|s| parse_time(column, &s)).transpose()
}

fn parse_time(column: &str, raw: &str) -> TenancyResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| corrupt(column, e))
}

fn count(row: &SqliteRow, column: &str) -> TenancyResult<u64> {
    let raw: i64 = get(row, column)?;
    u64::try_from(raw).map_err(|e| corrupt(column, e))
}

fn limit(unlimited: bool, value: Option<i64>, column: &str) -> TenancyResult<Limit> {
    if unlimited {
        return Ok(Limit::Unlimited);
    }
    let value = value.ok_or_else(|| corrupt(column, "capped limit without value"))?;
    u64::try_from(value)
        .map(Limit::Capped)
        .map_err(|e| corrupt(column, e))
}

pub(crate) fn feature(row: &SqliteRow) -> TenancyResult<Feature> {
    Ok(Feature {
        key: parsed(row, "feature_key")?,
        name: get(row, "name")?,
        description: get(row, "description")?,
        kind: parsed(row, "kind")?,
        reset: parsed(row, "reset")?,
    })
}

pub(crate) fn plan(row: &SqliteRow) -> TenancyResult<Plan> {
    let trial_days: i64 = get(row, "trial_days")?;
    Ok(Plan {
        plan_id: parsed(row, "plan_id")?,
        slug: get(row, "slug")?,
        name: get(row, "name")?,
        description: get(row, "description")?,
        price: parsed::<Decimal>(row, "price")?,
        currency: get(row, "currency")?,
        billing_cycle: parsed(row, "billing_cycle")?,
        trial_days: u32::try_from(trial_days).map_err(|e| corrupt("trial_days", e))?,
        is_active: get(row, "is_active")?,
        created_at: time(row, "created_at")?,
    })
}

pub(crate) fn entitlement(row: &SqliteRow) -> TenancyResult<PlanEntitlement> {
    Ok(PlanEntitlement {
        plan_id: parsed(row, "plan_id")?,
        feature_key: parsed(row, "feature_key")?,
        enabled: get(row, "enabled")?,
        limit: limit(get(row, "is_unlimited")?, get(row, "limit_value")?, "limit_value")?,
    })
}

pub(crate) fn tenant(row: &SqliteRow) -> TenancyResult<Tenant> {
    Ok(Tenant {
        tenant_id: parsed(row, "tenant_id")?,
        name: get(row, "name")?,
        status: parsed(row, "status")?,
        plan_id: opt_parsed(row, "plan_id")?,
        version: count(row, "version")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}

pub(crate) fn subscription(row: &SqliteRow) -> TenancyResult<Subscription> {
    Ok(Subscription {
        subscription_id: parsed(row, "subscription_id")?,
        tenant_id: parsed(row, "tenant_id")?,
        plan_id: parsed(row, "plan_id")?,
        status: parsed(row, "status")?,
        billing_cycle: parsed(row, "billing_cycle")?,
        billing_anchor: time(row, "billing_anchor")?,
        current_period_start: time(row, "current_period_start")?,
        current_period_end: time(row, "current_period_end")?,
        trial_end: opt_time(row, "trial_end")?,
        cancel_at_period_end: get(row, "cancel_at_period_end")?,
        cancelled_at: opt_time(row, "cancelled_at")?,
        expires_at: opt_time(row, "expires_at")?,
        superseded_by: opt_parsed(row, "superseded_by")?,
        version: count(row, "version")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}

pub(crate) fn tenant_feature(row: &SqliteRow) -> TenancyResult<TenantFeature> {
    let override_unlimited: Option<bool> = get(row, "override_unlimited")?;
    let override_limit = override_unlimited
        .map(|unlimited| limit(unlimited, get(row, "override_limit")?, "override_limit"))
        .transpose()?;

    Ok(TenantFeature {
        tenant_id: parsed(row, "tenant_id")?,
        feature_key: parsed(row, "feature_key")?,
        is_enabled: get(row, "override_enabled")?,
        limit: override_limit,
        expires_at: opt_time(row, "expires_at")?,
        usage_count: count(row, "usage_count")?,
        period_start: opt_time(row, "period_start")?,
        updated_at: time(row, "updated_at")?,
    })
}

pub(crate) fn usage_event(row: &SqliteRow) -> TenancyResult<UsageEvent> {
    Ok(UsageEvent {
        event_id: parsed::<Uuid>(row, "event_id")?,
        tenant_id: parsed(row, "tenant_id")?,
        feature_key: parsed::<FeatureKey>(row, "feature_key")?,
        kind: parsed(row, "kind")?,
        amount: count(row, "amount")?,
        usage_after: count(row, "usage_after")?,
        idempotency_key: get(row, "idempotency_key")?,
        occurred_at: time(row, "occurred_at")?,
    })
}
