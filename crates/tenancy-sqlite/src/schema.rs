//! Table definitions
//!
//! Timestamps are fixed-width RFC 3339 text (nanosecond precision, `Z`
//! suffix) so that text ordering matches time ordering. Counters and limits
//! are INTEGER; prices are decimal text.

pub(crate) const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS features (
        feature_key  TEXT PRIMARY KEY,
        name         TEXT NOT NULL,
        description  TEXT NOT NULL DEFAULT '',
        kind         TEXT NOT NULL CHECK (kind IN ('toggle', 'metered')),
        reset        TEXT NOT NULL CHECK (reset IN ('never', 'billing_period'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plans (
        plan_id        TEXT PRIMARY KEY,
        slug           TEXT NOT NULL UNIQUE,
        name           TEXT NOT NULL,
        description    TEXT NOT NULL DEFAULT '',
        price          TEXT NOT NULL,
        currency       TEXT NOT NULL,
        billing_cycle  TEXT NOT NULL CHECK (billing_cycle IN ('monthly', 'annual')),
        trial_days     INTEGER NOT NULL DEFAULT 0,
        is_active      INTEGER NOT NULL DEFAULT 1,
        created_at     TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plan_entitlements (
        plan_id       TEXT NOT NULL REFERENCES plans (plan_id),
        feature_key   TEXT NOT NULL REFERENCES features (feature_key),
        enabled       INTEGER NOT NULL,
        is_unlimited  INTEGER NOT NULL,
        limit_value   INTEGER,
        PRIMARY KEY (plan_id, feature_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tenants (
        tenant_id   TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        status      TEXT NOT NULL CHECK (status IN ('trial', 'active', 'suspended', 'expired')),
        plan_id     TEXT REFERENCES plans (plan_id),
        version     INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS tenants_created ON tenants (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        subscription_id       TEXT PRIMARY KEY,
        tenant_id             TEXT NOT NULL REFERENCES tenants (tenant_id),
        plan_id               TEXT NOT NULL REFERENCES plans (plan_id),
        status                TEXT NOT NULL,
        billing_cycle         TEXT NOT NULL,
        billing_anchor        TEXT NOT NULL,
        current_period_start  TEXT NOT NULL,
        current_period_end    TEXT NOT NULL,
        trial_end             TEXT,
        cancel_at_period_end  INTEGER NOT NULL DEFAULT 0,
        cancelled_at          TEXT,
        expires_at            TEXT,
        superseded_by         TEXT,
        version               INTEGER NOT NULL DEFAULT 0,
        created_at            TEXT NOT NULL,
        updated_at            TEXT NOT NULL
    )
    "#,
    // at most one trialing/active subscription per tenant
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS subscriptions_one_live
        ON subscriptions (tenant_id) WHERE status IN ('trialing', 'active')
    "#,
    "CREATE INDEX IF NOT EXISTS subscriptions_tenant ON subscriptions (tenant_id, created_at)",
    "CREATE INDEX IF NOT EXISTS subscriptions_period_end ON subscriptions (status, current_period_end)",
    r#"
    CREATE TABLE IF NOT EXISTS tenant_features (
        tenant_id           TEXT NOT NULL REFERENCES tenants (tenant_id),
        feature_key         TEXT NOT NULL REFERENCES features (feature_key),
        override_enabled    INTEGER,
        override_unlimited  INTEGER,
        override_limit      INTEGER,
        expires_at          TEXT,
        usage_count         INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
        period_start        TEXT,
        updated_at          TEXT NOT NULL,
        PRIMARY KEY (tenant_id, feature_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS usage_events (
        event_id         TEXT PRIMARY KEY,
        tenant_id        TEXT NOT NULL,
        feature_key      TEXT NOT NULL,
        kind             TEXT NOT NULL,
        amount           INTEGER NOT NULL,
        usage_after      INTEGER NOT NULL,
        idempotency_key  TEXT,
        occurred_at      TEXT NOT NULL,
        FOREIGN KEY (tenant_id, feature_key) REFERENCES tenant_features (tenant_id, feature_key)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS usage_events_idempotency
        ON usage_events (tenant_id, feature_key, idempotency_key)
        WHERE idempotency_key IS NOT NULL
    "#,
    "CREATE INDEX IF NOT EXISTS usage_events_row ON usage_events (tenant_id, feature_key)",
];
