//! Background rollover sweep
//!
//! Rollover also happens lazily on every usage write, so the sweeper only
//! keeps idle tenants' subscriptions and counters current.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tenancy_core::SubscriptionLifecycle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Advance due subscriptions every `period` until `shutdown` flips to true
pub async fn sweep_task(
    lifecycle: Arc<SubscriptionLifecycle>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "Rollover sweeper started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match lifecycle.sweep_due(Utc::now()).await {
                    Ok(report) => debug!(?report, "Sweep complete"),
                    Err(err) => warn!(error = %err, "Sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Rollover sweeper stopped");
}
