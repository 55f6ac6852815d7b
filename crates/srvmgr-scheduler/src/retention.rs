//! Age-based pruning of execution history.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info};

use srvmgr_core::config::SchedulerConfig;
use srvmgr_core::time;

use crate::error::Result;
use crate::store::ExecutionStore;
use crate::types::ExecutionFilter;

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Records older than this many days are deleted. 0 keeps everything.
    pub days: u32,
    pub interval: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            days: config.retention_days,
            interval: Duration::from_secs(config.prune_interval_secs.max(1)),
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.days > 0).then(|| now - chrono::Duration::days(i64::from(self.days)))
    }
}

/// Delete finished executions created before the policy cutoff.
pub fn prune(store: &dyn ExecutionStore, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize> {
    let Some(cutoff) = policy.cutoff(now) else {
        return Ok(0);
    };
    store.delete(&ExecutionFilter {
        older_than: Some(cutoff),
        finished_only: true,
        ..ExecutionFilter::default()
    })
}

/// Prune immediately, then every `policy.interval`, until `shutdown` is set.
pub async fn run(
    store: Arc<dyn ExecutionStore>,
    policy: RetentionPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    if policy.days == 0 {
        info!("execution retention disabled");
        return;
    }
    info!(days = policy.days, interval_secs = policy.interval.as_secs(), "retention sweeper started");

    let mut interval = tokio::time::interval(policy.interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match prune(store.as_ref(), &policy, time::now()) {
                    Ok(0) => {}
                    Ok(n) => info!(deleted = n, "old executions pruned"),
                    Err(e) => error!("retention sweep failed: {e}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
