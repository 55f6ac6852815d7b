//! Per-device reachability tracking with offline debouncing.
//!
//! A single reachable probe brings a device online at once. Going offline
//! from `online` needs `threshold` consecutive unreachable probes, passing
//! through `pending`. A device that was never seen (`unknown`) goes offline
//! on its first negative probe. Probe errors report `unknown` and leave the
//! failure counter alone.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info};

use srvmgr_core::config::DEFAULT_OFFLINE_THRESHOLD;
use srvmgr_core::DeviceId;

use crate::device::Device;
use crate::probe::{ProbeOutcome, ReachabilityProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityState {
    #[default]
    Unknown,
    Online,
    Offline,
    /// Online device that missed fewer than `threshold` probes in a row.
    Pending,
}

impl fmt::Display for ReachabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// Snapshot of one device's tracked state.
#[derive(Debug, Clone, Serialize)]
pub struct ReachabilityRecord {
    pub state: ReachabilityState,
    pub consecutive_failures: u32,
    pub last_probe_at: DateTime<Utc>,
    pub last_change_at: DateTime<Utc>,
    /// Reason from the most recent probe error, cleared by a definite result.
    pub last_error: Option<String>,
}

/// The transition function: `(state, failures) × outcome → (state, failures)`.
pub fn next_state(
    state: ReachabilityState,
    failures: u32,
    outcome: &ProbeOutcome,
    threshold: u32,
) -> (ReachabilityState, u32) {
    use ReachabilityState::*;
    match outcome {
        ProbeOutcome::Reachable => (Online, 0),
        ProbeOutcome::Error(_) => (Unknown, failures),
        ProbeOutcome::Unreachable => {
            let failures = failures.saturating_add(1);
            let state = match state {
                Online | Pending if failures < threshold => Pending,
                Online | Pending | Unknown | Offline => Offline,
            };
            (state, failures)
        }
    }
}

pub struct ReachabilityMonitor {
    records: DashMap<DeviceId, ReachabilityRecord>,
    probe: Arc<dyn ReachabilityProbe>,
    threshold: u32,
}

impl ReachabilityMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self::with_threshold(probe, DEFAULT_OFFLINE_THRESHOLD)
    }

    pub fn with_threshold(probe: Arc<dyn ReachabilityProbe>, threshold: u32) -> Self {
        Self {
            records: DashMap::new(),
            probe,
            threshold: threshold.max(1),
        }
    }

    /// Fold one probe outcome into the device's record and return the result.
    pub fn observe(&self, device: &DeviceId, outcome: &ProbeOutcome) -> ReachabilityRecord {
        let now = Utc::now();
        let mut entry = self
            .records
            .entry(device.clone())
            .or_insert_with(|| ReachabilityRecord {
                state: ReachabilityState::Unknown,
                consecutive_failures: 0,
                last_probe_at: now,
                last_change_at: now,
                last_error: None,
            });

        let previous = entry.state;
        let (state, failures) =
            next_state(previous, entry.consecutive_failures, outcome, self.threshold);
        entry.state = state;
        entry.consecutive_failures = failures;
        entry.last_probe_at = now;
        entry.last_error = match outcome {
            ProbeOutcome::Error(reason) => Some(reason.clone()),
            _ => None,
        };
        if state != previous {
            entry.last_change_at = now;
            info!(device_id = %device, from = %previous, to = %state, failures, "reachability changed");
        } else {
            debug!(device_id = %device, state = %state, failures, "reachability unchanged");
        }
        entry.value().clone()
    }

    /// Probe `address` and record the outcome. Without an address the
    /// state cannot be determined.
    pub async fn check(&self, device: &DeviceId, address: Option<&str>) -> ReachabilityState {
        let outcome = match address {
            Some(addr) => self.probe.probe(addr).await,
            None => ProbeOutcome::Error("device has no address".into()),
        };
        self.observe(device, &outcome).state
    }

    /// Probe every device concurrently.
    pub async fn sweep(&self, devices: &[Device]) -> Vec<(DeviceId, ReachabilityState)> {
        let mut set = JoinSet::new();
        for device in devices {
            let probe = Arc::clone(&self.probe);
            let id = device.id.clone();
            let target = device.probe_target();
            set.spawn(async move {
                let outcome = match target {
                    Some(addr) => probe.probe(&addr).await,
                    None => ProbeOutcome::Error("device has no address".into()),
                };
                (id, outcome)
            });
        }

        let mut states = Vec::with_capacity(devices.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    let state = self.observe(&id, &outcome).state;
                    states.push((id, state));
                }
                Err(e) => debug!(error = %e, "probe task did not complete"),
            }
        }
        states
    }

    pub fn state(&self, device: &DeviceId) -> ReachabilityState {
        self.records
            .get(device)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    pub fn record(&self, device: &DeviceId) -> Option<ReachabilityRecord> {
        self.records.get(device).map(|r| r.value().clone())
    }

    pub fn snapshot(&self) -> Vec<(DeviceId, ReachabilityRecord)> {
        self.records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Drop tracking for a deleted device.
    pub fn forget(&self, device: &DeviceId) {
        self.records.remove(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use ReachabilityState::*;

    /// Replays a fixed script of outcomes.
    struct Scripted(Mutex<Vec<ProbeOutcome>>);

    #[async_trait]
    impl ReachabilityProbe for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn probe(&self, _address: &str) -> ProbeOutcome {
            self.0.lock().unwrap().remove(0)
        }
    }

    fn monitor(script: Vec<ProbeOutcome>) -> ReachabilityMonitor {
        ReachabilityMonitor::new(Arc::new(Scripted(Mutex::new(script))))
    }

    #[test]
    fn online_device_debounces_three_failures() {
        let m = monitor(vec![]);
        let id = DeviceId::from("d1");
        m.observe(&id, &ProbeOutcome::Reachable);

        let r = m.observe(&id, &ProbeOutcome::Unreachable);
        assert_eq!((r.state, r.consecutive_failures), (Pending, 1));
        let r = m.observe(&id, &ProbeOutcome::Unreachable);
        assert_eq!((r.state, r.consecutive_failures), (Pending, 2));
        let r = m.observe(&id, &ProbeOutcome::Unreachable);
        assert_eq!((r.state, r.consecutive_failures), (Offline, 3));
        let r = m.observe(&id, &ProbeOutcome::Unreachable);
        assert_eq!((r.state, r.consecutive_failures), (Offline, 4));
    }

    #[test]
    fn single_success_resets_from_any_state() {
        let m = monitor(vec![]);
        let id = DeviceId::from("d1");
        m.observe(&id, &ProbeOutcome::Reachable);
        m.observe(&id, &ProbeOutcome::Unreachable);
        m.observe(&id, &ProbeOutcome::Unreachable);
        let r = m.observe(&id, &ProbeOutcome::Reachable);
        assert_eq!((r.state, r.consecutive_failures), (Online, 0));

        // Recovery from offline is equally immediate.
        for _ in 0..5 {
            m.observe(&id, &ProbeOutcome::Unreachable);
        }
        assert_eq!(m.state(&id), Offline);
        assert_eq!(m.observe(&id, &ProbeOutcome::Reachable).state, Online);
    }

    #[test]
    fn unknown_goes_offline_on_first_failure() {
        let m = monitor(vec![]);
        let id = DeviceId::from("fresh");
        assert_eq!(m.state(&id), Unknown);
        let r = m.observe(&id, &ProbeOutcome::Unreachable);
        assert_eq!((r.state, r.consecutive_failures), (Offline, 1));
    }

    #[test]
    fn probe_error_is_unknown_not_offline() {
        let m = monitor(vec![]);
        let id = DeviceId::from("d1");
        m.observe(&id, &ProbeOutcome::Reachable);
        m.observe(&id, &ProbeOutcome::Unreachable);
        let r = m.observe(&id, &ProbeOutcome::Error("no route".into()));
        assert_eq!((r.state, r.consecutive_failures), (Unknown, 1));
        assert_eq!(r.last_error.as_deref(), Some("no route"));

        // From unknown there is no grace period.
        assert_eq!(m.observe(&id, &ProbeOutcome::Unreachable).state, Offline);
    }

    #[test]
    fn transition_table_matches_threshold() {
        assert_eq!(next_state(Online, 0, &ProbeOutcome::Unreachable, 1), (Offline, 1));
        assert_eq!(next_state(Pending, 4, &ProbeOutcome::Unreachable, 5), (Offline, 5));
        assert_eq!(next_state(Offline, 7, &ProbeOutcome::Reachable, 3), (Online, 0));
    }

    #[tokio::test]
    async fn check_probes_and_records() {
        let m = monitor(vec![ProbeOutcome::Reachable, ProbeOutcome::Unreachable]);
        let id = DeviceId::from("d1");
        assert_eq!(m.check(&id, Some("10.0.0.1")).await, Online);
        assert_eq!(m.check(&id, Some("10.0.0.1")).await, Pending);
        assert_eq!(m.check(&id, None).await, Unknown);

        m.forget(&id);
        assert!(m.record(&id).is_none());
        assert!(m.snapshot().is_empty());
    }
}
