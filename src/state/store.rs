//! Thread-safe registry of per-target status.
//!
//! One writer at a time mutates the table; readers take consistent deep
//! copies, so no caller ever observes a half-applied update.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use crate::config::TargetConfig;
use crate::probe::ProbeResult;

use super::{RttSample, Status, TargetStatus};

/// Maximum RTT samples retained per target.
pub const HISTORY_SIZE: usize = 100;
/// Consecutive failures before a target is classified DOWN.
const DOWN_THRESHOLD: u32 = 3;
/// Samples considered for the recent-average classification.
const RECENT_SAMPLE_COUNT: usize = 10;

struct Inner {
    targets: HashMap<String, TargetStatus>,
    /// Classification baseline: OK at or below a quarter of this.
    timeout: Duration,
}

/// Canonical per-target status table.
pub struct Store {
    inner: RwLock<Inner>,
}

impl Store {
    /// Create a store seeded with the given targets, all UNKNOWN.
    pub fn new(targets: &[TargetConfig], timeout: Duration) -> Self {
        let store = Self {
            inner: RwLock::new(Inner {
                targets: HashMap::new(),
                timeout,
            }),
        };
        store.update_targets(targets);
        store
    }

    /// Apply one probe result to a target, creating it if absent.
    ///
    /// A result may arrive for a name a concurrent reload is about to erase;
    /// the fresh entry created here is erased by that reload's
    /// `update_targets` call.
    pub fn update(&self, name: &str, result: &ProbeResult) {
        let mut inner = self.inner.write();
        let timeout = inner.timeout;
        let target = inner
            .targets
            .entry(name.to_string())
            .or_insert_with(|| TargetStatus::new(name, "", ""));

        let now = Utc::now();
        match result {
            Ok(rtt) => {
                target.last_rtt = *rtt;
                target.last_success_at = Some(now);
                target.consecutive_ok += 1;
                target.consecutive_ng = 0;
                target.total_success += 1;

                // Append before classifying so the freshest sample counts.
                if target.history.len() == HISTORY_SIZE {
                    target.history.pop_front();
                }
                target.history.push_back(RttSample { at: now, rtt: *rtt });

                target.status = classify_success(target, timeout);
            }
            Err(_) => {
                target.last_failure_at = Some(now);
                target.consecutive_ng += 1;
                target.consecutive_ok = 0;
                target.total_failure += 1;

                target.status = if target.consecutive_ng >= DOWN_THRESHOLD {
                    Status::Down
                } else {
                    Status::Warn
                };
            }
        }
    }

    /// Deep copy of every target's status.
    pub fn snapshot(&self) -> Vec<TargetStatus> {
        let inner = self.inner.read();
        inner.targets.values().cloned().collect()
    }

    /// Deep copy of a single target's status.
    pub fn get(&self, name: &str) -> Option<TargetStatus> {
        let inner = self.inner.read();
        inner.targets.get(name).cloned()
    }

    /// Merge a new target set: surviving names keep all measured state and
    /// take the new Address/Group; new names start fresh; absent names are
    /// deleted.
    pub fn update_targets(&self, targets: &[TargetConfig]) {
        let mut inner = self.inner.write();

        let mut updated = HashMap::with_capacity(targets.len());
        for cfg in targets {
            let entry = match inner.targets.remove(&cfg.name) {
                Some(mut existing) => {
                    existing.address = cfg.address.clone();
                    existing.group = cfg.group.clone();
                    existing
                }
                None => TargetStatus::new(&cfg.name, &cfg.address, &cfg.group),
            };
            updated.insert(cfg.name.clone(), entry);
        }

        inner.targets = updated;
    }

    /// Swap the classification timeout; later classifications use it.
    pub fn update_timeout(&self, timeout: Duration) {
        self.inner.write().timeout = timeout;
    }
}

/// Classify a target whose latest probe succeeded.
///
/// OK at or below a quarter of the timeout, WARN above; DOWN is reserved
/// for failures. The recent average is the mean of the last
/// `RECENT_SAMPLE_COUNT` samples, falling back to `last_rtt` when the
/// history is empty.
fn classify_success(target: &TargetStatus, timeout: Duration) -> Status {
    let recent = recent_average(target);
    let avg = if recent.is_zero() { target.last_rtt } else { recent };
    if avg <= timeout / 4 {
        Status::Ok
    } else {
        Status::Warn
    }
}

fn recent_average(target: &TargetStatus) -> Duration {
    let len = target.history.len();
    if len == 0 {
        return Duration::ZERO;
    }
    let count = len.min(RECENT_SAMPLE_COUNT);
    let sum: Duration = target.history.iter().skip(len - count).map(|p| p.rtt).sum();
    sum / count as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;

    fn one_target(timeout_ms: u64) -> Store {
        Store::new(
            &[TargetConfig::new("web", "192.0.2.1")],
            Duration::from_millis(timeout_ms),
        )
    }

    fn ok(ms: u64) -> ProbeResult {
        Ok(Duration::from_millis(ms))
    }

    fn network_failure() -> ProbeResult {
        Err(ProbeError::Network("unreachable".into()))
    }

    #[test]
    fn ten_fast_successes_classify_ok() {
        let store = one_target(100);
        for _ in 0..10 {
            store.update("web", &ok(20));
        }

        let target = store.get("web").unwrap();
        assert_eq!(target.status, Status::Ok);
        assert_eq!(target.last_rtt, Duration::from_millis(20));
        assert_eq!(target.total_success, 10);
        assert_eq!(target.consecutive_ok, 10);
        assert_eq!(target.consecutive_ng, 0);
        assert_eq!(target.history.len(), 10);
        assert_eq!(target.average_rtt(), Duration::from_millis(20));
    }

    #[test]
    fn borderline_rtt_classifies_warn() {
        // 26ms > 100ms/4, so ten of them land in WARN.
        let store = one_target(100);
        for _ in 0..10 {
            store.update("web", &ok(26));
        }
        assert_eq!(store.get("web").unwrap().status, Status::Warn);
    }

    #[test]
    fn exactly_quarter_timeout_is_ok() {
        let store = one_target(100);
        store.update("web", &ok(25));
        assert_eq!(store.get("web").unwrap().status, Status::Ok);
    }

    #[test]
    fn recent_average_uses_last_ten_samples() {
        let store = one_target(100);
        // Eleven slow samples, then ten fast ones; the slow tail must have
        // aged out of the ten-sample window.
        for _ in 0..11 {
            store.update("web", &ok(90));
        }
        for _ in 0..10 {
            store.update("web", &ok(10));
        }
        assert_eq!(store.get("web").unwrap().status, Status::Ok);
    }

    #[test]
    fn three_failures_classify_down() {
        let store = one_target(100);

        store.update("web", &network_failure());
        assert_eq!(store.get("web").unwrap().status, Status::Warn);
        store.update("web", &network_failure());
        assert_eq!(store.get("web").unwrap().status, Status::Warn);
        store.update("web", &network_failure());

        let target = store.get("web").unwrap();
        assert_eq!(target.status, Status::Down);
        assert_eq!(target.consecutive_ng, 3);
        assert_eq!(target.total_failure, 3);
        assert!(target.history.is_empty(), "failures never enter history");

        // Recovery: one fast success returns to OK and resets the counter.
        store.update("web", &ok(10));
        let target = store.get("web").unwrap();
        assert_eq!(target.status, Status::Ok);
        assert_eq!(target.consecutive_ng, 0);
        assert_eq!(target.consecutive_ok, 1);
    }

    #[test]
    fn consecutive_counters_are_mutually_exclusive() {
        let store = one_target(100);
        for step in 0..20 {
            if step % 3 == 0 {
                store.update("web", &network_failure());
            } else {
                store.update("web", &ok(5));
            }
            let target = store.get("web").unwrap();
            assert!(
                target.consecutive_ok == 0 || target.consecutive_ng == 0,
                "both counters non-zero at step {step}"
            );
        }
    }

    #[test]
    fn history_is_bounded() {
        let store = one_target(1000);
        for i in 0..(HISTORY_SIZE as u64 + 50) {
            store.update("web", &ok(i % 40 + 1));
        }
        let target = store.get("web").unwrap();
        assert_eq!(target.history.len(), HISTORY_SIZE);
        assert_eq!(target.total_success, HISTORY_SIZE as u64 + 50);
        // Oldest samples were evicted: the first retained one is sample 51.
        assert_eq!(target.history.front().unwrap().rtt, Duration::from_millis(50 % 40 + 1));
    }

    #[test]
    fn snapshot_is_an_independent_copy() {
        let store = one_target(100);
        store.update("web", &ok(10));

        let mut snapshot = store.snapshot();
        snapshot[0].history.clear();
        snapshot[0].total_success = 999;

        let target = store.get("web").unwrap();
        assert_eq!(target.history.len(), 1);
        assert_eq!(target.total_success, 1);
    }

    #[test]
    fn merge_preserves_surviving_state() {
        let store = Store::new(
            &[
                TargetConfig::new("a", "192.0.2.1"),
                TargetConfig::new("b", "192.0.2.2"),
                TargetConfig::new("c", "192.0.2.3"),
            ],
            Duration::from_millis(100),
        );
        for name in ["a", "b", "c"] {
            for _ in 0..5 {
                store.update(name, &ok(10));
            }
        }

        let before_a = store.get("a").unwrap();

        let mut renamed = TargetConfig::new("a", "198.51.100.1");
        renamed.group = "moved".to_string();
        store.update_targets(&[
            renamed,
            TargetConfig::new("c", "192.0.2.3"),
            TargetConfig::new("d", "192.0.2.4"),
        ]);

        let names: Vec<String> = {
            let mut v: Vec<String> = store.snapshot().into_iter().map(|t| t.name).collect();
            v.sort();
            v
        };
        assert_eq!(names, ["a", "c", "d"]);

        let after_a = store.get("a").unwrap();
        assert_eq!(after_a.address, "198.51.100.1");
        assert_eq!(after_a.group, "moved");
        assert_eq!(after_a.history, before_a.history);
        assert_eq!(after_a.total_success, before_a.total_success);
        assert_eq!(after_a.last_success_at, before_a.last_success_at);
        assert_eq!(after_a.status, before_a.status);

        assert!(store.get("b").is_none());

        let d = store.get("d").unwrap();
        assert_eq!(d.status, Status::Unknown);
        assert!(d.history.is_empty());
        assert_eq!(d.total_success, 0);
        assert_eq!(d.total_failure, 0);
    }

    #[test]
    fn update_creates_missing_target() {
        let store = Store::new(&[], Duration::from_millis(100));
        store.update("ghost", &ok(10));
        let target = store.get("ghost").unwrap();
        assert_eq!(target.status, Status::Ok);
        assert_eq!(target.total_success, 1);
    }

    #[test]
    fn timeout_swap_changes_classification() {
        let store = one_target(100);
        store.update("web", &ok(20));
        assert_eq!(store.get("web").unwrap().status, Status::Ok);

        // With a 40ms timeout the 20ms average now exceeds the quarter.
        store.update_timeout(Duration::from_millis(40));
        store.update("web", &ok(20));
        assert_eq!(store.get("web").unwrap().status, Status::Warn);
    }

    #[test]
    fn totals_are_monotonic() {
        let store = one_target(100);
        let mut last = (0u64, 0u64);
        for step in 0..30 {
            if step % 4 == 0 {
                store.update("web", &network_failure());
            } else {
                store.update("web", &ok(5));
            }
            let target = store.get("web").unwrap();
            assert!(target.total_success >= last.0);
            assert!(target.total_failure >= last.1);
            last = (target.total_success, target.total_failure);
        }
    }
}
