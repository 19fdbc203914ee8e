//! Probe scheduling: one loop per target, a global concurrency cap, and
//! live reconfiguration that only restarts the loops it has to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{GlobalOptions, TargetConfig};
use crate::probe::Pinger;
use crate::state::Store;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler already running")]
    AlreadyRunning,
}

/// Floor for non-positive intervals; probing every instant helps nobody.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

struct SchedState {
    cfg: GlobalOptions,
    targets: HashMap<String, TargetConfig>,
    /// Cancellation handle per running probe loop.
    jobs: HashMap<String, CancellationToken>,
    semaphore: Arc<Semaphore>,
    run: Option<RunState>,
}

struct RunState {
    root: CancellationToken,
    tracker: TaskTracker,
}

/// Supervises the per-target probe loops.
pub struct Scheduler {
    state: Mutex<SchedState>,
    pinger: Arc<dyn Pinger>,
    store: Arc<Store>,
}

impl Scheduler {
    pub fn new(
        global: GlobalOptions,
        targets: &[TargetConfig],
        pinger: Arc<dyn Pinger>,
        store: Arc<Store>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(effective_concurrency(global.max_concurrency)));
        let target_map = targets
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();

        Self {
            state: Mutex::new(SchedState {
                cfg: global,
                targets: target_map,
                jobs: HashMap::new(),
                semaphore,
                run: None,
            }),
            pinger,
            store,
        }
    }

    /// Start probe loops for all targets and block until `cancel` fires,
    /// then drain every loop before returning.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let (root, tracker, targets) = {
            let mut state = self.state.lock();
            if state.run.is_some() {
                return Err(SchedulerError::AlreadyRunning);
            }
            let root = cancel.child_token();
            let tracker = TaskTracker::new();
            state.run = Some(RunState {
                root: root.clone(),
                tracker: tracker.clone(),
            });
            let targets: Vec<TargetConfig> = state.targets.values().cloned().collect();
            (root, tracker, targets)
        };

        for target in targets {
            self.start_target(&root, &tracker, target);
        }

        root.cancelled().await;
        tracker.close();
        tracker.wait().await;

        let mut state = self.state.lock();
        state.run = None;
        state.jobs.clear();
        Ok(())
    }

    /// Apply new global options and rewire target loops.
    ///
    /// Loops are started for new names, stopped for removed names, and
    /// restarted for names whose address changed. When the concurrency cap
    /// changed the semaphore is replaced wholesale; in-flight probes release
    /// into the abandoned one, so the transient never exceeds the prior cap.
    pub fn update_config(self: &Arc<Self>, global: GlobalOptions, targets: &[TargetConfig]) {
        let mut to_stop: Vec<CancellationToken> = Vec::new();
        let mut to_start: Vec<TargetConfig> = Vec::new();

        let run = {
            let mut state = self.state.lock();

            if effective_concurrency(global.max_concurrency)
                != effective_concurrency(state.cfg.max_concurrency)
            {
                state.semaphore =
                    Arc::new(Semaphore::new(effective_concurrency(global.max_concurrency)));
            }
            state.cfg = global;

            let updated: HashMap<String, TargetConfig> = targets
                .iter()
                .map(|t| (t.name.clone(), t.clone()))
                .collect();

            for (name, target) in &updated {
                match state.targets.get(name) {
                    None => to_start.push(target.clone()),
                    Some(existing) if existing.address != target.address => {
                        if let Some(token) = state.jobs.remove(name) {
                            to_stop.push(token);
                        }
                        to_start.push(target.clone());
                    }
                    Some(_) => {}
                }
            }

            let removed: Vec<String> = state
                .jobs
                .keys()
                .filter(|name| !updated.contains_key(*name))
                .cloned()
                .collect();
            for name in removed {
                if let Some(token) = state.jobs.remove(&name) {
                    to_stop.push(token);
                }
            }

            state.targets = updated;
            state
                .run
                .as_ref()
                .map(|run| (run.root.clone(), run.tracker.clone()))
        };

        for token in to_stop {
            token.cancel();
        }

        // Not running yet: the table is updated and run() will spawn loops.
        let Some((root, tracker)) = run else {
            return;
        };
        for target in to_start {
            self.start_target(&root, &tracker, target);
        }
    }

    fn start_target(self: &Arc<Self>, root: &CancellationToken, tracker: &TaskTracker, target: TargetConfig) {
        let token = {
            let mut state = self.state.lock();
            if state.jobs.contains_key(&target.name) {
                return;
            }
            let token = root.child_token();
            state.jobs.insert(target.name.clone(), token.clone());
            token
        };

        let scheduler = Arc::clone(self);
        tracker.spawn(async move {
            scheduler.run_target_loop(target, token).await;
        });
    }

    async fn run_target_loop(self: Arc<Self>, target: TargetConfig, cancel: CancellationToken) {
        tracing::debug!(name = %target.name, address = %target.address, "probe loop started");

        loop {
            let (interval, timeout) = self.current_timing();
            let interval = if interval.is_zero() { MIN_INTERVAL } else { interval };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let semaphore = self.current_semaphore();
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                acquired = semaphore.acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    // Semaphore replaced and the old one closed; retry with
                    // the current one next tick.
                    Err(_) => continue,
                },
            };

            let probe_cancel = cancel.child_token();
            let result = self.pinger.ping(&target.address, timeout, &probe_cancel).await;
            drop(permit);

            if let Err(kind) = &result {
                tracing::debug!(name = %target.name, error = %kind, "probe failed");
            }
            self.store.update(&target.name, &result);
        }

        tracing::debug!(name = %target.name, "probe loop stopped");
    }

    fn current_timing(&self) -> (Duration, Duration) {
        let state = self.state.lock();
        (state.cfg.interval, state.cfg.timeout)
    }

    fn current_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.state.lock().semaphore)
    }
}

fn effective_concurrency(value: usize) -> usize {
    value.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeError, ProbeResult};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stub that records concurrency and the addresses it was asked to probe.
    struct TrackingPinger {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        addresses: PlMutex<Vec<String>>,
    }

    impl TrackingPinger {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                addresses: PlMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Pinger for TrackingPinger {
        async fn ping(&self, addr: &str, _: Duration, cancel: &CancellationToken) -> ProbeResult {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.addresses.lock().push(addr.to_string());

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ProbeError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(Duration::from_millis(5)),
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn fast_options(max_concurrency: usize) -> GlobalOptions {
        GlobalOptions {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
            max_concurrency,
            ..Default::default()
        }
    }

    fn targets(names: &[&str]) -> Vec<TargetConfig> {
        names
            .iter()
            .map(|name| TargetConfig::new(*name, format!("192.0.2.{}", name.len())))
            .collect()
    }

    async fn spawn_scheduler(
        scheduler: Arc<Scheduler>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), SchedulerError>> {
        tokio::spawn(async move { scheduler.run(cancel).await })
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_cap() {
        let names: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
        let target_list: Vec<TargetConfig> = names
            .iter()
            .map(|n| TargetConfig::new(n.clone(), "192.0.2.1"))
            .collect();

        let pinger = Arc::new(TrackingPinger::new(Duration::from_millis(50)));
        let store = Arc::new(Store::new(&target_list, Duration::from_millis(100)));
        let scheduler = Arc::new(Scheduler::new(
            fast_options(2),
            &target_list,
            pinger.clone(),
            store,
        ));

        let cancel = CancellationToken::new();
        let handle = spawn_scheduler(scheduler, cancel.clone()).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let max = pinger.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 2, "observed {max} in-flight probes with cap 2");
        assert!(max > 0, "no probes ran at all");
    }

    #[tokio::test]
    async fn results_reach_the_store() {
        let target_list = targets(&["web"]);
        let pinger = Arc::new(TrackingPinger::new(Duration::from_millis(1)));
        let store = Arc::new(Store::new(&target_list, Duration::from_millis(100)));
        let scheduler = Arc::new(Scheduler::new(
            fast_options(4),
            &target_list,
            pinger,
            store.clone(),
        ));

        let cancel = CancellationToken::new();
        let handle = spawn_scheduler(scheduler, cancel.clone()).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let target = store.get("web").unwrap();
        assert!(target.total_success > 0, "no successful probes recorded");
    }

    #[tokio::test]
    async fn refuses_to_run_twice() {
        let target_list = targets(&[]);
        let pinger = Arc::new(TrackingPinger::new(Duration::from_millis(1)));
        let store = Arc::new(Store::new(&target_list, Duration::from_millis(100)));
        let scheduler = Arc::new(Scheduler::new(
            fast_options(1),
            &target_list,
            pinger,
            store,
        ));

        let cancel = CancellationToken::new();
        let handle = spawn_scheduler(scheduler.clone(), cancel.clone()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = scheduler.run(CancellationToken::new()).await;
        assert!(matches!(second, Err(SchedulerError::AlreadyRunning)));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconfig_stops_removed_and_starts_added() {
        let initial = targets(&["a", "b"]);
        let pinger = Arc::new(TrackingPinger::new(Duration::from_millis(1)));
        let store = Arc::new(Store::new(&initial, Duration::from_millis(100)));
        let scheduler = Arc::new(Scheduler::new(
            fast_options(4),
            &initial,
            pinger.clone(),
            store.clone(),
        ));

        let cancel = CancellationToken::new();
        let handle = spawn_scheduler(scheduler.clone(), cancel.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Drop `b`, add `c`.
        let mut next = targets(&["a"]);
        next.push(TargetConfig::new("c", "198.51.100.7"));
        scheduler.update_config(fast_options(4), &next);
        store.update_targets(&next);

        tokio::time::sleep(Duration::from_millis(100)).await;

        // `c` is probed now.
        assert!(
            pinger.addresses.lock().iter().any(|a| a == "198.51.100.7"),
            "added target was never probed"
        );

        // `b` stopped: no new probes after its loop wound down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b_before = store.get("b").map(|t| t.total_success + t.total_failure);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let b_after = store.get("b").map(|t| t.total_success + t.total_failure);
        assert_eq!(b_before, b_after, "removed target kept probing");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn address_change_restarts_loop_with_new_address() {
        let initial = vec![TargetConfig::new("web", "192.0.2.1")];
        let pinger = Arc::new(TrackingPinger::new(Duration::from_millis(1)));
        let store = Arc::new(Store::new(&initial, Duration::from_millis(100)));
        let scheduler = Arc::new(Scheduler::new(
            fast_options(4),
            &initial,
            pinger.clone(),
            store,
        ));

        let cancel = CancellationToken::new();
        let handle = spawn_scheduler(scheduler.clone(), cancel.clone()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let moved = vec![TargetConfig::new("web", "203.0.113.5")];
        scheduler.update_config(fast_options(4), &moved);

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let addresses = pinger.addresses.lock();
        assert!(addresses.iter().any(|a| a == "203.0.113.5"));
        // The old address stops appearing once the restart settles.
        let last = addresses.last().unwrap();
        assert_eq!(last, "203.0.113.5");
    }

    #[tokio::test]
    async fn run_exits_on_cancellation() {
        let target_list = targets(&["a"]);
        let pinger = Arc::new(TrackingPinger::new(Duration::from_millis(200)));
        let store = Arc::new(Store::new(&target_list, Duration::from_millis(100)));
        let scheduler = Arc::new(Scheduler::new(
            fast_options(1),
            &target_list,
            pinger,
            store,
        ));

        let cancel = CancellationToken::new();
        let handle = spawn_scheduler(scheduler, cancel.clone()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        // A cancelled in-flight probe must not wedge the drain.
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler failed to drain")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn concurrency_floor_is_one() {
        assert_eq!(effective_concurrency(0), 1);
        assert_eq!(effective_concurrency(1), 1);
        assert_eq!(effective_concurrency(64), 64);
    }
}
