//! Scheduler module for running sweeps and persisting their outcomes.

use crate::activity::ActivityLog;
use crate::db::{HealthStatus, ProbeOutcome, Store};
use crate::error::MonitorError;
use crate::planner::plan_sweep;
use crate::probe::{ProbeError, ProbeExecutor, SharedRng};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Counts reported after a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepSummary {
    pub planned: usize,
    pub probed: usize,
    pub online: usize,
    pub degraded: usize,
    pub offline: usize,
    pub cancelled: bool,
}

impl SweepSummary {
    fn record(&mut self, status: HealthStatus) {
        self.probed += 1;
        match status {
            HealthStatus::Online => self.online += 1,
            HealthStatus::Degraded => self.degraded += 1,
            HealthStatus::Offline | HealthStatus::Unknown => self.offline += 1,
        }
    }
}

/// Runs planned sweeps over a bounded worker pool and single checks.
pub struct SweepOrchestrator {
    store: Arc<Store>,
    executor: Arc<ProbeExecutor>,
    activity: Arc<ActivityLog>,
    max_concurrency: usize,
    rng: SharedRng,
}

impl SweepOrchestrator {
    pub fn new(
        store: Arc<Store>,
        executor: Arc<ProbeExecutor>,
        activity: Arc<ActivityLog>,
        max_concurrency: usize,
        rng: SharedRng,
    ) -> Self {
        Self {
            store,
            executor,
            activity,
            max_concurrency: max_concurrency.max(1),
            rng,
        }
    }

    /// Plan and run one sweep, then persist every outcome in one batch.
    ///
    /// Cancellation stops pending probes; whatever finished is still saved.
    pub async fn check_all(&self, cancel: &CancellationToken) -> Result<SweepSummary, MonitorError> {
        let snapshot = self.store.load_all()?;
        let plan = {
            let mut rng = self.rng.lock();
            plan_sweep(&snapshot, &mut *rng)
        };

        if plan.is_empty() {
            self.activity.append("Sweep skipped: no targets to check");
            return Ok(SweepSummary::default());
        }

        self.activity.append(format!(
            "Sweep started: {} targets, {} workers",
            plan.len(),
            self.max_concurrency
        ));

        let planned = plan.len();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let (tx, mut rx) = mpsc::channel::<ProbeOutcome>(planned);
        let mut workers = JoinSet::new();

        for target in plan {
            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                };

                match executor.probe(&target, &cancel).await {
                    Ok(outcome) => {
                        if tx.send(outcome).await.is_err() {
                            tracing::error!("Failed to hand off outcome for target {}", target.id);
                        }
                    }
                    Err(ProbeError::Cancelled) => {
                        tracing::debug!("Probe of target {} cancelled", target.id);
                    }
                    Err(e) => tracing::warn!("Probe of target {} failed: {}", target.id, e),
                }
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(planned);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Probe worker died: {}", e);
            }
        }

        self.persist(&outcomes)?;

        let mut summary = SweepSummary {
            planned,
            cancelled: cancel.is_cancelled(),
            ..Default::default()
        };
        for outcome in &outcomes {
            summary.record(outcome.status);
        }

        self.activity.append(format!(
            "Sweep {}: {} of {} checked, {} online, {} degraded, {} offline",
            if summary.cancelled { "cancelled" } else { "finished" },
            summary.probed,
            summary.planned,
            summary.online,
            summary.degraded,
            summary.offline
        ));
        Ok(summary)
    }

    /// Probe exactly one target, skipping planning. `None` if the id is unknown.
    pub async fn check_one(
        &self,
        id: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<ProbeOutcome>, MonitorError> {
        let Some(target) = self.store.get_target(id)? else {
            return Ok(None);
        };

        let name = target.display_name().to_string();
        self.activity.append(format!("Checking {}", name));

        let outcome = match self.executor.probe(&target, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.activity.append(format!("Check of {} aborted: {}", name, e));
                return Err(MonitorError::Transport(e.to_string()));
            }
        };

        if self.persist(std::slice::from_ref(&outcome))? == 0 {
            tracing::info!("Target {} vanished during its check", id);
        }

        self.activity.append(format!(
            "{}: {} ({}/{} reachable)",
            name, outcome.status, outcome.reachable_count, outcome.total_attempts
        ));
        Ok(Some(outcome))
    }

    /// Write the outcomes' health fields back in one batch. Targets deleted
    /// in the meantime are skipped.
    fn persist(&self, outcomes: &[ProbeOutcome]) -> Result<usize, MonitorError> {
        Ok(self.store.save_outcomes(outcomes)?)
    }
}

/// Runs [`SweepOrchestrator::check_all`] on a fixed period.
pub struct SweepScheduler {
    orchestrator: Arc<SweepOrchestrator>,
    period: Duration,
}

impl SweepScheduler {
    pub fn new(orchestrator: Arc<SweepOrchestrator>, period: Duration) -> Self {
        Self {
            orchestrator,
            period,
        }
    }

    /// Spawn the sweep loop. Returns `None` when the period is zero.
    pub fn start(self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.period.is_zero() {
            tracing::info!("Periodic sweeps disabled");
            return None;
        }
        Some(tokio::spawn(self.run(cancel)))
    }

    async fn run(self, cancel: CancellationToken) {
        tracing::info!("Sweeping every {:?}", self.period);

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.orchestrator.check_all(&cancel).await {
                        Ok(summary) => tracing::debug!("Sweep done: {:?}", summary),
                        Err(e) => tracing::error!("Sweep failed: {}", e),
                    }
                }
            }
        }

        tracing::info!("Sweep scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MonitorTarget;
    use crate::probe::{seeded_rng, ProbeRequest, ProbeResponse, ProbeSettings, Transport};
    use crate::registry::Registry;
    use crate::seed::SeedTarget;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always answers with the same response after a delay, tracking how
    /// many requests are open at once.
    struct FakeTransport {
        status: u16,
        body: &'static str,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(status: u16, body: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, _request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ProbeResponse {
                status: self.status,
                latency: Duration::from_millis(80),
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    fn orchestrator(
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        cap: usize,
    ) -> (SweepOrchestrator, Arc<ActivityLog>) {
        let executor = Arc::new(ProbeExecutor::new(transport, ProbeSettings::default(), seeded_rng(3)));
        let activity = Arc::new(ActivityLog::default());
        let orch = SweepOrchestrator::new(store, executor, activity.clone(), cap, seeded_rng(4));
        (orch, activity)
    }

    fn insert(store: &Store, names: &[&str]) -> Vec<i64> {
        let mut targets: Vec<MonitorTarget> = names
            .iter()
            .map(|name| MonitorTarget {
                name: name.to_string(),
                canonical_name: name.to_string(),
                url: format!("http://{}.onion", name.to_lowercase()),
                ..Default::default()
            })
            .collect();
        store.save_changes(&mut targets).unwrap();
        targets.iter().map(|t| t.id).collect()
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        insert(
            &store,
            &[
                "Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot", "Golf", "Hotel", "India",
                "Juliett", "Kilo", "Lima",
            ],
        );
        let transport = FakeTransport::new(200, "ok", Duration::from_millis(20));
        let (orch, _) = orchestrator(store.clone(), transport.clone(), 3);

        let summary = orch.check_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.planned, 12);
        assert_eq!(summary.online, 12);
        assert!(!summary.cancelled);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 36);
        let max = transport.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "saw {} probes at once", max);
        assert!(max > 1);
    }

    #[tokio::test]
    async fn test_seeded_family_comes_online() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Registry::new(
            store.clone(),
            vec![
                SeedTarget::new("Dark Matter", "http://darkmatterprimary.onion", "Markets"),
                SeedTarget::new("DarkMatter (mirror 1)", "http://darkmattermirror.onion", "Markets"),
            ],
        );
        registry.ensure_seed_data().unwrap();

        let transport = FakeTransport::new(200, "<html>welcome</html>", Duration::ZERO);
        let (orch, activity) = orchestrator(store.clone(), transport, 5);
        let summary = orch.check_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.planned, 2);

        let targets = store.load_all().unwrap();
        assert_eq!(targets.len(), 2);
        for target in &targets {
            assert_eq!(target.status, HealthStatus::Online, "{}", target.name);
            assert_eq!(target.reachable_attempts, 3);
            assert_eq!(target.total_attempts, 3);
            assert!(target.last_checked_at.is_some());
        }

        let messages: Vec<String> = activity.entries().into_iter().map(|e| e.message).collect();
        assert!(messages.iter().any(|m| m.starts_with("Sweep started: 2 targets")));
        assert!(messages.iter().any(|m| m.contains("2 online")));
    }

    #[tokio::test]
    async fn test_challenge_page_sweeps_to_degraded() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        insert(&store, &["Guarded"]);
        let transport = FakeTransport::new(503, "Attention Required! | Cloudflare", Duration::ZERO);
        let (orch, _) = orchestrator(store.clone(), transport, 5);

        let summary = orch.check_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.degraded, 1);

        let target = &store.load_all().unwrap()[0];
        assert_eq!(target.status, HealthStatus::Degraded);
        assert_eq!(target.reachable_attempts, 0);
        assert!(target.average_latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_empty_store_skips_sweep() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = FakeTransport::new(200, "ok", Duration::ZERO);
        let (orch, activity) = orchestrator(store, transport.clone(), 5);

        let summary = orch.check_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary, SweepSummary::default());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(activity.entries()[0].message.contains("no targets"));
    }

    #[tokio::test]
    async fn test_check_one() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ids = insert(&store, &["Alpha", "Bravo"]);
        let transport = FakeTransport::new(200, "ok", Duration::ZERO);
        let (orch, activity) = orchestrator(store.clone(), transport.clone(), 5);

        assert!(orch.check_one(9999, &CancellationToken::new()).await.unwrap().is_none());

        let outcome = orch
            .check_one(ids[1], &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, HealthStatus::Online);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let stored = store.get_target(ids[1]).unwrap().unwrap();
        assert_eq!(stored.status, HealthStatus::Online);
        let untouched = store.get_target(ids[0]).unwrap().unwrap();
        assert_eq!(untouched.status, HealthStatus::Unknown);

        let messages: Vec<String> = activity.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["Checking Bravo", "Bravo: online (3/3 reachable)"]);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_persists_nothing_unfinished() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        insert(&store, &["Alpha", "Bravo", "Charlie"]);
        let transport = FakeTransport::new(200, "ok", Duration::from_secs(30));
        let (orch, activity) = orchestrator(store.clone(), transport, 2);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = orch.check_all(&cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.planned, 3);
        assert_eq!(summary.probed, 0);
        for target in store.load_all().unwrap() {
            assert_eq!(target.status, HealthStatus::Unknown);
            assert!(target.last_checked_at.is_none());
        }
        assert!(activity.entries().last().unwrap().message.starts_with("Sweep cancelled"));
    }

    #[tokio::test]
    async fn test_scheduler_runs_until_cancelled() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        insert(&store, &["Alpha"]);
        let transport = FakeTransport::new(200, "ok", Duration::ZERO);
        let (orch, _) = orchestrator(store.clone(), transport, 1);
        let orch = Arc::new(orch);

        assert!(SweepScheduler::new(orch.clone(), Duration::ZERO)
            .start(CancellationToken::new())
            .is_none());

        let cancel = CancellationToken::new();
        let handle = SweepScheduler::new(orch, Duration::from_millis(20))
            .start(cancel.clone())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();

        let target = &store.load_all().unwrap()[0];
        assert_eq!(target.status, HealthStatus::Online);
    }
}
