//! Per-run, per-test aggregated statistics.
//!
//! The [`ResultStore`] is created once per process and injected wherever it is
//! needed. Every run gets its own entry list behind its own mutex: the engine's
//! aggregator writes through that mutex and readers snapshot through it.
//! Nothing in the engine removes entries; [`run_retention_loop`] is the
//! eviction policy the daemon applies on top, and it never touches a run that
//! is still executing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::plan::{RunId, TestPlan};

/// Lifecycle of one test entry. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TestStatus {
    Created,
    Running,
    Completed,
}

/// Aggregated statistics for one test case of one run.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticalTelemetry {
    pub test_id: u16,
    pub name: String,
    pub completed: u32,
    pub remaining: u32,
    pub total: u32,
    pub success: u32,
    /// Running blend of response times in milliseconds, see [`Self::record_success`].
    pub avg_response_time: f64,
    pub status: TestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Milliseconds from creation to completion. Set only once `Completed`.
    pub elapsed_ms: Option<i64>,
}

impl StatisticalTelemetry {
    pub fn new(test_id: u16, name: impl Into<String>, total: u32, now: DateTime<Utc>) -> Self {
        Self {
            test_id,
            name: name.into(),
            completed: 0,
            remaining: total,
            total,
            success: 0,
            avg_response_time: 0.0,
            status: TestStatus::Created,
            created_at: now,
            updated_at: now,
            elapsed_ms: None,
        }
    }

    /// First sample for this test: Created -> Running. No-op afterwards.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        if self.status == TestStatus::Created {
            self.status = TestStatus::Running;
            self.updated_at = now;
        }
    }

    /// Fold one accepted response into the entry.
    ///
    /// The average is a blend rather than a mean: `avg += sample` then
    /// `avg += avg / total`.
    pub fn record_success(&mut self, elapsed_ms: f64, now: DateTime<Utc>) {
        if self.remaining == 0 {
            debug!(test_id = self.test_id, "sample for an exhausted entry ignored");
            return;
        }

        self.mark_running(now);
        self.success += 1;
        self.completed += 1;
        self.remaining -= 1;

        self.avg_response_time += elapsed_ms;
        if self.total > 0 {
            self.avg_response_time += self.avg_response_time / f64::from(self.total);
        }
        self.updated_at = now;

        if self.completed == self.total {
            self.status = TestStatus::Completed;
            self.elapsed_ms = Some((now - self.created_at).num_milliseconds());
        }
    }
}

/// Entries of one run, guarded by that run's mutex.
pub type RunEntries = Arc<Mutex<Vec<StatisticalTelemetry>>>;

/// Process-wide table: run id -> per-test statistics.
#[derive(Clone, Default)]
pub struct ResultStore {
    runs: Arc<RwLock<HashMap<RunId, RunEntries>>>,
    executing: Arc<std::sync::Mutex<HashSet<RunId>>>,
}

/// Keeps a run out of eviction until dropped.
#[must_use = "the run is only protected while the guard is alive"]
pub struct ExecutionGuard {
    store: ResultStore,
    run_id: RunId,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.store.executing_set().remove(&self.run_id);
    }
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one `Created` entry per test case with `remaining = total = numRequests`.
    pub async fn seed(&self, plan: &TestPlan) -> RunEntries {
        let now = Utc::now();
        let entries: Vec<_> = plan
            .tests
            .iter()
            .map(|t| StatisticalTelemetry::new(t.id, t.name.clone(), plan.num_requests, now))
            .collect();
        let entries = Arc::new(Mutex::new(entries));

        self.runs
            .write()
            .await
            .insert(plan.id.clone(), Arc::clone(&entries));
        entries
    }

    /// Handle to a run's entries, for writers that hold it for the run's duration.
    pub async fn entries(&self, run_id: &RunId) -> Option<RunEntries> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn snapshot(&self, run_id: &RunId) -> Option<Vec<StatisticalTelemetry>> {
        let entries = self.entries(run_id).await?;
        let guard = entries.lock().await;
        Some(guard.clone())
    }

    pub async fn entry(&self, run_id: &RunId, test_id: u16) -> Option<StatisticalTelemetry> {
        self.snapshot(run_id)
            .await?
            .into_iter()
            .find(|e| e.test_id == test_id)
    }

    pub async fn snapshot_all(&self) -> BTreeMap<RunId, Vec<StatisticalTelemetry>> {
        let handles: Vec<(RunId, RunEntries)> = self
            .runs
            .read()
            .await
            .iter()
            .map(|(id, entries)| (id.clone(), Arc::clone(entries)))
            .collect();

        let mut all = BTreeMap::new();
        for (id, entries) in handles {
            all.insert(id, entries.lock().await.clone());
        }
        all
    }

    /// Mark `run_id` as executing for as long as the returned guard lives.
    pub fn begin_execution(&self, run_id: &RunId) -> ExecutionGuard {
        self.executing_set().insert(run_id.clone());
        ExecutionGuard {
            store: self.clone(),
            run_id: run_id.clone(),
        }
    }

    pub fn is_executing(&self, run_id: &RunId) -> bool {
        self.executing_set().contains(run_id)
    }

    fn executing_set(&self) -> MutexGuard<'_, HashSet<RunId>> {
        self.executing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }

    /// Remove runs whose newest update is older than `max_idle`, skipping runs
    /// still executing. Returns how many went.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return 0;
        };

        let handles: Vec<(RunId, RunEntries)> = self
            .runs
            .read()
            .await
            .iter()
            .map(|(id, entries)| (id.clone(), Arc::clone(entries)))
            .collect();

        let mut stale = Vec::new();
        for (id, entries) in handles {
            if self.is_executing(&id) {
                continue;
            }
            let last_update = entries.lock().await.iter().map(|e| e.updated_at).max();
            if last_update.map_or(true, |t| t < cutoff) {
                stale.push(id);
            }
        }

        if stale.is_empty() {
            return 0;
        }
        let mut runs = self.runs.write().await;
        let mut evicted = 0;
        for id in &stale {
            if !self.is_executing(id) && runs.remove(id).is_some() {
                evicted += 1;
            }
        }
        evicted
    }
}

/// Periodically evict runs idle for longer than `retention`.
pub async fn run_retention_loop(store: ResultStore, retention: Duration, sweep_every: Duration) {
    info!(
        retention_secs = retention.as_secs(),
        sweep_secs = sweep_every.as_secs(),
        "Result retention sweeper started"
    );

    let mut interval = tokio::time::interval(sweep_every);
    loop {
        interval.tick().await;
        let evicted = store.evict_idle(retention).await;
        if evicted > 0 {
            info!(evicted, "Evicted idle runs from result store");
        }
    }
}
