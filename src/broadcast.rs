//! Fan-out of finished runs to in-process subscribers.
//!
//! Consumes the engine's completion channel, snapshots the run from the result
//! store and republishes it on a broadcast channel.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::plan::RunId;
use crate::results::{ResultStore, StatisticalTelemetry};

/// A finished run as published to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub entries: Vec<StatisticalTelemetry>,
}

#[derive(Clone)]
pub struct Broadcaster {
    store: ResultStore,
    tx: broadcast::Sender<RunReport>,
}

impl Broadcaster {
    pub fn new(store: ResultStore, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { store, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunReport> {
        self.tx.subscribe()
    }

    /// Drain completions until every notifier has been dropped.
    pub async fn run(self, mut completions: mpsc::Receiver<RunId>) {
        while let Some(run_id) = completions.recv().await {
            self.publish(run_id).await;
        }
        debug!("Completion channel closed; broadcaster exiting");
    }

    async fn publish(&self, run_id: RunId) {
        let Some(entries) = self.store.snapshot(&run_id).await else {
            warn!(run_id = %run_id, "Completed run missing from result store");
            return;
        };

        let success: u64 = entries.iter().map(|e| u64::from(e.success)).sum();
        let completed: u64 = entries.iter().map(|e| u64::from(e.completed)).sum();
        info!(run_id = %run_id, tests = entries.len(), completed, success, "Run completed");

        if self.tx.send(RunReport { run_id, entries }).is_err() {
            debug!("No run subscribers");
        }
    }
}
