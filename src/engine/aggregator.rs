//! Single consumer that folds a chunk's samples into the result store.

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::worker::{AggregatorMessage, Sample};
use crate::plan::RunId;
use crate::results::RunEntries;

/// What one chunk's aggregator saw before it was told to stop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    pub successes: u32,
    pub errors: u32,
}

pub(crate) struct Aggregator {
    run_id: RunId,
    entries: RunEntries,
    stats: ChunkStats,
}

impl Aggregator {
    pub fn new(run_id: RunId, entries: RunEntries) -> Self {
        Self {
            run_id,
            entries,
            stats: ChunkStats::default(),
        }
    }

    /// Consume messages until `Stop` (or until every sender is gone).
    ///
    /// Samples queued ahead of `Stop` are always applied first; the returned
    /// stats are the shutdown acknowledgement.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AggregatorMessage>) -> ChunkStats {
        while let Some(message) = rx.recv().await {
            match message {
                AggregatorMessage::Success(sample) => self.on_success(sample).await,
                AggregatorMessage::Error(sample) => self.on_error(sample).await,
                AggregatorMessage::Stop => {
                    debug!(run_id = %self.run_id, "Aggregator stopping");
                    break;
                }
            }
        }
        self.stats
    }

    async fn on_success(&mut self, sample: Sample) {
        self.stats.successes += 1;
        let now = Utc::now();

        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| e.test_id == sample.test_id) {
            Some(entry) => entry.record_success(sample.elapsed_ms(), now),
            None => warn!(run_id = %self.run_id, test_id = sample.test_id, "Sample for unknown test"),
        }
    }

    /// Error samples only advance the status machine; counters are left alone.
    async fn on_error(&mut self, sample: Sample) {
        self.stats.errors += 1;
        debug!(
            run_id = %self.run_id,
            test_id = sample.test_id,
            status = ?sample.status,
            elapsed_ms = sample.elapsed_ms(),
            "Error sample not merged"
        );

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.test_id == sample.test_id) {
            entry.mark_running(Utc::now());
        }
    }
}
