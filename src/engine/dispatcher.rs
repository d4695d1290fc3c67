//! Chunked execution loop.
//!
//! A run is split into `num_requests / max_concurrency` chunks (any remainder
//! below one full chunk is not executed). Each chunk:
//!
//! 1. starts one aggregator and one collector that turns the chunk's
//!    completion signal into the aggregator's `Stop`,
//! 2. claims `max_concurrency` slots from the scheduler and spawns a worker
//!    for each,
//! 3. waits for every worker, signals completion, then waits for the
//!    aggregator to acknowledge,
//! 4. rests before the next chunk.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::aggregator::{Aggregator, ChunkStats};
use super::scheduler::RoundRobin;
use super::worker::{self, AggregatorMessage, WorkerContext};
use crate::plan::RunId;
use crate::results::RunEntries;

/// Number of full chunks a run executes.
pub fn chunk_count(num_requests: u32, max_concurrency: usize) -> u32 {
    if max_concurrency == 0 {
        return 0;
    }
    let per_chunk = u32::try_from(max_concurrency).unwrap_or(u32::MAX);
    num_requests / per_chunk
}

/// Totals over every chunk of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub chunks_planned: u32,
    pub chunks_run: u32,
    pub dispatched: u64,
    pub successes: u64,
    pub errors: u64,
    pub cancelled: bool,
}

pub(crate) struct Dispatcher {
    pub run_id: RunId,
    pub scheduler: Arc<RoundRobin>,
    pub worker: Arc<WorkerContext>,
    pub entries: RunEntries,
    pub max_concurrency: usize,
    pub rest: Duration,
    pub cancel: CancellationToken,
}

impl Dispatcher {
    pub async fn run(&self, num_requests: u32) -> DispatchOutcome {
        let chunks = chunk_count(num_requests, self.max_concurrency);
        let mut outcome = DispatchOutcome {
            chunks_planned: chunks,
            ..Default::default()
        };

        for chunk in 0..chunks {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            debug!(run_id = %self.run_id, chunk = chunk + 1, of = chunks, "Starting chunk");
            let stats = self.run_chunk().await;
            outcome.chunks_run += 1;
            outcome.dispatched += self.max_concurrency as u64;
            outcome.successes += u64::from(stats.successes);
            outcome.errors += u64::from(stats.errors);
            debug!(
                run_id = %self.run_id,
                chunk = chunk + 1,
                successes = stats.successes,
                errors = stats.errors,
                "Chunk finished"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if chunk + 1 < chunks {
                        outcome.cancelled = true;
                    }
                    break;
                }
                _ = tokio::time::sleep(self.rest) => {}
            }
        }

        outcome
    }

    async fn run_chunk(&self) -> ChunkStats {
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (complete_tx, complete_rx) = oneshot::channel::<()>();

        let aggregator = tokio::spawn(
            Aggregator::new(self.run_id.clone(), Arc::clone(&self.entries)).run(sample_rx),
        );

        let stop_tx = sample_tx.clone();
        let collector = tokio::spawn(async move {
            if complete_rx.await.is_ok() {
                let _ = stop_tx.send(AggregatorMessage::Stop);
            }
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.max_concurrency {
            // Requeued at claim time rather than after the probe returns, so
            // dispatch order within a chunk is exactly cyclic.
            let test = self.scheduler.next().await;
            self.scheduler.release(Arc::clone(&test));
            workers.spawn(worker::run(
                Arc::clone(&self.worker),
                test,
                sample_tx.clone(),
            ));
        }
        drop(sample_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(run_id = %self.run_id, error = %e, "Worker task failed");
            }
        }

        let _ = complete_tx.send(());
        if let Err(e) = collector.await {
            error!(run_id = %self.run_id, error = %e, "Response collector failed");
        }

        match aggregator.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "Aggregator task failed");
                ChunkStats::default()
            }
        }
    }
}
