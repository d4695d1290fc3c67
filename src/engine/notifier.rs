//! Completion signal from the engine to whoever broadcasts results.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::plan::RunId;

/// Posts a run id once that run has finished executing.
///
/// The channel holds a single slot, so `notify` waits until the consumer has
/// taken the previous id. Delivery is at-most-once: if the consumer is gone the
/// id is dropped.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    tx: mpsc::Sender<RunId>,
}

/// Create a notifier and the receiving end for the broadcaster.
pub fn channel() -> (CompletionNotifier, mpsc::Receiver<RunId>) {
    let (tx, rx) = mpsc::channel(1);
    (CompletionNotifier { tx }, rx)
}

impl CompletionNotifier {
    pub async fn notify(&self, run_id: RunId) {
        debug!(run_id = %run_id, "Posting run completion");
        if let Err(mpsc::error::SendError(run_id)) = self.tx.send(run_id).await {
            warn!(run_id = %run_id, "No completion listener; notification dropped");
        }
    }
}
