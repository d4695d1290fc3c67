//! One unit of execution: issue a probe for a test case and report the sample.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::plan::TestCase;
use crate::probes::http::{ProbeRequest, ProbeResponse, Transport};
use crate::probes::ProbeError;

/// Timing/outcome of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub test_id: u16,
    pub elapsed: Duration,
    /// Status code returned, if the request got that far.
    pub status: Option<u16>,
}

impl Sample {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Everything the aggregator of a chunk can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorMessage {
    Success(Sample),
    Error(Sample),
    Stop,
}

/// Per-run state shared by every worker.
pub(crate) struct WorkerContext {
    pub host: String,
    pub port: u16,
    pub transport: Arc<dyn Transport>,
    pub in_flight: Arc<AtomicUsize>,
}

/// Probe `test` once and send the classified sample. Never fails: a transport
/// error or a rejected status becomes an error sample.
pub(crate) async fn run(
    ctx: Arc<WorkerContext>,
    test: Arc<TestCase>,
    samples: mpsc::UnboundedSender<AggregatorMessage>,
) {
    let request = ProbeRequest::for_test(&ctx.host, ctx.port, &test);

    ctx.in_flight.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();
    let result = ctx.transport.issue(&request).await;
    let elapsed = start.elapsed();
    ctx.in_flight.fetch_sub(1, Ordering::Relaxed);

    let message = classify(&test, &request.url, elapsed, result);
    if samples.send(message).is_err() {
        debug!(test_id = test.id, "Aggregator already stopped; sample dropped");
    }
}

pub(crate) fn classify(
    test: &TestCase,
    url: &str,
    elapsed: Duration,
    result: Result<ProbeResponse, ProbeError>,
) -> AggregatorMessage {
    match result {
        Ok(response) if test.accepts(response.status) => AggregatorMessage::Success(Sample {
            test_id: test.id,
            elapsed,
            status: Some(response.status),
        }),
        Ok(response) => {
            let err = ProbeError::UnexpectedStatus {
                status: response.status,
                url: url.to_string(),
            };
            warn!(test_id = test.id, test = %test.name, error = %err, "Probe rejected");
            AggregatorMessage::Error(Sample {
                test_id: test.id,
                elapsed,
                status: Some(response.status),
            })
        }
        Err(err) => {
            warn!(test_id = test.id, test = %test.name, error = %err, "Probe failed");
            AggregatorMessage::Error(Sample {
                test_id: test.id,
                elapsed,
                status: None,
            })
        }
    }
}
