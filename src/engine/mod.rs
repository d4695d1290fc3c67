//! Concurrent chunked load-test execution engine.
//!
//! A run goes through three steps:
//!
//! 1. [`StressTest::new`] parses the plan, assigns the run id and seeds one
//!    `Created` entry per test case in the [`ResultStore`].
//! 2. [`StressTest::initialize`] checks the target accepts TCP connections and
//!    preloads the round-robin scheduler.
//! 3. [`StressTest::execute`] drives the chunk loop to completion and posts
//!    the run id to the [`CompletionNotifier`].

pub mod aggregator;
pub mod dispatcher;
pub mod notifier;
pub mod scheduler;
pub mod worker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::dispatcher::{DispatchOutcome, Dispatcher};
use self::notifier::CompletionNotifier;
use self::scheduler::RoundRobin;
use self::worker::WorkerContext;
use crate::config::EngineConfig;
use crate::plan::{PlanError, RunId, TestPlan};
use crate::probes::http::{HttpTransport, Transport};
use crate::probes::{tcp, ProbeError};
use crate::results::{ResultStore, RunEntries};

/// Workers launched per chunk; the only back-pressure control on a run.
pub const MAX_CONCURRENCY: usize = 25;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("execution order references invalid test id {0}")]
    InvalidTestId(u16),

    #[error("execution order is empty")]
    EmptyExecutionOrder,

    #[error("unable to reach {host}:{port} over TCP")]
    TargetUnreachable { host: String, port: u16 },

    #[error("run {0} was executed before it was initialized")]
    NotInitialized(RunId),

    #[error(transparent)]
    Transport(#[from] ProbeError),
}

/// Tunables shared by every run an [`Engine`] creates.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: MAX_CONCURRENCY,
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_concurrency: cfg.max_concurrency,
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
        }
    }
}

/// Long-lived collaborators every run needs.
#[derive(Clone)]
pub struct Engine {
    settings: EngineSettings,
    store: ResultStore,
    notifier: CompletionNotifier,
    transport: Arc<dyn Transport>,
}

impl Engine {
    /// Engine issuing real HTTP requests through reqwest.
    pub fn new(
        settings: EngineSettings,
        store: ResultStore,
        notifier: CompletionNotifier,
    ) -> Result<Self, EngineError> {
        let transport = HttpTransport::new(settings.request_timeout)?;
        Ok(Self::with_transport(
            settings,
            store,
            notifier,
            Arc::new(transport),
        ))
    }

    pub fn with_transport(
        settings: EngineSettings,
        store: ResultStore,
        notifier: CompletionNotifier,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings,
            store,
            notifier,
            transport,
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

/// Totals reported once a run has finished.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub chunks_planned: u32,
    pub chunks_run: u32,
    pub dispatched: u64,
    pub successes: u64,
    pub errors: u64,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

/// Shared view of a run that outlives the [`StressTest`] it came from.
#[derive(Debug, Clone)]
pub struct RunHandle {
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

impl RunHandle {
    /// Stop the run before its next chunk. The current chunk always finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Probes currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Mutable state owned by one run.
struct RunTelemetry {
    entries: RunEntries,
    scheduler: Option<Arc<RoundRobin>>,
    in_flight: Arc<AtomicUsize>,
}

/// One load-test run: a plan plus the state needed to execute it once.
pub struct StressTest {
    plan: TestPlan,
    engine: Engine,
    telemetry: RunTelemetry,
    cancel: CancellationToken,
}

impl StressTest {
    /// Parse `plan_bytes`, assign a run id and seed the result store.
    pub async fn new(plan_bytes: &[u8], engine: &Engine) -> Result<Self, EngineError> {
        let plan = TestPlan::from_slice(plan_bytes)?;
        let entries = engine.store.seed(&plan).await;

        info!(
            run_id = %plan.id,
            host = plan.host(),
            port = plan.server_port,
            tests = plan.tests.len(),
            num_requests = plan.num_requests,
            "Stress test created"
        );

        Ok(Self {
            plan,
            engine: engine.clone(),
            telemetry: RunTelemetry {
                entries,
                scheduler: None,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &RunId {
        &self.plan.id
    }

    pub fn plan(&self) -> &TestPlan {
        &self.plan
    }

    /// Handle for observing and cancelling the run while [`Self::execute`] owns it.
    pub fn handle(&self) -> RunHandle {
        RunHandle {
            cancel: self.cancel.clone(),
            in_flight: Arc::clone(&self.telemetry.in_flight),
        }
    }

    /// Check the target is reachable, then preload the scheduler.
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        let host = self.plan.host().to_string();
        let port = self.plan.server_port;

        if !tcp::can_connect(&host, port, self.engine.settings.connect_timeout).await {
            warn!(run_id = %self.plan.id, %host, %port, "Target unreachable");
            return Err(EngineError::TargetUnreachable { host, port });
        }

        let scheduler = RoundRobin::preload(&self.plan.tests, &self.plan.execution_order)?;
        self.telemetry.scheduler = Some(Arc::new(scheduler));

        info!(run_id = %self.plan.id, %host, %port, "Stress test initialized");
        Ok(())
    }

    /// Run every chunk, then post the completion notification.
    pub async fn execute(self) -> Result<RunSummary, EngineError> {
        let Some(scheduler) = self.telemetry.scheduler.clone() else {
            return Err(EngineError::NotInitialized(self.plan.id.clone()));
        };

        let _executing = self.engine.store.begin_execution(&self.plan.id);
        let start = Instant::now();
        info!(run_id = %self.plan.id, "Stress test started");

        let dispatcher = Dispatcher {
            run_id: self.plan.id.clone(),
            scheduler,
            worker: Arc::new(WorkerContext {
                host: self.plan.host().to_string(),
                port: self.plan.server_port,
                transport: Arc::clone(&self.engine.transport),
                in_flight: Arc::clone(&self.telemetry.in_flight),
            }),
            entries: Arc::clone(&self.telemetry.entries),
            max_concurrency: self.engine.settings.max_concurrency,
            rest: self.plan.rest_duration(),
            cancel: self.cancel.clone(),
        };
        let outcome: DispatchOutcome = dispatcher.run(self.plan.num_requests).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %self.plan.id,
            chunks = outcome.chunks_run,
            successes = outcome.successes,
            errors = outcome.errors,
            cancelled = outcome.cancelled,
            elapsed_ms,
            "Stress test finished"
        );

        self.engine.notifier.notify(self.plan.id.clone()).await;

        Ok(RunSummary {
            run_id: self.plan.id,
            chunks_planned: outcome.chunks_planned,
            chunks_run: outcome.chunks_run,
            dispatched: outcome.dispatched,
            successes: outcome.successes,
            errors: outcome.errors,
            cancelled: outcome.cancelled,
            elapsed_ms,
        })
    }
}
