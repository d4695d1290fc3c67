//! Engine integration tests -- full runs through new / initialize / execute.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use loadplane::engine::{notifier, Engine, EngineError, EngineSettings, StressTest};
use loadplane::plan::RunId;
use loadplane::probes::http::{ProbeRequest, ProbeResponse, Transport};
use loadplane::probes::ProbeError;
use loadplane::results::{ResultStore, TestStatus};

/// Answers every request with a fixed status and counts hits per URL path.
struct Scripted {
    status: u16,
    hits: Mutex<HashMap<String, u32>>,
}

impl Scripted {
    fn new(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status,
            hits: Mutex::new(HashMap::new()),
        })
    }

    fn hits(&self, path: &str) -> u32 {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn total(&self) -> u32 {
        self.hits.lock().unwrap().values().sum()
    }
}

#[async_trait::async_trait]
impl Transport for Scripted {
    async fn issue(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let path = request
            .url
            .splitn(4, '/')
            .nth(3)
            .map(|p| format!("/{p}"))
            .unwrap_or_default();
        *self.hits.lock().unwrap().entry(path).or_default() += 1;
        Ok(ProbeResponse {
            status: self.status,
            body: Vec::new(),
        })
    }
}

struct Harness {
    engine: Engine,
    store: ResultStore,
    completions: mpsc::Receiver<RunId>,
    // Held open so the reachability check in `initialize` succeeds.
    _listener: TcpListener,
    port: u16,
}

async fn harness(transport: Arc<dyn Transport>) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store = ResultStore::new();
    let (notifier, completions) = notifier::channel();
    let settings = EngineSettings {
        connect_timeout: Duration::from_secs(1),
        ..EngineSettings::default()
    };
    Harness {
        engine: Engine::with_transport(settings, store.clone(), notifier, transport),
        store,
        completions,
        _listener: listener,
        port,
    }
}

fn plan(port: u16, num_requests: u32, tests: &[(u16, &str)], order: &[u16]) -> String {
    let tests: String = tests
        .iter()
        .map(|(id, name)| {
            format!(
                "    - {{ id: {id}, name: {name}, type: GET, endpoint: /{name}, validResponseCodes: [200] }}\n"
            )
        })
        .collect();
    let order: Vec<String> = order.iter().map(u16::to_string).collect();
    format!(
        "apiVersion: v1\nkind: StressTest\nspec:\n  selector: {{ name: 127.0.0.1 }}\n  numRequests: {num_requests}\n  serverPort: {port}\n  tests:\n{tests}  executionOrder: [{}]\n",
        order.join(", ")
    )
}

async fn next_completion(rx: &mut mpsc::Receiver<RunId>) -> RunId {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("completion not posted")
        .expect("notifier dropped")
}

#[tokio::test]
async fn test_single_test_completes_after_two_chunks() {
    let transport = Scripted::new(200);
    let mut h = harness(transport.clone()).await;

    let doc = plan(h.port, 50, &[(1, "alpha")], &[1]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let run_id = test.id().clone();
    test.initialize().await.unwrap();
    let summary = test.execute().await.unwrap();

    assert_eq!(summary.chunks_planned, 2);
    assert_eq!(summary.chunks_run, 2);
    assert_eq!(summary.dispatched, 50);
    assert_eq!(summary.successes, 50);
    assert_eq!(summary.errors, 0);
    assert!(!summary.cancelled);
    assert_eq!(transport.hits("/alpha"), 50);

    let entry = h.store.entry(&run_id, 1).await.unwrap();
    assert_eq!(entry.status, TestStatus::Completed);
    assert_eq!(entry.completed, 50);
    assert_eq!(entry.total, 50);
    assert_eq!(entry.remaining, 0);
    assert_eq!(entry.success, 50);
    assert!(entry.elapsed_ms.is_some());

    assert_eq!(next_completion(&mut h.completions).await, run_id);
}

#[tokio::test]
async fn test_two_tests_split_dispatches_round_robin() {
    let transport = Scripted::new(200);
    let mut h = harness(transport.clone()).await;

    let doc = plan(h.port, 50, &[(1, "alpha"), (2, "beta")], &[1, 2]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let run_id = test.id().clone();
    test.initialize().await.unwrap();
    let summary = test.execute().await.unwrap();

    assert_eq!(summary.chunks_run, 2);
    assert_eq!(transport.hits("/alpha"), 25);
    assert_eq!(transport.hits("/beta"), 25);

    // Every entry expects numRequests completions of its own, so a split run
    // leaves both halfway.
    for id in [1, 2] {
        let entry = h.store.entry(&run_id, id).await.unwrap();
        assert_eq!(entry.status, TestStatus::Running);
        assert_eq!(entry.completed, 25);
        assert_eq!(entry.remaining, 25);
        assert_eq!(entry.total, 50);
    }

    assert_eq!(next_completion(&mut h.completions).await, run_id);
}

#[tokio::test]
async fn test_dispatch_order_follows_execution_order() {
    let transport = Scripted::new(200);
    let h = harness(transport.clone()).await;

    let doc = plan(h.port, 25, &[(1, "a"), (2, "b"), (3, "c")], &[3, 1, 2]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    test.initialize().await.unwrap();
    test.execute().await.unwrap();

    // 25 slots over a cycle of three: 9, 8, 8.
    assert_eq!(transport.hits("/c"), 9);
    assert_eq!(transport.hits("/a"), 8);
    assert_eq!(transport.hits("/b"), 8);
}

#[tokio::test]
async fn test_remainder_below_one_chunk_is_not_executed() {
    let transport = Scripted::new(200);
    let mut h = harness(transport.clone()).await;

    let doc = plan(h.port, 24, &[(1, "alpha")], &[1]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let run_id = test.id().clone();
    test.initialize().await.unwrap();
    let summary = test.execute().await.unwrap();

    assert_eq!(summary.chunks_planned, 0);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(transport.total(), 0);

    let entry = h.store.entry(&run_id, 1).await.unwrap();
    assert_eq!(entry.status, TestStatus::Created);
    assert_eq!(entry.remaining, 24);

    assert_eq!(next_completion(&mut h.completions).await, run_id);
}

#[tokio::test]
async fn test_exactly_one_chunk() {
    let transport = Scripted::new(200);
    let h = harness(transport.clone()).await;

    let doc = plan(h.port, 25, &[(1, "alpha")], &[1]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    test.initialize().await.unwrap();
    let summary = test.execute().await.unwrap();

    assert_eq!(summary.chunks_run, 1);
    assert_eq!(summary.dispatched, 25);
    assert_eq!(transport.total(), 25);
}

#[tokio::test]
async fn test_unreachable_target_fails_initialize() {
    let transport = Scripted::new(200);
    let h = harness(transport.clone()).await;
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let doc = plan(closed, 50, &[(1, "alpha")], &[1]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let run_id = test.id().clone();

    let err = test.initialize().await.unwrap_err();
    assert!(matches!(err, EngineError::TargetUnreachable { port, .. } if port == closed));

    let entry = h.store.entry(&run_id, 1).await.unwrap();
    assert_eq!(entry.status, TestStatus::Created);
    assert_eq!(transport.total(), 0);
}

#[tokio::test]
async fn test_unknown_id_in_execution_order() {
    let h = harness(Scripted::new(200)).await;

    let doc = plan(h.port, 25, &[(1, "alpha")], &[1, 9]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let err = test.initialize().await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTestId(9)));
}

#[tokio::test]
async fn test_empty_execution_order_is_rejected() {
    let h = harness(Scripted::new(200)).await;

    let doc = plan(h.port, 25, &[(1, "alpha")], &[]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let err = test.initialize().await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyExecutionOrder));
}

#[tokio::test]
async fn test_rejected_status_counts_as_error() {
    let transport = Scripted::new(503);
    let h = harness(transport.clone()).await;

    let doc = plan(h.port, 25, &[(1, "alpha")], &[1]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let run_id = test.id().clone();
    test.initialize().await.unwrap();
    let summary = test.execute().await.unwrap();

    assert_eq!(summary.successes, 0);
    assert_eq!(summary.errors, 25);

    let entry = h.store.entry(&run_id, 1).await.unwrap();
    assert_eq!(entry.status, TestStatus::Running);
    assert_eq!(entry.completed, 0);
    assert_eq!(entry.success, 0);
    assert_eq!(entry.remaining, 25);
}

#[tokio::test]
async fn test_execute_without_initialize() {
    let h = harness(Scripted::new(200)).await;

    let doc = plan(h.port, 25, &[(1, "alpha")], &[1]);
    let test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let run_id = test.id().clone();

    let err = test.execute().await.unwrap_err();
    assert!(matches!(err, EngineError::NotInitialized(id) if id == run_id));
}

#[tokio::test]
async fn test_cancel_before_execute_runs_no_chunks() {
    let transport = Scripted::new(200);
    let mut h = harness(transport.clone()).await;

    let doc = plan(h.port, 100, &[(1, "alpha")], &[1]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let run_id = test.id().clone();
    test.initialize().await.unwrap();
    test.handle().cancel();
    let summary = test.execute().await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.chunks_planned, 4);
    assert_eq!(summary.chunks_run, 0);
    assert_eq!(transport.total(), 0);

    // A cancelled run still reports completion.
    assert_eq!(next_completion(&mut h.completions).await, run_id);
}

#[tokio::test]
async fn test_cancel_during_rest_stops_after_current_chunk() {
    let transport = Scripted::new(200);
    let h = harness(transport.clone()).await;

    let doc = plan(h.port, 75, &[(1, "alpha")], &[1]).replace(
        "  numRequests: 75\n",
        "  numRequests: 75\n  restDuration: 30000\n",
    );
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    test.initialize().await.unwrap();
    let handle = test.handle();
    let run = tokio::spawn(test.execute());

    while transport.total() < 25 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel();
    assert!(handle.is_cancelled());

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancelled run did not stop")
        .unwrap()
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.chunks_run, 1);
    assert_eq!(transport.total(), 25);
}

#[tokio::test]
async fn test_failing_run_is_not_evicted_while_executing() {
    let transport = Scripted::new(503);
    let mut h = harness(transport.clone()).await;

    let doc = plan(h.port, 50, &[(1, "alpha")], &[1]).replace(
        "  numRequests: 50
",
        "  numRequests: 50
  restDuration: 1000
",
    );
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    let run_id = test.id().clone();
    test.initialize().await.unwrap();
    let run = tokio::spawn(test.execute());

    // Only error samples arrive, so the entry stops changing after chunk one.
    while transport.total() < 25 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.store.is_executing(&run_id));
    assert_eq!(h.store.evict_idle(Duration::from_millis(200)).await, 0);
    assert_eq!(
        h.store.entry(&run_id, 1).await.unwrap().status,
        TestStatus::Running
    );

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.errors, 50);
    assert_eq!(next_completion(&mut h.completions).await, run_id);

    assert!(!h.store.is_executing(&run_id));
    assert_eq!(h.store.evict_idle(Duration::from_millis(200)).await, 1);
    assert!(h.store.snapshot(&run_id).await.is_none());
}

#[tokio::test]
async fn test_in_flight_is_visible_through_handle() {
    struct Held(Arc<tokio::sync::Semaphore>);

    #[async_trait::async_trait]
    impl Transport for Held {
        async fn issue(&self, _request: &ProbeRequest) -> Result<ProbeResponse, ProbeError> {
            let _ = self.0.acquire().await;
            Ok(ProbeResponse {
                status: 200,
                body: Vec::new(),
            })
        }
    }

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let h = harness(Arc::new(Held(Arc::clone(&gate)))).await;

    let doc = plan(h.port, 25, &[(1, "alpha")], &[1]);
    let mut test = StressTest::new(doc.as_bytes(), &h.engine).await.unwrap();
    test.initialize().await.unwrap();
    let handle = test.handle();
    assert_eq!(handle.in_flight(), 0);
    let run = tokio::spawn(test.execute());

    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.in_flight() < 25 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workers never reached the transport");

    gate.close();
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.successes, 25);
    assert_eq!(handle.in_flight(), 0);
}

#[tokio::test]
async fn test_runs_against_live_http_server() {
    async fn guarded(headers: HeaderMap) -> StatusCode {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer token") => StatusCode::OK,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    let app = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/submit", post(|body: String| async move {
            if body == "hello" {
                StatusCode::CREATED
            } else {
                StatusCode::BAD_REQUEST
            }
        }))
        .route("/guarded", get(guarded));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let store = ResultStore::new();
    let (notifier, mut completions) = notifier::channel();
    let engine = Engine::new(EngineSettings::default(), store.clone(), notifier).unwrap();

    // body: "hello", Authorization: "Bearer token"
    let doc = format!(
        r#"
spec:
  selector:
    name: 127.0.0.1
  numRequests: 75
  serverPort: {port}
  tests:
    - id: 1
      name: ping
      type: GET
      endpoint: /ping
      validResponseCodes: [200]
    - id: 2
      name: submit
      type: POST
      endpoint: /submit
      body: aGVsbG8=
      validResponseCodes: [201]
    - id: 3
      name: guarded
      type: GET
      endpoint: /guarded
      validResponseCodes: [200]
      auth:
        Authorization: QmVhcmVyIHRva2Vu
  executionOrder: [1, 2, 3]
"#
    );

    let mut test = StressTest::new(doc.as_bytes(), &engine).await.unwrap();
    let run_id = test.id().clone();
    test.initialize().await.unwrap();
    let summary = test.execute().await.unwrap();

    assert_eq!(summary.chunks_run, 3);
    assert_eq!(summary.successes, 75);
    assert_eq!(summary.errors, 0);

    for id in [1, 2, 3] {
        let entry = store.entry(&run_id, id).await.unwrap();
        assert_eq!(entry.success, 25, "test {id}");
        assert_eq!(entry.status, TestStatus::Running);
        assert!(entry.avg_response_time > 0.0);
    }
    assert_eq!(next_completion(&mut completions).await, run_id);
}
