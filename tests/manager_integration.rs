//! End-to-end tests for the procedure manager over the in-memory broker.
//!
//! Each test starts a real [`ProcedureManager`] with in-process workers (or
//! container workers backed by an inline runtime that runs the container
//! entrypoint as a task) and drives it through the broker protocol.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use procedure_manager::ProcedureClient;
use procedure_manager::broker::{Broker, MemoryBroker};
use procedure_manager::config::{ContainerConfig, ContainerWorkerEnv, ProcedureConfig};
use procedure_manager::endpoints;
use procedure_manager::error::{ContainerError, RegistryError, WorkerError};
use procedure_manager::manager::ProcedureManager;
use procedure_manager::messages::{
    ArgsKwargs, ProcedureAbort, ProcedureExecution, ProcedureRequest, RequestResponse,
};
use procedure_manager::procedures::{Procedure, ProcedureRegistry};
use procedure_manager::queue::ExecutionQueueHelper;
use procedure_manager::worker::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerWorkerFactory, InProcessWorkerFactory,
    ProcedureWorker, WorkerCore, WorkerFactory, WorkerStatus, run_container_entrypoint,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Helpers ─────────────────────────────────────────────────────────

/// Procedure that records the execution ids it ran, in order.
#[derive(Debug, Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Procedure for Recorder {
    fn identifier(&self) -> &str {
        "record"
    }

    async fn run(
        &self,
        execution: &ProcedureExecution,
        _args: &ArgsKwargs,
    ) -> Result<Value, RegistryError> {
        self.seen.lock().unwrap().push(execution.execution_id.clone());
        Ok(Value::Null)
    }
}

struct Harness {
    broker: Arc<dyn Broker>,
    manager: Arc<ProcedureManager>,
    recorder: Arc<Recorder>,
}

impl Harness {
    fn helper(&self) -> &ExecutionQueueHelper {
        self.manager.helper()
    }

    fn client(&self) -> ProcedureClient {
        ProcedureClient::new(Arc::clone(&self.broker))
    }

    async fn submit(&self, identifier: &str, queue: &str) -> ProcedureExecution {
        self.manager
            .submit_request(ProcedureRequest::new(identifier).with_queue(queue))
            .await
            .expect("request accepted")
    }

    async fn submit_sleep(&self, queue: &str) -> ProcedureExecution {
        let request = ProcedureRequest::new("sleep")
            .with_queue(queue)
            .with_args(sleep_args(30));
        self.manager
            .submit_request(request)
            .await
            .expect("request accepted")
    }

    async fn unhandled_ids(&self, queue: &str) -> BTreeSet<String> {
        ids(self.helper().unhandled(queue).await.unwrap())
    }
}

fn config(queue_timeout: Duration) -> ProcedureConfig {
    ProcedureConfig {
        queue_timeout,
        shutdown_timeout: Duration::from_secs(2),
        ..ProcedureConfig::default()
    }
}

fn sleep_args(seconds: u64) -> ArgsKwargs {
    let kwargs = json!({ "seconds": seconds }).as_object().cloned().unwrap();
    ArgsKwargs::new(Vec::new(), kwargs)
}

fn ids(executions: impl IntoIterator<Item = ProcedureExecution>) -> BTreeSet<String> {
    executions.into_iter().map(|e| e.execution_id).collect()
}

/// Start a manager whose registry holds the builtins plus a [`Recorder`].
async fn start_with<F>(config: ProcedureConfig, broker: Arc<dyn Broker>, factory: F) -> Harness
where
    F: FnOnce(Arc<ProcedureRegistry>) -> Arc<dyn WorkerFactory>,
{
    let registry = Arc::new(ProcedureRegistry::with_builtins().await);
    let recorder = Arc::new(Recorder::default());
    registry.register(recorder.clone()).await.unwrap();
    let factory = factory(Arc::clone(&registry));
    let manager = ProcedureManager::start(config, Arc::clone(&broker), registry, factory)
        .await
        .unwrap();
    Harness {
        broker,
        manager,
        recorder,
    }
}

fn in_process(registry: Arc<ProcedureRegistry>) -> Arc<dyn WorkerFactory> {
    Arc::new(InProcessWorkerFactory::new(registry))
}

async fn start_manager(broker: Arc<dyn Broker>, queue_timeout: Duration) -> Harness {
    start_with(config(queue_timeout), broker, in_process).await
}

async fn start(queue_timeout: Duration) -> Harness {
    start_manager(Arc::new(MemoryBroker::new()), queue_timeout).await
}

/// Poll `check` until it holds. Callers bound the wait with [`TEST_TIMEOUT`].
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    while !check().await {
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_status(
    manager: &ProcedureManager,
    queue: &str,
    status: WorkerStatus,
) -> Arc<dyn ProcedureWorker> {
    loop {
        if let Some(worker) = manager.worker(queue).await
            && worker.status() == Some(status)
        {
            return worker;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

// ── Requests ────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_on_default_queue_acknowledges_and_runs_full_lifecycle() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_millis(200)).await;
        let mut acks = h
            .broker
            .subscribe(endpoints::PROCEDURE_REQUEST_RESPONSE)
            .await
            .unwrap();
        let (tx, rx) = oneshot::channel();
        h.manager
            .add_callback("primary", move |worker| {
                let _ = tx.send(worker.core().status_sequence());
            })
            .await;

        let execution = h
            .manager
            .submit_request(ProcedureRequest::new("echo"))
            .await
            .unwrap();
        assert_eq!(execution.queue, "primary");

        let ack: RequestResponse = serde_json::from_str(&acks.recv().await.unwrap()).unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.message, "Running procedure echo");

        let sequence = rx.await.unwrap();
        assert_eq!(
            sequence,
            [
                WorkerStatus::Idle,
                WorkerStatus::Running,
                WorkerStatus::Idle,
                WorkerStatus::Finished
            ]
        );
        assert_eq!(h.manager.pool_tasks_submitted(), 1);
        assert!(h.manager.active_workers().await.is_empty());
        assert!(h.manager.tracked_executions().await.is_empty());
        assert!(h.helper().active(None).await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_procedure_is_rejected_without_starting_a_worker() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_millis(200)).await;
        let client = h.client();
        let mut acks = client.subscribe_responses().await.unwrap();

        client.request("does-not-exist", None, None).await.unwrap();
        client.request("does-not-exist", None, None).await.unwrap();

        for _ in 0..2 {
            let ack: RequestResponse = serde_json::from_str(&acks.recv().await.unwrap()).unwrap();
            assert!(!ack.accepted);
            assert!(ack.message.contains("does-not-exist"), "{}", ack.message);
            assert!(ack.message.contains("echo"), "{}", ack.message);
        }
        assert_eq!(h.manager.pool_tasks_submitted(), 0);
        assert!(h.manager.active_workers().await.is_empty());
        assert!(h.helper().pending("primary").await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_request_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_millis(200)).await;
        let mut acks = h
            .broker
            .subscribe(endpoints::PROCEDURE_REQUEST_RESPONSE)
            .await
            .unwrap();

        h.broker
            .publish(endpoints::PROCEDURE_REQUEST, r#"{"identifier": "echo", "bogus": 1}"#)
            .await
            .unwrap();
        let ack: RequestResponse = serde_json::from_str(&acks.recv().await.unwrap()).unwrap();
        assert!(!ack.accepted);

        let reserved = ProcedureRequest::new("echo").with_queue(endpoints::RESERVED_QUEUE);
        assert!(h.manager.submit_request(reserved).await.is_none());
        assert_eq!(h.manager.pool_tasks_submitted(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn available_procedures_are_published_at_start() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_millis(200)).await;
        let available = h.client().available_procedures().await.unwrap();
        for identifier in ["echo", "record", "sleep"] {
            assert!(available.iter().any(|a| a == identifier), "{available:?}");
        }
    })
    .await
    .expect("test timed out");
}

// ── Scheduling ──────────────────────────────────────────────────────

#[tokio::test]
async fn rapid_submits_share_one_worker() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let submits = (0..25).map(|_| h.submit("record", "burst"));
        let executions = join_all(submits).await;

        let recorder = &h.recorder;
        eventually(|| async move { recorder.seen().len() == 25 }).await;
        assert_eq!(h.manager.pool_tasks_submitted(), 1);
        assert_eq!(ids(executions), h.recorder.seen().into_iter().collect());
        assert_eq!(h.manager.active_workers().await, ["burst"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn executions_run_in_submission_order() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let mut submitted = Vec::new();
        for _ in 0..10 {
            submitted.push(h.submit("record", "fifo").await.execution_id);
        }

        let recorder = &h.recorder;
        eventually(|| async move { recorder.seen().len() == 10 }).await;
        assert_eq!(h.recorder.seen(), submitted);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn idle_worker_exits_after_queue_timeout_and_is_replaced_on_demand() {
    timeout(TEST_TIMEOUT, async {
        let queue_timeout = Duration::from_millis(200);
        let h = start(queue_timeout).await;
        h.submit("record", "q").await;

        let recorder = &h.recorder;
        eventually(|| async move { recorder.seen().len() == 1 }).await;
        let idle_since = Instant::now();
        let manager = &h.manager;
        eventually(|| async move { manager.active_workers().await.is_empty() }).await;
        assert!(idle_since.elapsed() < queue_timeout + Duration::from_secs(1));
        assert!(h.manager.worker_statuses().await.is_empty());

        h.submit("record", "q").await;
        eventually(|| async move { recorder.seen().len() == 2 }).await;
        assert_eq!(h.manager.pool_tasks_submitted(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn queues_run_concurrently() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        h.submit_sleep("q1").await;
        h.submit_sleep("q2").await;

        wait_for_status(&h.manager, "q1", WorkerStatus::Running).await;
        wait_for_status(&h.manager, "q2", WorkerStatus::Running).await;
        assert_eq!(h.manager.active_workers().await, ["q1", "q2"]);
        let statuses = h.manager.worker_statuses().await;
        assert_eq!(statuses.get("q1"), Some(&Some(WorkerStatus::Running)));
        assert_eq!(statuses.get("q2"), Some(&Some(WorkerStatus::Running)));

        h.manager.abort_all().await;
    })
    .await
    .expect("test timed out");
}

// ── Worker pool ─────────────────────────────────────────────────────

/// Worker that either fails setup or reports FINISHED without popping.
struct Stub {
    core: WorkerCore,
    fail_setup: bool,
}

#[async_trait]
impl ProcedureWorker for Stub {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    async fn setup_execution_environment(&self) -> Result<(), WorkerError> {
        if self.fail_setup {
            return Err(WorkerError::SetupFailed {
                queue: self.core.queue().to_string(),
                reason: "no environment".to_string(),
            });
        }
        Ok(())
    }

    async fn work(&self) -> Result<(), WorkerError> {
        self.core.set_status(WorkerStatus::Idle);
        self.core.set_status(WorkerStatus::Finished);
        Ok(())
    }

    async fn run_task(&self, _execution: &ProcedureExecution) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn abort(&self) {
        self.core.request_stop();
    }

    async fn abort_execution(&self, _execution_id: &str) {}

    async fn kill_process(&self) {}
}

/// Hands out one [`Stub`], then in-process workers.
struct StubFirst {
    fail_setup: bool,
    used: AtomicBool,
    inner: InProcessWorkerFactory,
}

impl StubFirst {
    fn factory(fail_setup: bool) -> impl FnOnce(Arc<ProcedureRegistry>) -> Arc<dyn WorkerFactory> {
        move |registry| {
            Arc::new(Self {
                fail_setup,
                used: AtomicBool::new(false),
                inner: InProcessWorkerFactory::new(registry),
            })
        }
    }
}

impl WorkerFactory for StubFirst {
    fn create(
        &self,
        queue: &str,
        helper: ExecutionQueueHelper,
        lifetime: Duration,
    ) -> Arc<dyn ProcedureWorker> {
        if self.used.swap(true, Ordering::SeqCst) {
            return self.inner.create(queue, helper, lifetime);
        }
        Arc::new(Stub {
            core: WorkerCore::new(queue, helper, lifetime),
            fail_setup: self.fail_setup,
        })
    }
}

#[tokio::test]
async fn pool_size_caps_running_workers() {
    timeout(TEST_TIMEOUT, async {
        let config = ProcedureConfig {
            max_workers: 1,
            ..config(Duration::from_secs(2))
        };
        let h = start_with(config, Arc::new(MemoryBroker::new()), in_process).await;
        h.submit_sleep("a").await;
        wait_for_status(&h.manager, "a", WorkerStatus::Running).await;
        let queued = h.submit("record", "b").await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            h.manager.worker_statuses().await,
            BTreeMap::from([
                ("a".to_string(), Some(WorkerStatus::Running)),
                ("b".to_string(), None),
            ])
        );
        assert!(h.recorder.seen().is_empty());

        h.manager.abort_queue("a").await;
        let recorder = &h.recorder;
        eventually(|| async move { recorder.seen().len() == 1 }).await;
        assert_eq!(h.recorder.seen(), [queued.execution_id]);
        h.manager.abort_all().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn work_left_behind_by_finished_worker_gets_a_new_worker() {
    timeout(TEST_TIMEOUT, async {
        let h = start_with(
            config(Duration::from_millis(200)),
            Arc::new(MemoryBroker::new()),
            StubFirst::factory(false),
        )
        .await;
        let late = h.submit("record", "q").await;

        let recorder = &h.recorder;
        eventually(|| async move { recorder.seen().len() == 1 }).await;
        assert_eq!(h.recorder.seen(), [late.execution_id]);
        assert_eq!(h.manager.pool_tasks_submitted(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn setup_failure_leaves_work_pending_without_respawning() {
    timeout(TEST_TIMEOUT, async {
        let h = start_with(
            config(Duration::from_millis(200)),
            Arc::new(MemoryBroker::new()),
            StubFirst::factory(true),
        )
        .await;
        let (tx, rx) = oneshot::channel();
        h.manager
            .add_callback("q", move |worker| {
                let _ = tx.send(worker.status());
            })
            .await;
        let stranded = h.submit("record", "q").await;

        assert_eq!(rx.await.unwrap(), Some(WorkerStatus::Finished));
        let manager = &h.manager;
        eventually(|| async move { manager.active_workers().await.is_empty() }).await;
        sleep(Duration::from_millis(200)).await;

        assert_eq!(h.manager.pool_tasks_submitted(), 1);
        assert_eq!(h.helper().pending("q").await.unwrap(), [stranded]);
        assert!(h.unhandled_ids("q").await.is_empty());
        assert!(h.recorder.seen().is_empty());
    })
    .await
    .expect("test timed out");
}

// ── Recovery ────────────────────────────────────────────────────────

#[tokio::test]
async fn restart_moves_previous_work_to_unhandled() {
    timeout(TEST_TIMEOUT, async {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let previous = ExecutionQueueHelper::new(Arc::clone(&broker));
        let running = ProcedureExecution::new("record", "q", ArgsKwargs::default());
        let waiting = ProcedureExecution::new("record", "q", ArgsKwargs::default());
        previous.push("q", &running).await.unwrap();
        previous.push("q", &waiting).await.unwrap();
        let held = previous.pop_to_active_set("q", Duration::ZERO).await.unwrap();
        assert_eq!(held.as_ref(), Some(&running));

        let h = start_manager(broker, Duration::from_millis(200)).await;

        assert!(h.helper().pending("q").await.unwrap().is_empty());
        assert!(h.helper().active(None).await.unwrap().is_empty());
        assert_eq!(h.unhandled_ids("q").await, ids([running, waiting]));
        assert!(h.manager.active_workers().await.is_empty());
        assert!(h.recorder.seen().is_empty());
    })
    .await
    .expect("test timed out");
}

// ── Abort ───────────────────────────────────────────────────────────

#[tokio::test]
async fn aborting_pending_execution_removes_it_before_it_runs() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let sleeper = h.submit_sleep("q").await;
        let recorded = h.submit("record", "q").await;
        wait_for_status(&h.manager, "q", WorkerStatus::Running).await;

        h.manager.abort_execution(&recorded.execution_id).await;
        assert!(h.helper().pending("q").await.unwrap().is_empty());
        assert_eq!(h.unhandled_ids("q").await, ids([recorded.clone()]));

        h.manager.abort_execution(&sleeper.execution_id).await;
        wait_for_status(&h.manager, "q", WorkerStatus::Idle).await;
        assert!(h.recorder.seen().is_empty());
        assert!(h.helper().active(Some("q")).await.unwrap().is_empty());
        assert_eq!(h.unhandled_ids("q").await, ids([recorded, sleeper]));
        assert!(h.manager.tracked_executions().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn aborting_running_execution_only_touches_its_worker() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let first = h.submit_sleep("q1").await;
        h.submit_sleep("q2").await;
        wait_for_status(&h.manager, "q1", WorkerStatus::Running).await;
        let other = wait_for_status(&h.manager, "q2", WorkerStatus::Running).await;

        h.manager.abort_execution(&first.execution_id).await;
        wait_for_status(&h.manager, "q1", WorkerStatus::Idle).await;
        assert_eq!(other.status(), Some(WorkerStatus::Running));
        assert_eq!(h.unhandled_ids("q1").await, ids([first]));
        assert!(h.unhandled_ids("q2").await.is_empty());

        h.manager.abort_all().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn aborting_unknown_execution_is_harmless() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_millis(200)).await;
        h.manager.abort_execution("no-such-id").await;
        assert!(h.manager.active_workers().await.is_empty());
        assert!(h.unhandled_ids("primary").await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn aborting_completed_execution_changes_nothing() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(5)).await;
        let done = h.submit("record", "q").await;
        let recorder = &h.recorder;
        eventually(|| async move { recorder.seen().len() == 1 }).await;
        let worker = wait_for_status(&h.manager, "q", WorkerStatus::Idle).await;

        h.manager.abort_execution(&done.execution_id).await;

        assert!(h.unhandled_ids("q").await.is_empty());
        assert!(h.helper().active(Some("q")).await.unwrap().is_empty());
        assert_eq!(worker.status(), Some(WorkerStatus::Idle));
        assert_eq!(h.manager.active_workers().await, ["q"]);
        h.manager.abort_all().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn aborting_queue_moves_its_work_and_stops_its_worker() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let sleeper = h.submit_sleep("q").await;
        let first = h.submit("record", "q").await;
        let second = h.submit("record", "q").await;
        let untouched = h.submit_sleep("q2").await;
        let waiting = h.submit("record", "q2").await;
        wait_for_status(&h.manager, "q", WorkerStatus::Running).await;
        let other = wait_for_status(&h.manager, "q2", WorkerStatus::Running).await;

        h.manager
            .abort(ProcedureAbort {
                queue: Some("q".to_string()),
                ..Default::default()
            })
            .await;

        assert!(h.helper().pending("q").await.unwrap().is_empty());
        assert_eq!(h.manager.active_workers().await, ["q2"]);
        assert_eq!(h.unhandled_ids("q").await, ids([sleeper, first, second]));
        assert!(h.recorder.seen().is_empty());

        assert_eq!(other.status(), Some(WorkerStatus::Running));
        assert_eq!(h.helper().pending("q2").await.unwrap(), [waiting]);
        assert_eq!(ids(h.helper().active(Some("q2")).await.unwrap()), ids([untouched]));

        h.manager.abort_all().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn abort_all_stops_every_worker() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let a = h.submit_sleep("q1").await;
        let b = h.submit_sleep("q2").await;
        let c = h.submit("record", "q2").await;
        wait_for_status(&h.manager, "q1", WorkerStatus::Running).await;
        wait_for_status(&h.manager, "q2", WorkerStatus::Running).await;

        h.manager
            .abort(ProcedureAbort {
                abort_all: true,
                ..Default::default()
            })
            .await;

        assert!(h.manager.active_workers().await.is_empty());
        assert_eq!(h.unhandled_ids("q1").await, ids([a]));
        assert_eq!(h.unhandled_ids("q2").await, ids([b, c]));
        assert!(h.recorder.seen().is_empty());
    })
    .await
    .expect("test timed out");
}

// ── Listeners ───────────────────────────────────────────────────────

#[tokio::test]
async fn broker_messages_drive_abort_and_clear() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let client = h.client();

        h.broker
            .publish(endpoints::PROCEDURE_ABORT, "not json")
            .await
            .unwrap();
        client
            .request("sleep", Some(sleep_args(30)), Some("q"))
            .await
            .unwrap();
        wait_for_status(&h.manager, "q", WorkerStatus::Running).await;

        client.abort_queue("q").await.unwrap();
        let manager = &h.manager;
        eventually(|| async move { manager.active_workers().await.is_empty() }).await;
        assert_eq!(client.unhandled("q").await.unwrap().len(), 1);

        client.clear_unhandled_queue("q").await.unwrap();
        let helper = h.helper();
        eventually(|| async move { helper.unhandled("q").await.unwrap().is_empty() }).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn clear_unhandled_by_execution_keeps_the_rest() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let sleeper = h.submit_sleep("q").await;
        let first = h.submit("record", "q").await;
        let second = h.submit("record", "q").await;
        wait_for_status(&h.manager, "q", WorkerStatus::Running).await;
        h.manager.abort_execution(&first.execution_id).await;
        h.manager.abort_execution(&second.execution_id).await;

        let client = h.client();
        client.clear_unhandled_execution(&first.execution_id).await.unwrap();
        let helper = h.helper();
        eventually(|| async move { helper.unhandled("q").await.unwrap().len() == 1 }).await;
        assert_eq!(h.unhandled_ids("q").await, ids([second]));
        // Clearing never touches running work.
        assert_eq!(ids(h.helper().active(Some("q")).await.unwrap()), ids([sleeper]));

        client.clear_all_unhandled().await.unwrap();
        eventually(|| async move { helper.unhandled("q").await.unwrap().is_empty() }).await;
        h.manager.abort_all().await;
    })
    .await
    .expect("test timed out");
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_workers_and_refuses_new_ones() {
    timeout(TEST_TIMEOUT, async {
        let h = start(Duration::from_secs(2)).await;
        let sleeper = h.submit_sleep("q").await;
        let waiting = h.submit("record", "q").await;
        wait_for_status(&h.manager, "q", WorkerStatus::Running).await;

        h.manager.shutdown().await;

        assert!(h.manager.active_workers().await.is_empty());
        assert_eq!(h.unhandled_ids("q").await, ids([sleeper]));
        assert_eq!(h.helper().pending("q").await.unwrap(), [waiting]);

        let mut acks = h
            .broker
            .subscribe(endpoints::PROCEDURE_REQUEST_RESPONSE)
            .await
            .unwrap();
        let refused = h
            .manager
            .submit_request(ProcedureRequest::new("record").with_queue("later"))
            .await;
        assert!(refused.is_none());
        let ack: RequestResponse = serde_json::from_str(&acks.recv().await.unwrap()).unwrap();
        assert!(!ack.accepted);
        assert!(ack.message.contains("shutting down"));
        assert!(h.helper().pending("later").await.unwrap().is_empty());
        assert_eq!(h.manager.pool_tasks_submitted(), 1);
        assert!(h.manager.active_workers().await.is_empty());
        assert!(h.recorder.seen().is_empty());
    })
    .await
    .expect("test timed out");
}

// ── Container workers ───────────────────────────────────────────────

/// Runtime whose "containers" are tasks running the container entrypoint
/// against the same broker.
struct InlineRuntime {
    helper: ExecutionQueueHelper,
    registry: Arc<ProcedureRegistry>,
    containers: Mutex<HashMap<String, JoinHandle<()>>>,
    launched: AtomicUsize,
    environments: Mutex<Vec<Vec<(String, String)>>>,
}

impl InlineRuntime {
    async fn new(broker: Arc<dyn Broker>) -> Arc<Self> {
        Arc::new(Self {
            helper: ExecutionQueueHelper::new(broker),
            registry: Arc::new(ProcedureRegistry::with_builtins().await),
            containers: Mutex::new(HashMap::new()),
            launched: AtomicUsize::new(0),
            environments: Mutex::new(Vec::new()),
        })
    }

    /// Stop a container without it reporting anything.
    fn crash(&self, id: &str) {
        if let Some(handle) = self.containers.lock().unwrap().get(id) {
            handle.abort();
        }
    }
}

#[async_trait]
impl ContainerRuntime for InlineRuntime {
    async fn run(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        self.environments.lock().unwrap().push(spec.env.clone());
        let env = ContainerWorkerEnv::from_lookup(|key| {
            spec.env
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .map_err(|e| ContainerError::Launch {
            runtime: "inline".to_string(),
            reason: e.to_string(),
        })?;

        let id = format!("inline-{}", self.launched.fetch_add(1, Ordering::SeqCst));
        let helper = self.helper.clone();
        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move {
            let _ = run_container_entrypoint(helper, registry, &env).await;
        });
        self.containers.lock().unwrap().insert(id.clone(), handle);
        Ok(id)
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        self.crash(id);
        Ok(())
    }

    async fn inspect_state(&self, id: &str) -> Result<ContainerState, ContainerError> {
        match self.containers.lock().unwrap().get(id) {
            Some(handle) if handle.is_finished() => Ok(ContainerState::Exited),
            Some(_) => Ok(ContainerState::Running),
            None => Err(ContainerError::NotStarted(id.to_string())),
        }
    }
}

/// Runtime whose containers exit as soon as they start, reporting nothing.
#[derive(Default)]
struct ExitingRuntime {
    launched: AtomicUsize,
}

#[async_trait]
impl ContainerRuntime for ExitingRuntime {
    async fn run(&self, _spec: &ContainerSpec) -> Result<String, ContainerError> {
        Ok(format!("exited-{}", self.launched.fetch_add(1, Ordering::SeqCst)))
    }

    async fn kill(&self, _id: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn inspect_state(&self, _id: &str) -> Result<ContainerState, ContainerError> {
        Ok(ContainerState::Exited)
    }
}

async fn start_with_containers(runtime: Arc<dyn ContainerRuntime>, broker: Arc<dyn Broker>) -> Arc<ProcedureManager> {
    let registry = Arc::new(ProcedureRegistry::with_builtins().await);
    let container = ContainerConfig {
        broker_endpoint: "redis:6379".to_string(),
        ..ContainerConfig::default()
    };
    let factory = Arc::new(
        ContainerWorkerFactory::new(runtime, container).with_poll_interval(Duration::from_millis(20)),
    );
    ProcedureManager::start(config(Duration::from_secs(1)), broker, registry, factory)
        .await
        .unwrap()
}

#[tokio::test]
async fn container_worker_mirrors_statuses_reported_by_the_container() {
    timeout(TEST_TIMEOUT, async {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let runtime = InlineRuntime::new(Arc::clone(&broker)).await;
        let manager = start_with_containers(runtime.clone() as Arc<dyn ContainerRuntime>, broker).await;
        let (tx, rx) = oneshot::channel();
        manager
            .add_callback("primary", move |worker| {
                let _ = tx.send(worker.core().status_sequence());
            })
            .await;

        manager
            .submit_request(ProcedureRequest::new("echo"))
            .await
            .unwrap();

        assert_eq!(
            rx.await.unwrap(),
            [
                WorkerStatus::Idle,
                WorkerStatus::Running,
                WorkerStatus::Idle,
                WorkerStatus::Finished
            ]
        );
        assert!(manager.active_workers().await.is_empty());
        assert!(manager.helper().active(None).await.unwrap().is_empty());

        let environments = runtime.environments.lock().unwrap().clone();
        assert_eq!(
            environments,
            [vec![
                ("redis_server".to_string(), "redis:6379".to_string()),
                ("queue".to_string(), "primary".to_string()),
                ("timeout_s".to_string(), "1".to_string()),
            ]]
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn container_exit_without_finished_marks_worker_dead() {
    timeout(TEST_TIMEOUT, async {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let runtime = InlineRuntime::new(Arc::clone(&broker)).await;
        let manager = start_with_containers(runtime.clone() as Arc<dyn ContainerRuntime>, broker).await;
        let (tx, rx) = oneshot::channel();
        manager
            .add_callback("c", move |worker| {
                let _ = tx.send(worker.status());
            })
            .await;

        let request = ProcedureRequest::new("sleep")
            .with_queue("c")
            .with_args(sleep_args(30));
        let sleeper = manager.submit_request(request).await.unwrap();
        wait_for_status(&manager, "c", WorkerStatus::Running).await;

        runtime.crash("inline-0");

        assert_eq!(rx.await.unwrap(), Some(WorkerStatus::Dead));
        assert!(manager.active_workers().await.is_empty());
        assert_eq!(ids(manager.helper().unhandled("c").await.unwrap()), ids([sleeper]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn container_dying_at_start_is_not_relaunched() {
    timeout(TEST_TIMEOUT, async {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let runtime = Arc::new(ExitingRuntime::default());
        let manager = start_with_containers(runtime.clone() as Arc<dyn ContainerRuntime>, broker).await;
        let (tx, rx) = oneshot::channel();
        manager
            .add_callback("primary", move |worker| {
                let _ = tx.send(worker.status());
            })
            .await;

        let stranded = manager
            .submit_request(ProcedureRequest::new("echo"))
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), Some(WorkerStatus::Dead));
        let supervisor = &manager;
        eventually(|| async move { supervisor.active_workers().await.is_empty() }).await;
        sleep(Duration::from_millis(300)).await;

        assert_eq!(runtime.launched.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pool_tasks_submitted(), 1);
        assert!(manager.active_workers().await.is_empty());
        assert_eq!(manager.helper().pending("primary").await.unwrap(), [stranded]);
    })
    .await
    .expect("test timed out");
}
