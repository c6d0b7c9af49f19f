//! Procedure manager: the single coordinating authority.
//!
//! Validates requests, keeps at most one worker per queue, runs workers on a
//! bounded pool, cleans up after them, and implements abort, clearing and
//! startup recovery.
//!
//! All in-process bookkeeping (worker entries, the execution-id index and
//! per-queue callbacks) lives in one [`ManagerState`] behind one mutex. The
//! broker lists remain the source of truth; the entry map only records which
//! queues currently have a live worker task. Waiting for a task never
//! happens with the mutex held.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{AbortHandle, Abortable, join_all};
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Subscription};
use crate::config::ProcedureConfig;
use crate::endpoints;
use crate::error::{BrokerError, RequestError, WorkerError};
use crate::messages::{
    ProcedureAbort, ProcedureClearUnhandled, ProcedureExecution, ProcedureRequest, QueueBucket,
    RequestResponse,
};
use crate::procedures::ProcedureRegistry;
use crate::queue::ExecutionQueueHelper;
use crate::worker::{ProcedureWorker, WorkerFactory, WorkerStatus, run_scoped};

/// One-shot observer run with the worker once its queue's worker finishes.
pub type WorkerCallback = Box<dyn FnOnce(Arc<dyn ProcedureWorker>) + Send>;

/// How a pooled worker task ended.
#[derive(Debug)]
enum TaskOutcome {
    Completed,
    Failed(WorkerError),
    Cancelled,
    Panicked(String),
}

/// Live worker task for one queue.
struct WorkerEntry {
    /// Filled in once `spawn` has constructed the worker.
    worker: Option<Arc<dyn ProcedureWorker>>,
    task: AbortHandle,
    done: watch::Receiver<bool>,
    /// Distinguishes this task from a later one on the same queue.
    generation: u64,
}

#[derive(Default)]
struct ManagerState {
    workers: HashMap<String, WorkerEntry>,
    executions: HashMap<String, ProcedureExecution>,
    callbacks: HashMap<String, Vec<WorkerCallback>>,
    next_generation: u64,
    shutting_down: bool,
}

pub struct ProcedureManager {
    config: ProcedureConfig,
    helper: ExecutionQueueHelper,
    registry: Arc<ProcedureRegistry>,
    factory: Arc<dyn WorkerFactory>,
    pool: Arc<Semaphore>,
    state: Mutex<ManagerState>,
    listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
    pool_tasks: AtomicUsize,
}

impl ProcedureManager {
    /// Recover state left by a previous manager, then start listening for
    /// requests, aborts and clears.
    pub async fn start(
        config: ProcedureConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<ProcedureRegistry>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Arc<Self>, BrokerError> {
        info!(max_workers = config.max_workers, "Initialising procedure manager...");
        let manager = Arc::new(Self {
            pool: Arc::new(Semaphore::new(config.max_workers)),
            helper: ExecutionQueueHelper::new(broker),
            config,
            registry,
            factory,
            state: Mutex::new(ManagerState::default()),
            listeners: std::sync::Mutex::new(Vec::new()),
            pool_tasks: AtomicUsize::new(0),
        });

        manager.recover().await?;
        manager
            .helper
            .publish_available(&manager.registry.available().await)
            .await?;

        let broker = manager.helper.broker();
        let requests = broker.subscribe(endpoints::PROCEDURE_REQUEST).await?;
        let aborts = broker.subscribe(endpoints::PROCEDURE_ABORT).await?;
        let clears = broker.subscribe(endpoints::PROCEDURE_CLEAR_UNHANDLED).await?;

        let handles = vec![
            manager.listen(requests, |m, payload| async move {
                m.process_request(&payload).await;
            }),
            manager.listen(aborts, |m, payload| async move {
                match serde_json::from_str::<ProcedureAbort>(&payload) {
                    Ok(message) => m.abort(message).await,
                    Err(e) => warn!(error = %e, payload = %payload, "Dropping malformed abort message"),
                }
            }),
            manager.listen(clears, |m, payload| async move {
                match serde_json::from_str::<ProcedureClearUnhandled>(&payload) {
                    Ok(message) => m.clear_unhandled(message).await,
                    Err(e) => warn!(error = %e, payload = %payload, "Dropping malformed clear message"),
                }
            }),
        ];
        manager.listener_handles().extend(handles);

        info!("Done initialising procedure manager.");
        Ok(manager)
    }

    /// Everything in flight for a previous manager is surfaced as unhandled;
    /// its workers did not survive the restart.
    async fn recover(&self) -> Result<(), BrokerError> {
        self.helper.broker().delete(endpoints::PROCEDURE_REQUEST).await?;
        let previous = self.helper.active_and_pending_queue_names().await?;
        debug!(queues = ?previous, "Clearing previous procedure queues");
        self.helper.move_all_to_unhandled().await?;
        self.helper.move_active_to_unhandled(None).await?;
        for queue in &previous {
            self.notify(queue, QueueBucket::Execution).await;
            self.notify(queue, QueueBucket::Unhandled).await;
        }
        if !previous.is_empty() {
            info!(queues = ?previous, "Moved work from a previous manager to unhandled");
        }
        Ok(())
    }

    fn listener_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dispatch every payload on `subscription` to `handler` until the
    /// subscription closes or the manager is dropped.
    fn listen<F, Fut>(self: &Arc<Self>, mut subscription: Subscription, handler: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>, String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                handler(manager, payload).await;
            }
            debug!(channel = %subscription.channel(), "Listener stopped");
        })
    }

    // ── Requests ────────────────────────────────────────────────────

    async fn process_request(self: &Arc<Self>, payload: &str) {
        debug!(payload, "Procedure manager got request message");
        match ProcedureRequest::from_json(payload) {
            Ok(request) => {
                self.submit_request(request).await;
            }
            Err(e) => self.ack(false, e.to_string()).await,
        }
    }

    async fn ack(&self, accepted: bool, message: String) {
        info!(accepted, message = %message, "Procedure request acknowledged");
        let response = RequestResponse { accepted, message };
        let payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode acknowledgement");
                return;
            }
        };
        if let Err(e) = self
            .helper
            .broker()
            .publish(endpoints::PROCEDURE_REQUEST_RESPONSE, &payload)
            .await
        {
            error!(error = %e, "Failed to send acknowledgement");
        }
    }

    async fn validate(&self, request: &ProcedureRequest) -> Result<(), RequestError> {
        if self.state.lock().await.shutting_down {
            return Err(RequestError::ShuttingDown);
        }
        request.validate_shape()?;
        if !self.registry.has(&request.identifier).await {
            return Err(RequestError::UnknownProcedure {
                identifier: request.identifier.clone(),
                available: self.registry.available().await,
            });
        }
        Ok(())
    }

    /// Validate, acknowledge and enqueue a request, starting a worker for its
    /// queue if none is live. Returns the queued execution on acceptance.
    pub async fn submit_request(self: &Arc<Self>, request: ProcedureRequest) -> Option<ProcedureExecution> {
        if let Err(e) = self.validate(&request).await {
            self.ack(false, e.to_string()).await;
            return None;
        }
        self.ack(true, format!("Running procedure {}", request.identifier)).await;

        let queue = request
            .queue
            .unwrap_or_else(|| self.config.default_queue.clone());
        let execution = ProcedureExecution::new(
            request.identifier,
            queue.clone(),
            request.args_kwargs.unwrap_or_default(),
        );
        if let Err(e) = self.helper.push(&queue, &execution).await {
            error!(queue = %queue, error = %e, "Failed to queue execution");
            return None;
        }
        self.notify(&queue, QueueBucket::Execution).await;

        let mut state = self.state.lock().await;
        state
            .executions
            .insert(execution.execution_id.clone(), execution.clone());
        if state.shutting_down {
            // Shutdown began after validation.
            warn!(queue = %queue, "Manager shutting down, execution left pending");
        } else if !state.workers.contains_key(&queue) {
            self.submit_worker(&mut state, &queue);
        }
        Some(execution)
    }

    /// Submit a worker task for `queue` and record its entry. Caller holds
    /// the state lock and has checked no entry exists.
    fn submit_worker(self: &Arc<Self>, state: &mut ManagerState, queue: &str) {
        let (task, registration) = AbortHandle::new_pair();
        let (done_tx, done) = watch::channel(false);
        let generation = state.next_generation;
        state.next_generation += 1;
        state.workers.insert(
            queue.to_string(),
            WorkerEntry {
                worker: None,
                task,
                done,
                generation,
            },
        );
        self.pool_tasks.fetch_add(1, Ordering::SeqCst);
        debug!(queue, generation, "Submitted worker task");

        let manager = Arc::clone(self);
        let queue = queue.to_string();
        tokio::spawn(async move {
            let pooled = Abortable::new(Arc::clone(&manager).pooled(queue.clone()), registration);
            let outcome = match tokio::spawn(pooled).await {
                Ok(Ok(Ok(()))) => TaskOutcome::Completed,
                Ok(Ok(Err(e))) => TaskOutcome::Failed(e),
                Ok(Err(_aborted)) => TaskOutcome::Cancelled,
                Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
                Err(e) => TaskOutcome::Panicked(e.to_string()),
            };
            log_on_end(&queue, &outcome);
            manager.cleanup(&queue, generation, &outcome).await;
            let _ = done_tx.send(true);
        });
    }

    /// Wait for a pool slot, then run the worker.
    async fn pooled(self: Arc<Self>, queue: String) -> Result<(), WorkerError> {
        let _permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::PoolClosed)?;
        self.spawn(&queue).await
    }

    /// Construct the worker for `queue`, attach it to the queue's entry and
    /// run it until it exits.
    pub async fn spawn(&self, queue: &str) -> Result<(), WorkerError> {
        let worker = {
            let mut state = self.state.lock().await;
            let entry = state
                .workers
                .get_mut(queue)
                .ok_or_else(|| WorkerError::NotRegistered {
                    queue: queue.to_string(),
                })?;
            if entry.worker.is_some() {
                return Err(WorkerError::AlreadyExists {
                    queue: queue.to_string(),
                });
            }
            let worker = self
                .factory
                .create(queue, self.helper.clone(), self.config.queue_timeout);
            entry.worker = Some(Arc::clone(&worker));
            worker
        };
        info!(queue, "Spawned procedure worker");
        run_scoped(worker).await
    }

    /// Runs after every worker task, however it ended.
    async fn cleanup(self: &Arc<Self>, queue: &str, generation: u64, outcome: &TaskOutcome) {
        debug!(queue, "Cleaning up worker");
        let (worker, callbacks, orphaned) = {
            let mut state = self.state.lock().await;
            if state
                .workers
                .get(queue)
                .is_none_or(|entry| entry.generation != generation)
            {
                error!(queue, "Attempted to clean up nonexistent worker");
                return;
            }

            // Popped but never completed.
            let orphaned = match self.helper.move_active_to_unhandled(Some(queue)).await {
                Ok(queues) => !queues.is_empty(),
                Err(e) => {
                    error!(queue, error = %e, "Failed to move active executions to unhandled");
                    false
                }
            };

            let entry = state.workers.remove(queue);
            let pending = match self.helper.pending(queue).await {
                Ok(pending) => pending,
                Err(e) => {
                    error!(queue, error = %e, "Failed to read pending executions");
                    Vec::new()
                }
            };
            let still_pending: HashSet<&str> =
                pending.iter().map(|e| e.execution_id.as_str()).collect();
            state
                .executions
                .retain(|id, e| e.queue != queue || still_pending.contains(id.as_str()));

            let worker = entry.and_then(|e| e.worker);

            // Items that arrived after the worker's last pop. A worker that
            // died or never started is not replaced.
            let finished = worker
                .as_ref()
                .is_some_and(|w| w.status() == Some(WorkerStatus::Finished));
            if matches!(outcome, TaskOutcome::Completed)
                && finished
                && !state.shutting_down
                && !pending.is_empty()
            {
                info!(queue, pending = pending.len(), "Restarting worker for late arrivals");
                self.submit_worker(&mut state, queue);
            }

            let callbacks = if worker.is_some() {
                state.callbacks.remove(queue).unwrap_or_default()
            } else {
                Vec::new()
            };
            (worker, callbacks, orphaned)
        };

        if let Some(worker) = worker {
            if worker.status() == Some(WorkerStatus::Dead) {
                warn!(queue, "Worker was lost before reporting FINISHED");
            }
            for callback in callbacks {
                callback(Arc::clone(&worker));
            }
        }
        self.notify(queue, QueueBucket::Execution).await;
        if orphaned {
            self.notify(queue, QueueBucket::Unhandled).await;
        }
    }

    /// Register a one-shot observer for the current worker on `queue`.
    pub async fn add_callback<F>(&self, queue: &str, callback: F)
    where
        F: FnOnce(Arc<dyn ProcedureWorker>) + Send + 'static,
    {
        self.state
            .lock()
            .await
            .callbacks
            .entry(queue.to_string())
            .or_default()
            .push(Box::new(callback));
    }

    // ── Abort ───────────────────────────────────────────────────────

    /// Abort at every granularity set in `message`.
    pub async fn abort(&self, message: ProcedureAbort) {
        if message.abort_all {
            self.abort_all().await;
        }
        if let Some(queue) = &message.queue {
            self.abort_queue(queue).await;
        }
        if let Some(execution_id) = &message.execution_id {
            self.abort_execution(execution_id).await;
        }
    }

    /// Remove a pending execution or stop it where it runs, then park it in
    /// unhandled.
    pub async fn abort_execution(&self, execution_id: &str) {
        let (execution, workers) = {
            let mut state = self.state.lock().await;
            let Some(execution) = state.executions.remove(execution_id) else {
                warn!(execution_id, "Procedure execution not known");
                return;
            };
            let workers: Vec<Arc<dyn ProcedureWorker>> =
                state.workers.values().filter_map(|e| e.worker.clone()).collect();
            (execution, workers)
        };
        let queue = execution.queue.as_str();

        match self.helper.remove_pending(&execution).await {
            Ok(true) => {
                debug!(execution_id, queue, "Removed execution from queue");
                self.notify(queue, QueueBucket::Execution).await;
            }
            Ok(false) => match self.is_active(queue, execution_id).await {
                Ok(true) => {
                    for worker in workers {
                        worker.abort_execution(execution_id).await;
                    }
                }
                Ok(false) => {
                    warn!(execution_id, queue, "Procedure execution already completed");
                    return;
                }
                Err(e) => {
                    error!(execution_id, error = %e, "Failed to read active executions");
                    return;
                }
            },
            Err(e) => error!(execution_id, error = %e, "Failed to remove pending execution"),
        }

        match self.helper.push_unhandled(queue, &execution).await {
            Ok(()) => self.notify(queue, QueueBucket::Unhandled).await,
            Err(e) => error!(execution_id, error = %e, "Failed to move execution to unhandled"),
        }
    }

    async fn is_active(&self, queue: &str, execution_id: &str) -> Result<bool, BrokerError> {
        Ok(self
            .helper
            .active(Some(queue))
            .await?
            .iter()
            .any(|e| e.execution_id == execution_id))
    }

    /// Move a queue's pending work to unhandled and stop its worker.
    pub async fn abort_queue(&self, queue: &str) {
        let moved = match self.helper.move_queue_to_unhandled(queue).await {
            Ok(moved) => moved,
            Err(e) => {
                error!(queue, error = %e, "Failed to move queue to unhandled");
                0
            }
        };

        let entry = {
            let state = self.state.lock().await;
            state
                .workers
                .get(queue)
                .map(|e| (e.worker.clone(), e.task.clone(), e.done.clone()))
        };
        match entry {
            Some((worker, task, done)) => {
                if let Some(worker) = worker {
                    worker.abort().await;
                }
                task.abort();
                self.wait_for_tasks(vec![done]).await;
                info!(queue, moved, "Aborted queue");
            }
            None => warn!(queue, "Received abort request for unknown queue"),
        }

        self.notify(queue, QueueBucket::Execution).await;
        if moved > 0 {
            self.notify(queue, QueueBucket::Unhandled).await;
        }
    }

    /// Stop every worker and move every queue's pending work to unhandled.
    pub async fn abort_all(&self) {
        match self.helper.move_all_to_unhandled().await {
            Ok(queues) => {
                for queue in &queues {
                    self.notify(queue, QueueBucket::Execution).await;
                    self.notify(queue, QueueBucket::Unhandled).await;
                }
            }
            Err(e) => error!(error = %e, "Failed to move queues to unhandled"),
        }

        let entries = self.snapshot_entries().await;
        for (worker, _, _) in &entries {
            if let Some(worker) = worker {
                worker.abort().await;
            }
        }
        for (_, task, _) in &entries {
            task.abort();
        }
        self.wait_for_tasks(entries.into_iter().map(|(_, _, done)| done).collect())
            .await;
        info!("Aborted all procedure workers");
    }

    async fn snapshot_entries(
        &self,
    ) -> Vec<(Option<Arc<dyn ProcedureWorker>>, AbortHandle, watch::Receiver<bool>)> {
        self.state
            .lock()
            .await
            .workers
            .values()
            .map(|e| (e.worker.clone(), e.task.clone(), e.done.clone()))
            .collect()
    }

    /// Wait, bounded by the shutdown timeout, for tasks to finish cleanup.
    async fn wait_for_tasks(&self, done: Vec<watch::Receiver<bool>>) {
        let waits = done.into_iter().map(|mut rx| async move {
            let _ = rx.wait_for(|finished| *finished).await;
        });
        if tokio::time::timeout(self.config.shutdown_timeout, join_all(waits))
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.config.shutdown_timeout,
                "Workers did not finish within the shutdown timeout"
            );
        }
    }

    // ── Unhandled ───────────────────────────────────────────────────

    /// Purge unhandled executions. Active work is never touched.
    pub async fn clear_unhandled(&self, message: ProcedureClearUnhandled) {
        if message.abort_all {
            match self.helper.clear_all_unhandled().await {
                Ok(queues) => {
                    for queue in &queues {
                        self.notify(queue, QueueBucket::Unhandled).await;
                    }
                }
                Err(e) => error!(error = %e, "Failed to clear unhandled executions"),
            }
        }
        if let Some(queue) = &message.queue {
            match self.helper.clear_unhandled_queue(queue).await {
                Ok(()) => self.notify(queue, QueueBucket::Unhandled).await,
                Err(e) => error!(queue = %queue, error = %e, "Failed to clear unhandled queue"),
            }
        }
        if let Some(execution_id) = &message.execution_id {
            match self.helper.clear_unhandled_execution(execution_id).await {
                Ok(Some(queue)) => self.notify(&queue, QueueBucket::Unhandled).await,
                Ok(None) => warn!(execution_id = %execution_id, "No unhandled execution with this id"),
                Err(e) => error!(execution_id = %execution_id, error = %e, "Failed to clear unhandled execution"),
            }
        }
    }

    // ── Lifecycle and introspection ─────────────────────────────────

    /// Stop listening, cancel workers that have not started, abort those
    /// that have, and wait (bounded) for all of them.
    pub async fn shutdown(&self) {
        info!("Shutting down procedure manager");
        for listener in self.listener_handles().drain(..) {
            listener.abort();
        }

        let entries = {
            let mut state = self.state.lock().await;
            state.shutting_down = true;
            state
                .workers
                .values()
                .map(|e| (e.worker.clone(), e.task.clone(), e.done.clone()))
                .collect::<Vec<_>>()
        };
        for (worker, task, _) in &entries {
            match worker {
                None => task.abort(),
                // Unblock it so it shuts down on its own.
                Some(worker) => worker.abort().await,
            }
        }
        self.wait_for_tasks(entries.iter().map(|(_, _, done)| done.clone()).collect())
            .await;
        for (_, task, _) in &entries {
            task.abort();
        }
        self.pool.close();
        info!("Procedure manager shut down");
    }

    /// Queues with a live worker task, sorted.
    pub async fn active_workers(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.state.lock().await.workers.keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Status per live queue; `None` until the worker has been constructed
    /// and reported.
    pub async fn worker_statuses(&self) -> BTreeMap<String, Option<WorkerStatus>> {
        self.state
            .lock()
            .await
            .workers
            .iter()
            .map(|(queue, e)| (queue.clone(), e.worker.as_ref().and_then(|w| w.status())))
            .collect()
    }

    /// The worker currently attached to `queue`.
    pub async fn worker(&self, queue: &str) -> Option<Arc<dyn ProcedureWorker>> {
        self.state
            .lock()
            .await
            .workers
            .get(queue)
            .and_then(|e| e.worker.clone())
    }

    /// Ids of executions the manager still tracks.
    pub async fn tracked_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.executions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Worker tasks submitted to the pool since start.
    pub fn pool_tasks_submitted(&self) -> usize {
        self.pool_tasks.load(Ordering::SeqCst)
    }

    pub fn helper(&self) -> &ExecutionQueueHelper {
        &self.helper
    }

    async fn notify(&self, queue: &str, bucket: QueueBucket) {
        if let Err(e) = self.helper.notify_watchers(queue, bucket).await {
            warn!(queue, bucket = %bucket, error = %e, "Failed to notify watchers");
        }
    }
}

fn log_on_end(queue: &str, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Completed => info!(queue, "Procedure worker shut down gracefully"),
        TaskOutcome::Cancelled => info!(queue, "Procedure worker cancelled"),
        TaskOutcome::Failed(e) => error!(queue, error = %e, "Worker failed"),
        TaskOutcome::Panicked(e) => error!(queue, error = %e, "Worker panicked"),
    }
}
