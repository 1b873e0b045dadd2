//! Asynchronous execution worker.
//!
//! Executions are created `pending` by the store. This crate claims them,
//! hands them to an [`ExecutionRunner`] and reports the outcome back through
//! the store's guarded transitions, so a cancellation that lands first always
//! wins over a late completion.
//!
//! A claim whose worker gave up on it (a timed-out store call, a failed
//! completion) stays `running` in the store. The poller sweeps such claims
//! once they are older than any live worker could hold them and completes
//! them as `failed`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agent_market_core::{
    ErrorKind, ExecutionId, ExecutionReport, ExecutionStatus, MarketError, UserId, WorkflowId,
};
use agent_market_store_sqlite::{SqliteMarketStore, StoreConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    /// Upper bound for a single store call. Must exceed the store's busy
    /// timeout so a lock wait fails inside the store before the worker stops
    /// waiting on it.
    pub operation_timeout_ms: u64,
    /// Upper bound for a single runner invocation.
    pub run_timeout_ms: u64,
    pub simulated_run_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 256,
            poll_interval_ms: 1000,
            operation_timeout_ms: 10_000,
            run_timeout_ms: 30_000,
            simulated_run_ms: 5000,
        }
    }
}

impl WorkerConfig {
    /// # Errors
    /// Returns [`MarketError::Validation`] for a zero concurrency, queue
    /// capacity, poll interval or timeout.
    pub fn validate(&self) -> Result<(), MarketError> {
        let zero_field = [
            ("concurrency", self.concurrency == 0),
            ("queue_capacity", self.queue_capacity == 0),
            ("poll_interval_ms", self.poll_interval_ms == 0),
            ("operation_timeout_ms", self.operation_timeout_ms == 0),
            ("run_timeout_ms", self.run_timeout_ms == 0),
        ]
        .into_iter()
        .find_map(|(field, is_zero)| is_zero.then_some(field));

        match zero_field {
            Some(field) => Err(MarketError::Validation(format!("{field} MUST be >= 1"))),
            None => Ok(()),
        }
    }

    /// # Errors
    /// Returns [`MarketError::Validation`] when `operation_timeout_ms` does
    /// not exceed the store's busy timeout.
    pub fn validate_with_store(&self, store_config: &StoreConfig) -> Result<(), MarketError> {
        self.validate()?;
        store_config.validate()?;
        if self.operation_timeout_ms <= store_config.busy_timeout_ms {
            return Err(MarketError::Validation(format!(
                "operation_timeout_ms MUST be > busy_timeout_ms ({})",
                store_config.busy_timeout_ms
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Longest a live worker can hold a claim: the run plus the claim and
    /// completion store calls.
    fn stall_after(&self) -> Duration {
        self.run_timeout()
            .saturating_add(self.operation_timeout().saturating_mul(2))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{label} timed out after {timeout_ms} ms")]
    Timeout { label: &'static str, timeout_ms: u64 },
    #[error("{label} join failure: {message}")]
    Join { label: &'static str, message: String },
    #[error("execution queue is closed")]
    QueueClosed,
    #[error(transparent)]
    Market(#[from] MarketError),
}

impl WorkerError {
    /// The execution already moved on; the caller's work is moot.
    fn is_stale(&self) -> bool {
        matches!(
            self,
            Self::Market(err) if matches!(err.kind(), ErrorKind::Conflict | ErrorKind::NotFound)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExecutionJob {
    pub execution_id: ExecutionId,
}

/// Everything a runner gets to see about one execution.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub user_id: UserId,
    pub definition: Value,
    pub input_data: Value,
}

/// Performs the work behind an execution.
///
/// Runs on the blocking pool. Cancellation is cooperative: a run is never
/// interrupted, its report is simply discarded if the execution was
/// cancelled meanwhile.
pub trait ExecutionRunner: Send + Sync + 'static {
    /// # Errors
    /// Any error completes the execution as `failed` with its message.
    fn run(&self, context: &ExecutionContext) -> anyhow::Result<ExecutionReport>;
}

/// Stand-in runner that sleeps and then succeeds.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedRunner {
    delay: Duration,
}

impl SimulatedRunner {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ExecutionRunner for SimulatedRunner {
    fn run(&self, context: &ExecutionContext) -> anyhow::Result<ExecutionReport> {
        std::thread::sleep(self.delay);
        Ok(ExecutionReport::success(
            json!({
                "result": "ok",
                "workflow_id": context.workflow_id.to_string(),
            }),
            format!("simulated run finished after {} ms", self.delay.as_millis()),
        ))
    }
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct WorkerTelemetry {
    jobs_dispatched_total: AtomicU64,
    jobs_skipped_total: AtomicU64,
    executions_succeeded_total: AtomicU64,
    executions_failed_total: AtomicU64,
    completions_discarded_total: AtomicU64,
    executions_recovered_total: AtomicU64,
    timeout_total: AtomicU64,
    store_error_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct WorkerTelemetrySnapshot {
    pub jobs_dispatched_total: u64,
    pub jobs_skipped_total: u64,
    pub executions_succeeded_total: u64,
    pub executions_failed_total: u64,
    pub completions_discarded_total: u64,
    pub executions_recovered_total: u64,
    pub timeout_total: u64,
    pub store_error_total: u64,
}

impl WorkerTelemetry {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerTelemetrySnapshot {
        WorkerTelemetrySnapshot {
            jobs_dispatched_total: self.jobs_dispatched_total.load(Ordering::Relaxed),
            jobs_skipped_total: self.jobs_skipped_total.load(Ordering::Relaxed),
            executions_succeeded_total: self.executions_succeeded_total.load(Ordering::Relaxed),
            executions_failed_total: self.executions_failed_total.load(Ordering::Relaxed),
            completions_discarded_total: self.completions_discarded_total.load(Ordering::Relaxed),
            executions_recovered_total: self.executions_recovered_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            store_error_total: self.store_error_total.load(Ordering::Relaxed),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct Shared {
    db_path: PathBuf,
    store_config: StoreConfig,
    config: WorkerConfig,
    runner: Arc<dyn ExecutionRunner>,
    telemetry: WorkerTelemetry,
    in_flight: Mutex<HashSet<ExecutionId>>,
}

impl Shared {
    fn in_flight(&self) -> MutexGuard<'_, HashSet<ExecutionId>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens a fresh store connection on the blocking pool and runs `op`
    /// under the operation timeout.
    async fn run_blocking<T, F>(&self, label: &'static str, op: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteMarketStore) -> Result<T, MarketError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        let store_config = self.store_config;
        let handle = tokio::task::spawn_blocking(move || {
            let mut store = SqliteMarketStore::open_with_config(&db_path, store_config)?;
            op(&mut store)
        });

        let timeout = self.config.operation_timeout();
        let join_result = tokio::time::timeout(timeout, handle).await.map_err(|_| {
            WorkerTelemetry::bump(&self.telemetry.timeout_total);
            WorkerError::Timeout {
                label,
                timeout_ms: millis(timeout),
            }
        })?;
        let op_result = join_result.map_err(|err| WorkerError::Join {
            label,
            message: err.to_string(),
        })?;
        Ok(op_result?)
    }

    async fn process(&self, job: ExecutionJob) {
        self.execute(job).await;
        self.in_flight().remove(&job.execution_id);
    }

    async fn execute(&self, job: ExecutionJob) {
        let execution_id = job.execution_id;
        let claimed = self
            .run_blocking("claim execution", move |store| {
                let execution = store.get_execution_by_id(execution_id)?;
                let workflow = store.get_workflow(&execution.user_id, execution.workflow_id)?;
                store.mark_running(execution_id)?;
                Ok(ExecutionContext {
                    execution_id,
                    workflow_id: execution.workflow_id,
                    user_id: execution.user_id,
                    definition: workflow.definition,
                    input_data: execution.input_data,
                })
            })
            .await;

        let context = match claimed {
            Ok(context) => context,
            Err(err) if err.is_stale() => {
                WorkerTelemetry::bump(&self.telemetry.jobs_skipped_total);
                debug!(execution_id = %execution_id, error = %err, "execution no longer claimable");
                return;
            }
            Err(err) => {
                WorkerTelemetry::bump(&self.telemetry.store_error_total);
                if matches!(err, WorkerError::Timeout { .. }) {
                    warn!(
                        execution_id = %execution_id,
                        error = %err,
                        "execution claim timed out; a late claim is left to the stalled sweep"
                    );
                } else {
                    warn!(execution_id = %execution_id, error = %err, "execution claim failed");
                }
                return;
            }
        };

        let report = self.invoke_runner(context).await;
        let completion = self
            .run_blocking("complete execution", move |store| {
                store.complete_execution(execution_id, &report)
            })
            .await;

        match completion {
            Ok(done) => {
                if done.status == ExecutionStatus::Success {
                    WorkerTelemetry::bump(&self.telemetry.executions_succeeded_total);
                } else {
                    WorkerTelemetry::bump(&self.telemetry.executions_failed_total);
                }
                info!(
                    execution_id = %execution_id,
                    status = %done.status,
                    duration_ms = done.duration_ms,
                    "execution finished"
                );
            }
            Err(err) if err.is_stale() => {
                WorkerTelemetry::bump(&self.telemetry.completions_discarded_total);
                info!(execution_id = %execution_id, error = %err, "late completion discarded");
            }
            Err(err) => {
                WorkerTelemetry::bump(&self.telemetry.store_error_total);
                warn!(execution_id = %execution_id, error = %err, "execution completion failed");
            }
        }
    }

    /// Fails every stalled claim not held by this pool. Returns how many were
    /// recovered.
    async fn recover_stalled(&self) -> Result<usize, WorkerError> {
        let limit = u32::try_from(self.config.queue_capacity).unwrap_or(u32::MAX);
        let stall_after = self.config.stall_after();
        let stalled = self
            .run_blocking("list stalled executions", move |store| {
                store.list_stalled_executions(stall_after, limit)
            })
            .await?;

        let mut recovered = 0;
        for execution_id in stalled {
            if !self.in_flight().insert(execution_id) {
                continue;
            }
            let report = ExecutionReport::failed(format!(
                "execution abandoned by its worker after {} ms",
                millis(stall_after)
            ));
            let outcome = self
                .run_blocking("recover stalled execution", move |store| {
                    store.complete_execution(execution_id, &report)
                })
                .await;
            self.in_flight().remove(&execution_id);

            match outcome {
                Ok(_) => {
                    recovered += 1;
                    WorkerTelemetry::bump(&self.telemetry.executions_recovered_total);
                    warn!(execution_id = %execution_id, "stalled execution failed");
                }
                Err(err) if err.is_stale() => {
                    debug!(execution_id = %execution_id, error = %err, "stalled execution settled meanwhile");
                }
                Err(err) => {
                    WorkerTelemetry::bump(&self.telemetry.store_error_total);
                    warn!(execution_id = %execution_id, error = %err, "stalled execution recovery failed");
                }
            }
        }
        Ok(recovered)
    }

    async fn invoke_runner(&self, context: ExecutionContext) -> ExecutionReport {
        let runner = Arc::clone(&self.runner);
        let timeout = self.config.run_timeout();
        let handle = tokio::task::spawn_blocking(move || runner.run(&context));

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(report))) => match report.validate() {
                Ok(()) => report,
                Err(err) => ExecutionReport::failed(format!("runner returned {err}")),
            },
            Ok(Ok(Err(err))) => ExecutionReport::failed(format!("{err:#}")),
            Ok(Err(err)) => ExecutionReport::failed(format!("runner join failure: {err}")),
            Err(_) => {
                WorkerTelemetry::bump(&self.telemetry.timeout_total);
                ExecutionReport::failed(format!(
                    "execution timed out after {} ms",
                    millis(timeout)
                ))
            }
        }
    }
}

/// Fixed set of tasks draining a bounded job queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    sender: mpsc::Sender<ExecutionJob>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.concurrency` worker tasks. Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    /// Returns [`WorkerError::Market`] when either configuration is invalid
    /// or the two disagree on timeouts.
    pub fn start(
        db_path: impl Into<PathBuf>,
        store_config: StoreConfig,
        config: WorkerConfig,
        runner: Arc<dyn ExecutionRunner>,
    ) -> Result<Self, WorkerError> {
        config.validate_with_store(&store_config)?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared {
            db_path: db_path.into(),
            store_config,
            config,
            runner,
            telemetry: WorkerTelemetry::default(),
            in_flight: Mutex::new(HashSet::new()),
        });

        let workers = (0..config.concurrency)
            .map(|worker_index| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job) = next else {
                            break;
                        };
                        shared.process(job).await;
                    }
                    debug!(worker_index, "execution worker stopped");
                })
            })
            .collect();

        info!(
            concurrency = config.concurrency,
            queue_capacity = config.queue_capacity,
            db = %shared.db_path.display(),
            "execution worker pool started"
        );
        Ok(Self {
            shared,
            sender,
            workers,
        })
    }

    /// Queues one job, waiting for queue space. Returns `false` when the
    /// execution is already queued or running here.
    ///
    /// # Errors
    /// Returns [`WorkerError::QueueClosed`] after the workers have stopped.
    pub async fn dispatch(&self, job: ExecutionJob) -> Result<bool, WorkerError> {
        if !self.shared.in_flight().insert(job.execution_id) {
            return Ok(false);
        }
        if self.sender.send(job).await.is_err() {
            self.shared.in_flight().remove(&job.execution_id);
            return Err(WorkerError::QueueClosed);
        }
        WorkerTelemetry::bump(&self.shared.telemetry.jobs_dispatched_total);
        Ok(true)
    }

    /// Fails stalled claims, then queues every `pending` execution not
    /// already in flight and returns how many were queued. Stops early,
    /// without waiting, once the queue is full.
    ///
    /// # Errors
    /// Fails when a listing fails or the queue is closed.
    pub async fn poll_pending_once(&self) -> Result<usize, WorkerError> {
        let recovered = self.shared.recover_stalled().await?;
        if recovered > 0 {
            info!(recovered, "stalled executions failed");
        }

        let limit = u32::try_from(self.shared.config.queue_capacity).unwrap_or(u32::MAX);
        let pending = self
            .shared
            .run_blocking("list pending executions", move |store| {
                store.list_pending_executions(limit)
            })
            .await?;

        let mut dispatched = 0;
        for execution_id in pending {
            if !self.shared.in_flight().insert(execution_id) {
                continue;
            }
            match self.sender.try_send(ExecutionJob { execution_id }) {
                Ok(()) => {
                    dispatched += 1;
                    WorkerTelemetry::bump(&self.shared.telemetry.jobs_dispatched_total);
                }
                Err(TrySendError::Full(_)) => {
                    self.shared.in_flight().remove(&execution_id);
                    debug!(dispatched, "execution queue full");
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.shared.in_flight().remove(&execution_id);
                    return Err(WorkerError::QueueClosed);
                }
            }
        }

        if dispatched > 0 {
            debug!(dispatched, "pending executions dispatched");
        }
        Ok(dispatched)
    }

    #[must_use]
    pub fn telemetry(&self) -> WorkerTelemetrySnapshot {
        self.shared.telemetry.snapshot()
    }

    /// Closes the queue, lets the workers drain what is already queued and
    /// waits for them to stop.
    pub async fn shutdown(self) -> WorkerTelemetrySnapshot {
        let Self {
            shared,
            sender,
            workers,
        } = self;
        drop(sender);
        for handle in workers {
            if let Err(err) = handle.await {
                warn!(error = %err, "execution worker ended abnormally");
            }
        }
        let snapshot = shared.telemetry.snapshot();
        info!(
            succeeded = snapshot.executions_succeeded_total,
            failed = snapshot.executions_failed_total,
            discarded = snapshot.completions_discarded_total,
            "execution worker pool stopped"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_market_core::{Execution, WorkflowInput, WorkflowStatus};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    struct Fixture {
        db_path: PathBuf,
        user_id: UserId,
        workflow_id: WorkflowId,
    }

    impl Fixture {
        fn new() -> Self {
            let db_path = std::env::temp_dir().join(format!(
                "agent-market-worker-{}.sqlite3",
                ulid::Ulid::new()
            ));
            let mut store = must(SqliteMarketStore::open(&db_path));
            must(store.migrate());
            let user_id = must(UserId::parse("alice"));
            must(store.register_user(&user_id));
            let workflow = must(store.create_workflow(
                &user_id,
                &WorkflowInput {
                    name: "Nightly sync".to_string(),
                    description: String::new(),
                    definition: json!({"steps": [{"kind": "noop"}]}),
                    status: WorkflowStatus::Active,
                },
            ));
            Self {
                db_path,
                user_id,
                workflow_id: workflow.workflow_id,
            }
        }

        fn store(&self) -> SqliteMarketStore {
            must(SqliteMarketStore::open(&self.db_path))
        }

        fn start(&self) -> ExecutionId {
            let execution =
                must(self.store().start_execution(self.workflow_id, &self.user_id, json!({"n": 1})));
            execution.execution_id
        }

        fn load(&self, execution_id: ExecutionId) -> Execution {
            must(self.store().get_execution(&self.user_id, execution_id))
        }

        fn pool(&self, config: WorkerConfig, runner: Arc<dyn ExecutionRunner>) -> WorkerPool {
            let store_config = StoreConfig {
                busy_timeout_ms: config.operation_timeout_ms / 2,
                ..StoreConfig::default()
            };
            must(WorkerPool::start(
                self.db_path.clone(),
                store_config,
                config,
                runner,
            ))
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            queue_capacity: 8,
            poll_interval_ms: 10,
            operation_timeout_ms: 2500,
            run_timeout_ms: 2500,
            simulated_run_ms: 5,
        }
    }

    struct FailingRunner;

    impl ExecutionRunner for FailingRunner {
        fn run(&self, _context: &ExecutionContext) -> anyhow::Result<ExecutionReport> {
            Err(anyhow::anyhow!("upstream refused the request"))
        }
    }

    /// Blocks each run until the test releases it.
    struct GateRunner {
        entered: std::sync::mpsc::Sender<ExecutionId>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ExecutionRunner for GateRunner {
        fn run(&self, context: &ExecutionContext) -> anyhow::Result<ExecutionReport> {
            let _ = self.entered.send(context.execution_id);
            let release = self
                .release
                .lock()
                .map_err(|_| anyhow::anyhow!("gate lock poisoned"))?;
            release.recv_timeout(Duration::from_secs(5))?;
            Ok(ExecutionReport::success(json!({"gated": true}), "released"))
        }
    }

    fn gate() -> (
        Arc<GateRunner>,
        std::sync::mpsc::Receiver<ExecutionId>,
        std::sync::mpsc::Sender<()>,
    ) {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let runner = Arc::new(GateRunner {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });
        (runner, entered_rx, release_tx)
    }

    async fn wait_entered(entered: std::sync::mpsc::Receiver<ExecutionId>) -> ExecutionId {
        let waited = tokio::task::spawn_blocking(move || {
            entered.recv_timeout(Duration::from_secs(5))
        })
        .await;
        must(must(waited))
    }

    #[test]
    fn config_rejects_zero_values() {
        assert!(WorkerConfig::default().validate().is_ok());
        let config = WorkerConfig {
            concurrency: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(MarketError::Validation(_))));
        let config = WorkerConfig {
            run_timeout_ms: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(MarketError::Validation(_))));
    }

    #[test]
    fn config_requires_operation_timeout_above_busy_timeout() {
        let store_config = StoreConfig::default();
        assert!(WorkerConfig::default().validate_with_store(&store_config).is_ok());

        let config = WorkerConfig {
            operation_timeout_ms: store_config.busy_timeout_ms,
            ..WorkerConfig::default()
        };
        assert!(matches!(
            config.validate_with_store(&store_config),
            Err(MarketError::Validation(message)) if message.contains("busy_timeout_ms")
        ));
        assert!(WorkerPool::start(
            std::env::temp_dir().join("agent-market-worker-unused.sqlite3"),
            store_config,
            config,
            Arc::new(SimulatedRunner::new(Duration::ZERO)),
        )
        .is_err());
    }

    async fn wait_for(pool: &WorkerPool, done: impl Fn(&WorkerTelemetrySnapshot) -> bool) {
        for _ in 0..500 {
            if done(&pool.telemetry()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker telemetry never reached the expected state");
    }

    #[tokio::test]
    async fn run_blocking_times_out_for_slow_store_operation() {
        let fixture = Fixture::new();
        let config = WorkerConfig {
            operation_timeout_ms: 1,
            ..test_config()
        };
        let pool = fixture.pool(config, Arc::new(SimulatedRunner::new(Duration::ZERO)));

        let result = pool
            .shared
            .run_blocking("unit slow operation", |_store| {
                std::thread::sleep(Duration::from_millis(25));
                Ok(())
            })
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert!(matches!(err, WorkerError::Timeout { .. }));
                assert!(err.to_string().contains("timed out"));
            }
        }
        assert_eq!(pool.shutdown().await.timeout_total, 1);
    }

    #[tokio::test]
    async fn pool_runs_pending_execution_to_success() {
        let fixture = Fixture::new();
        let execution_id = fixture.start();
        let pool = fixture.pool(test_config(), Arc::new(SimulatedRunner::new(Duration::from_millis(5))));

        assert_eq!(must(pool.poll_pending_once().await), 1);
        let snapshot = pool.shutdown().await;

        let execution = fixture.load(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(
            execution.output_data,
            Some(json!({"result": "ok", "workflow_id": fixture.workflow_id.to_string()}))
        );
        assert!(execution.duration_ms.is_some());
        assert_eq!(snapshot.jobs_dispatched_total, 1);
        assert_eq!(snapshot.executions_succeeded_total, 1);
    }

    #[tokio::test]
    async fn runner_error_completes_as_failed() {
        let fixture = Fixture::new();
        let execution_id = fixture.start();
        let pool = fixture.pool(test_config(), Arc::new(FailingRunner));

        let _ = must(pool.dispatch(ExecutionJob { execution_id }).await);
        let snapshot = pool.shutdown().await;

        let execution = fixture.load(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.error_message.as_deref(),
            Some("upstream refused the request")
        );
        assert_eq!(snapshot.executions_failed_total, 1);
    }

    #[tokio::test]
    async fn runner_timeout_completes_as_failed() {
        let fixture = Fixture::new();
        let execution_id = fixture.start();
        let config = WorkerConfig {
            run_timeout_ms: 10,
            ..test_config()
        };
        let pool = fixture.pool(config, Arc::new(SimulatedRunner::new(Duration::from_millis(200))));

        let _ = must(pool.dispatch(ExecutionJob { execution_id }).await);
        let snapshot = pool.shutdown().await;

        let execution = fixture.load(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution
            .error_message
            .is_some_and(|message| message.contains("timed out")));
        assert_eq!(snapshot.timeout_total, 1);
    }

    #[tokio::test]
    async fn cancel_during_run_discards_late_completion() {
        let fixture = Fixture::new();
        let execution_id = fixture.start();
        let (runner, entered, release) = gate();
        let pool = fixture.pool(test_config(), runner);

        assert_eq!(must(pool.poll_pending_once().await), 1);
        assert_eq!(wait_entered(entered).await, execution_id);

        let cancelled = must(fixture.store().cancel_execution(execution_id, &fixture.user_id));
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        must(release.send(()));
        let snapshot = pool.shutdown().await;

        let execution = fixture.load(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.completed_at, cancelled.completed_at);
        assert_eq!(execution.output_data, None);
        assert_eq!(snapshot.completions_discarded_total, 1);
        assert_eq!(snapshot.executions_succeeded_total, 0);
    }

    #[tokio::test]
    async fn poll_skips_jobs_already_queued() {
        let fixture = Fixture::new();
        let first = fixture.start();
        let second = fixture.start();
        let (runner, entered, release) = gate();
        let config = WorkerConfig {
            concurrency: 1,
            ..test_config()
        };
        let pool = fixture.pool(config, runner);

        assert_eq!(must(pool.poll_pending_once().await), 2);
        let running = wait_entered(entered).await;
        assert!(running == first || running == second);
        assert_eq!(must(pool.poll_pending_once().await), 0);
        assert!(!must(pool.dispatch(ExecutionJob { execution_id: first }).await));

        must(release.send(()));
        must(release.send(()));
        let snapshot = pool.shutdown().await;

        assert_eq!(fixture.load(first).status, ExecutionStatus::Success);
        assert_eq!(fixture.load(second).status, ExecutionStatus::Success);
        assert_eq!(snapshot.executions_succeeded_total, 2);
    }

    #[tokio::test]
    async fn cancelled_before_claim_is_skipped() {
        let fixture = Fixture::new();
        let execution_id = fixture.start();
        let _ = must(fixture.store().cancel_execution(execution_id, &fixture.user_id));
        let pool = fixture.pool(test_config(), Arc::new(SimulatedRunner::new(Duration::ZERO)));

        let _ = must(pool.dispatch(ExecutionJob { execution_id }).await);
        let snapshot = pool.shutdown().await;

        assert_eq!(fixture.load(execution_id).status, ExecutionStatus::Cancelled);
        assert_eq!(snapshot.jobs_skipped_total, 1);
        assert_eq!(snapshot.executions_succeeded_total, 0);
    }

    #[tokio::test]
    async fn claim_blocked_by_writer_is_retried_on_next_poll() {
        let fixture = Fixture::new();
        let execution_id = fixture.start();
        let config = WorkerConfig {
            operation_timeout_ms: 400,
            ..test_config()
        };
        let pool = fixture.pool(config, Arc::new(SimulatedRunner::new(Duration::ZERO)));

        let writer = must(rusqlite::Connection::open(&fixture.db_path));
        must(writer.execute_batch("BEGIN IMMEDIATE"));
        assert_eq!(must(pool.poll_pending_once().await), 1);
        wait_for(&pool, |snapshot| snapshot.store_error_total == 1).await;
        must(writer.execute_batch("COMMIT"));

        assert_eq!(fixture.load(execution_id).status, ExecutionStatus::Pending);
        assert_eq!(must(pool.poll_pending_once().await), 1);
        let snapshot = pool.shutdown().await;

        assert_eq!(fixture.load(execution_id).status, ExecutionStatus::Success);
        assert_eq!(snapshot.executions_succeeded_total, 1);
        assert_eq!(snapshot.timeout_total, 0);
    }

    #[tokio::test]
    async fn stalled_claim_is_failed_by_the_poller() {
        let fixture = Fixture::new();
        let execution_id = fixture.start();
        let _ = must(fixture.store().mark_running(execution_id));
        let config = WorkerConfig {
            operation_timeout_ms: 200,
            run_timeout_ms: 10,
            ..test_config()
        };
        let pool = fixture.pool(config, Arc::new(SimulatedRunner::new(Duration::ZERO)));

        assert_eq!(must(pool.poll_pending_once().await), 0);
        assert_eq!(fixture.load(execution_id).status, ExecutionStatus::Running);
        assert_eq!(pool.telemetry().executions_recovered_total, 0);

        tokio::time::sleep(config.stall_after() + Duration::from_millis(100)).await;
        assert_eq!(must(pool.poll_pending_once().await), 0);
        let snapshot = pool.shutdown().await;

        let execution = fixture.load(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution
            .error_message
            .is_some_and(|message| message.contains("abandoned")));
        assert_eq!(snapshot.executions_recovered_total, 1);
        assert!(must(fixture.store().list_pending_executions(10)).is_empty());
    }
}
