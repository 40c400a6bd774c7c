//! Generic per-item worker.
//!
//! A [`Worker`] owns one supervised loop that evaluates its [`Task`] on every
//! interval tick and on every nudge. The task value sits behind its own async
//! mutex so evaluations never overlap and snapshots see a consistent state.
//!
//! A worker given a store with [`Worker::with_checkpoints`] writes its
//! snapshot back to its key after every evaluation that changed it, so a
//! member taking over after a crash resumes from the last recorded state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use fleet_store::CoordinationStore;
use tracing::{debug, info, warn};

use crate::backend::MetricsBackend;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::domain::Domain;
use crate::error::Result;
use crate::task::{TaskHandle, spawn_supervised};

/// What one evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The definition is inactive; nothing was evaluated.
    Inactive,
    /// The backend query failed; state is unchanged.
    QueryFailed,
    /// The condition no longer holds; state was reset.
    Cleared,
    /// The condition holds but not for long enough yet.
    Pending,
    /// The alert is ready but still cooling down.
    CoolingDown,
    /// Every affected instance was already handled.
    Suppressed,
    /// First observation, recorded without firing.
    Recorded,
    /// Nothing changed since the last evaluation.
    Unchanged,
    /// Actions were dispatched.
    Fired(DispatchReport),
}

/// Collaborators handed to every tick.
pub struct TaskContext {
    /// Domain of the item.
    pub domain: Domain,
    /// Store key of the item.
    pub key: String,
    /// Metrics backend for queries.
    pub backend: Arc<dyn MetricsBackend>,
    /// Action dispatcher.
    pub dispatcher: Dispatcher,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("domain", &self.domain)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Behaviour of one work-item kind.
///
/// Runtime tasks are distinct from their persisted definitions: a task is
/// built with [`Task::from_definition`] and persisted with [`Task::snapshot`].
#[async_trait]
pub trait Task: Send + Sync + Sized + 'static {
    /// Persisted form of the task.
    type Definition: Serialize
        + DeserializeOwned
        + Clone
        + PartialEq
        + fmt::Debug
        + Send
        + Sync
        + 'static;

    /// Domain this task kind belongs to.
    const DOMAIN: Domain;

    /// Validates a definition and builds the runtime task.
    fn from_definition(definition: Self::Definition) -> Result<Self>;

    /// Item id from the definition.
    fn id(&self) -> &str;

    /// Evaluation period, or `None` for tasks driven only by nudges.
    fn interval(&self) -> Option<Duration>;

    /// Inactive tasks skip every evaluation.
    fn is_active(&self) -> bool;

    /// Evaluates once at `now`.
    async fn tick(&mut self, now: DateTime<Utc>, ctx: &TaskContext) -> TickOutcome;

    /// Produces the persisted definition, including runtime state.
    fn snapshot(&self) -> Self::Definition;

    /// Clears the runtime state carried by `definition`.
    ///
    /// Two definitions equal after stripping describe the same item
    /// configuration.
    fn strip_state(definition: Self::Definition) -> Self::Definition;

    /// Checks a definition without keeping the task.
    fn validate(definition: &Self::Definition) -> Result<()> {
        Self::from_definition(definition.clone()).map(|_| ())
    }
}

/// Shared collaborators for building workers.
#[derive(Clone)]
pub struct WorkerEnv {
    /// Metrics backend.
    pub backend: Arc<dyn MetricsBackend>,
    /// Action dispatcher.
    pub dispatcher: Dispatcher,
}

impl WorkerEnv {
    /// Creates an environment.
    #[must_use]
    pub fn new(backend: Arc<dyn MetricsBackend>, dispatcher: Dispatcher) -> Self {
        Self { backend, dispatcher }
    }
}

impl fmt::Debug for WorkerEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerEnv")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Built but not started.
    Idle,
    /// Loop running.
    Active,
    /// Stop requested, waiting for the loop.
    Stopping,
    /// Loop exited.
    Stopped,
}

/// Per-worker counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    ticks: AtomicU64,
    query_failures: AtomicU64,
    fires: AtomicU64,
    checkpoints: AtomicU64,
    checkpoint_failures: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    /// Evaluations of an active task.
    pub ticks: u64,
    /// Failed backend queries.
    pub query_failures: u64,
    /// Dispatches.
    pub fires: u64,
    /// Snapshots written back to the store.
    pub checkpoints: u64,
    /// Snapshot writes that failed.
    pub checkpoint_failures: u64,
}

impl WorkerStats {
    fn record(&self, outcome: TickOutcome) {
        if outcome == TickOutcome::Inactive {
            return;
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
        match outcome {
            TickOutcome::QueryFailed => {
                self.query_failures.fetch_add(1, Ordering::Relaxed);
            }
            TickOutcome::Fired(_) => {
                self.fires.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            query_failures: self.query_failures.load(Ordering::Relaxed),
            fires: self.fires.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
        }
    }
}

/// A running work item.
pub struct Worker<T: Task> {
    key: String,
    interval: Option<Duration>,
    task: Arc<AsyncMutex<T>>,
    ctx: Arc<TaskContext>,
    stats: Arc<WorkerStats>,
    nudge: Arc<Notify>,
    checkpoints: Option<Arc<dyn CoordinationStore>>,
    state: Mutex<WorkerState>,
    handle: Mutex<Option<TaskHandle>>,
}

impl<T: Task> Worker<T> {
    /// Decodes a stored definition.
    pub fn decode(data: &[u8]) -> Result<T::Definition> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Builds an idle worker from a definition.
    pub fn new(key: impl Into<String>, definition: T::Definition, env: &WorkerEnv) -> Result<Self> {
        let key = key.into();
        let task = T::from_definition(definition)?;
        let interval = task.interval();
        Ok(Self {
            ctx: Arc::new(TaskContext {
                domain: T::DOMAIN,
                key: key.clone(),
                backend: Arc::clone(&env.backend),
                dispatcher: env.dispatcher.clone(),
            }),
            key,
            interval,
            task: Arc::new(AsyncMutex::new(task)),
            stats: Arc::new(WorkerStats::default()),
            nudge: Arc::new(Notify::new()),
            checkpoints: None,
            state: Mutex::new(WorkerState::Idle),
            handle: Mutex::new(None),
        })
    }

    /// Decodes `data` and builds an idle worker.
    pub fn from_bytes(key: impl Into<String>, data: &[u8], env: &WorkerEnv) -> Result<Self> {
        Self::new(key, Self::decode(data)?, env)
    }

    /// Writes the snapshot to `store` after every evaluation that changed it.
    #[must_use]
    pub fn with_checkpoints(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Builds a worker and starts its loop.
    pub fn spawn(key: impl Into<String>, definition: T::Definition, env: &WorkerEnv) -> Result<Self> {
        let worker = Self::new(key, definition, env)?;
        worker.start();
        Ok(worker)
    }

    /// Returns the item key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Starts the loop. Does nothing unless the worker is idle.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if *state != WorkerState::Idle {
                return;
            }
            *state = WorkerState::Active;
        }

        let task = Arc::clone(&self.task);
        let ctx = Arc::clone(&self.ctx);
        let stats = Arc::clone(&self.stats);
        let nudge = Arc::clone(&self.nudge);
        let interval = self.interval;
        let checkpoints = self.checkpoints.clone();
        let handle = spawn_supervised(self.key.clone(), move |cancel| {
            run_loop(task, ctx, stats, nudge, interval, checkpoints, cancel)
        });
        *self.handle.lock() = Some(handle);
        debug!(key = %self.key, domain = %T::DOMAIN, "worker started");
    }

    /// Evaluates the task once at `now`, waiting for any running evaluation.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> TickOutcome {
        evaluate(&self.task, &self.ctx, &self.stats, now).await
    }

    /// Wakes the loop for an immediate evaluation.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    /// Stops the loop and waits for it to exit. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                WorkerState::Idle => {
                    *state = WorkerState::Stopped;
                    return;
                }
                WorkerState::Stopping | WorkerState::Stopped => return,
                WorkerState::Active => *state = WorkerState::Stopping,
            }
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        *self.state.lock() = WorkerState::Stopped;
        info!(key = %self.key, domain = %T::DOMAIN, "worker stopped");
    }

    /// Returns the persisted form of the task.
    pub async fn snapshot(&self) -> T::Definition {
        self.task.lock().await.snapshot()
    }

    /// Returns true if `definition` configures the same item as this worker,
    /// ignoring runtime state.
    pub async fn runs(&self, definition: &T::Definition) -> bool {
        T::strip_state(self.snapshot().await) == T::strip_state(definition.clone())
    }
}

impl<T: Task> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("key", &self.key)
            .field("domain", &T::DOMAIN)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn evaluate<T: Task>(
    task: &AsyncMutex<T>,
    ctx: &TaskContext,
    stats: &WorkerStats,
    now: DateTime<Utc>,
) -> TickOutcome {
    let mut task = task.lock().await;
    let outcome = if task.is_active() {
        task.tick(now, ctx).await
    } else {
        TickOutcome::Inactive
    };
    stats.record(outcome);
    outcome
}

/// Last snapshot written for a worker and where to write the next one.
struct Journal {
    store: Arc<dyn CoordinationStore>,
    last: Vec<u8>,
}

impl Journal {
    async fn open<T: Task>(store: Arc<dyn CoordinationStore>, task: &AsyncMutex<T>) -> Self {
        let last = encode(&task.lock().await.snapshot()).unwrap_or_default();
        Self { store, last }
    }

    async fn record<T: Task>(&mut self, task: &AsyncMutex<T>, ctx: &TaskContext, stats: &WorkerStats) {
        let Some(data) = encode(&task.lock().await.snapshot()) else {
            stats.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if data == self.last {
            return;
        }

        match self.store.update(&ctx.key, data.clone()).await {
            Ok(true) => {
                stats.checkpoints.fetch_add(1, Ordering::Relaxed);
                debug!(key = %ctx.key, "checkpoint written");
                self.last = data;
            }
            Ok(false) => {
                debug!(key = %ctx.key, "item deleted, checkpoint skipped");
                self.last = data;
            }
            Err(e) => {
                // retried after the next evaluation
                stats.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %ctx.key, error = %e, "failed to write checkpoint");
            }
        }
    }
}

fn encode<D: Serialize>(definition: &D) -> Option<Vec<u8>> {
    match serde_json::to_vec(definition) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(error = %e, "failed to encode snapshot");
            None
        }
    }
}

async fn run_loop<T: Task>(
    task: Arc<AsyncMutex<T>>,
    ctx: Arc<TaskContext>,
    stats: Arc<WorkerStats>,
    nudge: Arc<Notify>,
    interval: Option<Duration>,
    checkpoints: Option<Arc<dyn CoordinationStore>>,
    cancel: CancellationToken,
) {
    let mut journal = match checkpoints {
        Some(store) => Some(Journal::open(store, &task).await),
        None => None,
    };
    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    if ticker.is_none() {
        evaluate(&task, &ctx, &stats, Utc::now()).await;
        if let Some(journal) = journal.as_mut() {
            journal.record(&task, &ctx, &stats).await;
        }
    }

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            () = next_tick(&mut ticker) => {
                evaluate(&task, &ctx, &stats, Utc::now()).await;
            }

            () = nudge.notified() => {
                debug!(key = %ctx.key, "nudged");
                evaluate(&task, &ctx, &stats, Utc::now()).await;
            }
        }

        if let Some(journal) = journal.as_mut() {
            journal.record(&task, &ctx, &stats).await;
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
