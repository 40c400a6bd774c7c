//! Per-domain worker manager.
//!
//! A [`Manager`] keeps a registry of the workers for the items of one domain
//! that the local member owns. It follows the domain prefix through a watch,
//! rebalances on membership reload signals and persists worker snapshots
//! whenever it gives an item up. Workers checkpoint through the same store,
//! and the manager recognises those writes on its watch instead of
//! restarting the worker that made them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fleet_cluster::OwnershipOracle;
use fleet_store::{CoordinationStore, FatalSink, StoreError, WatchEvent, WatchStream, keys};
use fleet_worker::{Domain, Task, Worker, WorkerEnv};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ManagerError, Result};

/// Boundary tick period of the scheduler domain.
pub const DEFAULT_BOUNDARY_TICK: Duration = Duration::from_secs(30);

/// Manager settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Period at which every running worker is nudged, if any.
    pub boundary_tick: Option<Duration>,
}

impl ManagerConfig {
    /// Default settings for `domain`.
    #[must_use]
    pub const fn for_domain(domain: Domain) -> Self {
        match domain {
            Domain::Schedulers => Self {
                boundary_tick: Some(DEFAULT_BOUNDARY_TICK),
            },
            Domain::Scalers | Domain::Healers => Self { boundary_tick: None },
        }
    }
}

/// Lifecycle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created, nothing loaded.
    Idle,
    /// Loaded and managing workers.
    Active,
    /// Stop in progress.
    Stopping,
    /// All workers stopped and persisted.
    Stopped,
}

/// Outcome of a rebalance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Items newly started here.
    pub started: usize,
    /// Items handed off to another member.
    pub released: usize,
}

/// Lifetime counters of a manager.
#[derive(Debug, Default)]
pub struct ManagerStats {
    started: AtomicU64,
    released: AtomicU64,
    persist_failures: AtomicU64,
    decode_failures: AtomicU64,
}

impl ManagerStats {
    /// Workers started.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Workers released to another owner.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Snapshots that could not be written.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// Definitions that could not be decoded.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

type Registry<T> = HashMap<String, Arc<Worker<T>>>;

/// Worker manager for the domain of `T`.
pub struct Manager<T: Task> {
    store: Arc<dyn CoordinationStore>,
    oracle: Arc<dyn OwnershipOracle>,
    env: WorkerEnv,
    config: ManagerConfig,
    registry: AsyncMutex<Registry<T>>,
    state: Mutex<ManagerState>,
    pending_watch: Mutex<Option<WatchStream>>,
    running: AsyncMutex<()>,
    stats: Arc<ManagerStats>,
    fatal: FatalSink,
    cancel: CancellationToken,
}

impl<T: Task> Manager<T> {
    /// Creates an idle manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        oracle: Arc<dyn OwnershipOracle>,
        env: WorkerEnv,
        config: ManagerConfig,
        fatal: FatalSink,
    ) -> Self {
        Self {
            store,
            oracle,
            env,
            config,
            registry: AsyncMutex::new(HashMap::new()),
            state: Mutex::new(ManagerState::Idle),
            pending_watch: Mutex::new(None),
            running: AsyncMutex::new(()),
            stats: Arc::new(ManagerStats::default()),
            fatal,
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the managed domain.
    #[must_use]
    pub const fn domain(&self) -> Domain {
        T::DOMAIN
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// Returns the lifetime counters.
    #[must_use]
    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    /// Returns the keys of running workers, sorted.
    pub async fn running_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registry.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns the running worker for `key`.
    pub async fn worker(&self, key: &str) -> Option<Arc<Worker<T>>> {
        self.registry.lock().await.get(key).cloned()
    }

    /// Starts a worker for every owned item under the domain prefix.
    ///
    /// The watch is opened before listing so no change is missed between
    /// the two. Returns the number of workers started.
    pub async fn load(&self) -> Result<usize> {
        let state = self.state();
        if state != ManagerState::Idle {
            return Err(ManagerError::InvalidState {
                state,
                expected: ManagerState::Idle,
            });
        }

        let prefix = T::DOMAIN.prefix();
        let stream = self.store.watch_prefix(prefix).await?;
        *self.pending_watch.lock() = Some(stream);

        let items = self.store.get_prefix(prefix).await?;
        let mut started = 0;
        for kv in &items {
            if self.store_if_owned(&kv.key, &kv.value).await {
                started += 1;
            }
        }

        *self.state.lock() = ManagerState::Active;
        info!(domain = %T::DOMAIN, items = items.len(), started, "manager loaded");
        Ok(started)
    }

    /// Starts a worker for `key` if the local member owns it.
    ///
    /// A worker already running for the key is stopped and replaced. Returns
    /// true if a worker was started.
    pub async fn store_if_owned(&self, key: &str, data: &[u8]) -> bool {
        let Some(worker) = self.build_if_owned(key, data) else {
            return false;
        };

        let mut registry = self.registry.lock().await;
        if let Some(previous) = registry.remove(key) {
            previous.stop().await;
            debug!(key = %key, "replaced running worker");
        }
        worker.start();
        registry.insert(key.to_string(), worker);
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        info!(key = %key, domain = %T::DOMAIN, "worker started");
        true
    }

    fn build_if_owned(&self, key: &str, data: &[u8]) -> Option<Arc<Worker<T>>> {
        let ownership = self.oracle.local_is_worker(key);
        if !ownership.is_owner {
            debug!(key = %key, owner = ?ownership.owner, "not the owner, skipping");
            return None;
        }

        match Worker::<T>::from_bytes(key, data, &self.env) {
            Ok(worker) => Some(Arc::new(worker.with_checkpoints(Arc::clone(&self.store)))),
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "skipping undecodable definition");
                None
            }
        }
    }

    async fn remove(&self, key: &str) {
        let worker = self.registry.lock().await.remove(key);
        if let Some(worker) = worker {
            worker.stop().await;
            info!(key = %key, domain = %T::DOMAIN, "worker removed");
        }
    }

    /// Runs the event loop until [`Manager::stop`] or a fatal store error.
    pub async fn run(&self, mut reload: broadcast::Receiver<()>) {
        let _running = self.running.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }

        let prefix = T::DOMAIN.prefix();
        let pending = self.pending_watch.lock().take();
        let mut stream = match pending {
            Some(stream) => stream,
            None => match self.store.watch_prefix(prefix).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(domain = %T::DOMAIN, error = %e, "failed to watch domain prefix");
                    let _ = self.fatal.send(e);
                    return;
                }
            },
        };

        let mut boundary = self.config.boundary_tick.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut reload_open = true;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    debug!(domain = %T::DOMAIN, "manager loop stopped");
                    break;
                }

                event = stream.recv() => match event {
                    Some(Ok(event)) => self.apply(event).await,
                    Some(Err(e)) => {
                        error!(domain = %T::DOMAIN, error = %e, "domain watch failed");
                        let _ = self.fatal.send(e);
                        break;
                    }
                    None => {
                        error!(domain = %T::DOMAIN, "domain watch closed");
                        let _ = self.fatal.send(StoreError::WatchClosed {
                            prefix: prefix.to_string(),
                        });
                        break;
                    }
                },

                signal = reload.recv(), if reload_open => match signal {
                    Ok(()) | Err(RecvError::Lagged(_)) => match self.rebalance().await {
                        Ok(_) => {}
                        Err(ManagerError::Store(e)) if e.is_connectivity() => {
                            error!(domain = %T::DOMAIN, error = %e, "rebalance failed");
                            let _ = self.fatal.send(e);
                            break;
                        }
                        Err(e) => warn!(domain = %T::DOMAIN, error = %e, "rebalance failed"),
                    },
                    Err(RecvError::Closed) => {
                        debug!(domain = %T::DOMAIN, "reload channel closed");
                        reload_open = false;
                    }
                },

                () = next_tick(&mut boundary) => self.nudge_all().await,
            }
        }
    }

    async fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put { kv, prev } => {
                if keys::strip(&kv.key, T::DOMAIN.prefix()).is_none() {
                    return;
                }
                if prev.is_some() {
                    if self.is_checkpoint(&kv.key, &kv.value).await {
                        debug!(key = %kv.key, "checkpoint observed, worker kept");
                        return;
                    }
                    debug!(key = %kv.key, "definition modified");
                }
                if !self.store_if_owned(&kv.key, &kv.value).await {
                    // ownership may have moved while the old worker ran here
                    self.remove(&kv.key).await;
                }
            }
            WatchEvent::Delete { key, .. } => self.remove(&key).await,
        }
    }

    /// True if `data` only changes the runtime state of an owned, running item.
    async fn is_checkpoint(&self, key: &str, data: &[u8]) -> bool {
        if !self.oracle.local_is_worker(key).is_owner {
            return false;
        }
        let Some(worker) = self.worker(key).await else {
            return false;
        };
        match Worker::<T>::decode(data) {
            Ok(definition) => worker.runs(&definition).await,
            Err(_) => false,
        }
    }

    /// Wakes every running worker for an immediate evaluation.
    pub async fn nudge_all(&self) {
        let registry = self.registry.lock().await;
        for worker in registry.values() {
            worker.nudge();
        }
        debug!(domain = %T::DOMAIN, workers = registry.len(), "boundary tick");
    }

    /// Same as [`Manager::rebalance`].
    pub async fn reload(&self) -> Result<RebalanceReport> {
        self.rebalance().await
    }

    /// Reconciles the registry with current ownership.
    ///
    /// Items no longer owned are stopped, snapshotted and persisted. Owned
    /// items without a worker are started. Everything else is left alone.
    pub async fn rebalance(&self) -> Result<RebalanceReport> {
        let items = self.store.get_prefix(T::DOMAIN.prefix()).await?;
        let mut report = RebalanceReport::default();
        let mut registry = self.registry.lock().await;

        let lost: Vec<String> = registry
            .keys()
            .filter(|key| !self.oracle.local_is_worker(key).is_owner)
            .cloned()
            .collect();
        for key in lost {
            if let Some(worker) = registry.remove(&key) {
                worker.stop().await;
                self.persist(&key, &worker).await;
                report.released += 1;
                self.stats.released.fetch_add(1, Ordering::Relaxed);
                info!(key = %key, domain = %T::DOMAIN, "worker released");
            }
        }

        for kv in &items {
            if registry.contains_key(&kv.key) {
                continue;
            }
            if let Some(worker) = self.build_if_owned(&kv.key, &kv.value) {
                worker.start();
                registry.insert(kv.key.clone(), worker);
                report.started += 1;
                self.stats.started.fetch_add(1, Ordering::Relaxed);
                info!(key = %kv.key, domain = %T::DOMAIN, "worker acquired");
            }
        }

        info!(
            domain = %T::DOMAIN,
            started = report.started,
            released = report.released,
            running = registry.len(),
            "rebalanced"
        );
        Ok(report)
    }

    async fn persist(&self, key: &str, worker: &Worker<T>) {
        if let Err(e) = persist_snapshot(self.store.as_ref(), key, worker).await {
            self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "failed to persist snapshot");
        }
    }

    /// Stops the loop and every worker, persisting each snapshot.
    ///
    /// Workers are stopped in parallel. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ManagerState::Idle => {
                    *state = ManagerState::Stopped;
                    self.cancel.cancel();
                    return;
                }
                ManagerState::Stopping | ManagerState::Stopped => return,
                ManagerState::Active => *state = ManagerState::Stopping,
            }
        }

        self.cancel.cancel();
        // wait for the event loop to exit
        drop(self.running.lock().await);

        let workers: Vec<(String, Arc<Worker<T>>)> = self.registry.lock().await.drain().collect();
        let total = workers.len();
        let mut set = JoinSet::new();
        for (key, worker) in workers {
            let store = Arc::clone(&self.store);
            set.spawn(async move {
                worker.stop().await;
                persist_snapshot(store.as_ref(), &key, &*worker)
                    .await
                    .map_err(|e| (key, e))
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((key, e))) => {
                    self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "failed to persist snapshot on stop");
                }
                Err(e) => {
                    self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "worker stop task aborted");
                }
            }
        }

        *self.state.lock() = ManagerState::Stopped;
        info!(domain = %T::DOMAIN, workers = total, "manager stopped");
    }
}

impl<T: Task> fmt::Debug for Manager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("domain", &T::DOMAIN)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn persist_snapshot<T: Task>(
    store: &dyn CoordinationStore,
    key: &str,
    worker: &Worker<T>,
) -> Result<()> {
    let snapshot = worker.snapshot().await;
    let data = serde_json::to_vec(&snapshot)?;
    if store.update(key, data).await? {
        debug!(key = %key, "snapshot persisted");
    } else {
        debug!(key = %key, "item deleted, snapshot dropped");
    }
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
