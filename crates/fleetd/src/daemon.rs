//! Process wiring: membership, the three domain managers and shutdown order.

use std::sync::Arc;

use fleet_cluster::{Membership, OwnershipOracle};
use fleet_manager::{HealerManager, ManagerConfig, ScalerManager, SchedulerManager};
use fleet_store::{CoordinationStore, FatalStream, MemStore, StoreError, fatal_channel};
use fleet_worker::{
    Dispatcher, Domain, HttpTransport, MetricsBackend, PrometheusBackend, StaticBackend, WorkerEnv,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::seed::SeedFile;

/// Capacity of the membership reload channel.
const RELOAD_CHANNEL_CAPACITY: usize = 64;

/// A running control-plane member.
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<dyn CoordinationStore>,
    membership: Arc<Membership>,
    scalers: Arc<ScalerManager>,
    healers: Arc<HealerManager>,
    schedulers: Arc<SchedulerManager>,
    fatal: FatalStream,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("name", &self.config.name)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

/// Builds the backend and transport described by `config`.
///
/// # Errors
///
/// Returns an error if the metrics URL or the HTTP client is rejected.
pub fn worker_env(config: &DaemonConfig) -> Result<WorkerEnv> {
    let backend: Arc<dyn MetricsBackend> = match &config.metrics_url {
        Some(url) => Arc::new(
            PrometheusBackend::new(url, config.http_timeout)
                .map_err(|e| DaemonError::Config(e.to_string()))?,
        ),
        None => {
            warn!("no metrics_url configured, query-driven items will never fire");
            Arc::new(StaticBackend::new())
        }
    };
    let transport =
        HttpTransport::new(config.transport()).map_err(|e| DaemonError::Config(e.to_string()))?;
    Ok(WorkerEnv::new(backend, Dispatcher::new(Arc::new(transport))))
}

#[cfg(feature = "etcd")]
async fn external_store(config: &DaemonConfig) -> Result<Arc<dyn CoordinationStore>> {
    let store = fleet_store::EtcdStore::connect(&config.store_endpoints, config.store_timeout).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn external_store(_config: &DaemonConfig) -> Result<Arc<dyn CoordinationStore>> {
    Err(DaemonError::Config(
        "store_endpoints is set but fleetd was built without the etcd feature".to_string(),
    ))
}

impl Daemon {
    /// Starts a member over the store named by the configuration.
    ///
    /// With `store_endpoints` set the member joins the etcd cluster behind
    /// them; otherwise it runs standalone over an in-process store. The seed,
    /// if any, is written to whichever store is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached, the seed is invalid
    /// or startup fails.
    pub async fn connect(config: DaemonConfig, seed: Option<&SeedFile>) -> Result<Self> {
        config.validate()?;
        if !config.uses_external_store() {
            return Self::standalone(config, seed).await;
        }
        let env = worker_env(&config)?;
        let store = external_store(&config).await?;
        if let Some(seed) = seed {
            let written = seed.apply(store.as_ref()).await?;
            info!(entries = written, "seed applied");
        }
        Self::start(config, store, env).await
    }

    /// Starts a member over an in-process store, seeding it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed is invalid or startup fails.
    pub async fn standalone(config: DaemonConfig, seed: Option<&SeedFile>) -> Result<Self> {
        let env = worker_env(&config)?;
        Self::standalone_with_env(config, seed, env).await
    }

    /// Like [`Daemon::standalone`] with caller-provided collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed is invalid or startup fails.
    pub async fn standalone_with_env(
        config: DaemonConfig,
        seed: Option<&SeedFile>,
        env: WorkerEnv,
    ) -> Result<Self> {
        let store = MemStore::new();
        if let Some(seed) = seed {
            let written = seed.apply(&store).await?;
            info!(entries = written, "seed applied");
        }

        let reaper_every = config.reaper_interval;
        let mut daemon = Self::start(config, Arc::new(store.clone()), env).await?;
        let reaper = store.spawn_reaper(reaper_every, daemon.cancel.child_token());
        daemon.tasks.push(reaper);
        Ok(daemon)
    }

    /// Joins the cluster on `store` and starts every domain manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the join fails, or
    /// a manager cannot list its domain.
    pub async fn start(
        config: DaemonConfig,
        store: Arc<dyn CoordinationStore>,
        env: WorkerEnv,
    ) -> Result<Self> {
        config.validate()?;
        let (fatal_tx, fatal_rx) = fatal_channel();

        let membership = Arc::new(Membership::new(
            Arc::clone(&store),
            config.membership(),
            fatal_tx.clone(),
        ));
        membership.join().await?;

        let oracle = Arc::clone(&membership) as Arc<dyn OwnershipOracle>;
        let scalers = Arc::new(ScalerManager::new(
            Arc::clone(&store),
            Arc::clone(&oracle),
            env.clone(),
            ManagerConfig::for_domain(Domain::Scalers),
            fatal_tx.clone(),
        ));
        let healers = Arc::new(HealerManager::new(
            Arc::clone(&store),
            Arc::clone(&oracle),
            env.clone(),
            ManagerConfig::for_domain(Domain::Healers),
            fatal_tx.clone(),
        ));
        let schedulers = Arc::new(SchedulerManager::new(
            Arc::clone(&store),
            oracle,
            env,
            ManagerConfig {
                boundary_tick: Some(config.scheduler_tick),
            },
            fatal_tx,
        ));

        let loaded = async {
            let s = scalers.load().await?;
            let h = healers.load().await?;
            let c = schedulers.load().await?;
            Ok::<_, DaemonError>((s, h, c))
        }
        .await;
        let (scaler_count, healer_count, scheduler_count) = match loaded {
            Ok(counts) => counts,
            Err(e) => {
                scalers.stop().await;
                healers.stop().await;
                schedulers.stop().await;
                if let Err(leave) = membership.leave().await {
                    warn!(error = %leave, "failed to leave after startup error");
                }
                membership.shutdown();
                return Err(e);
            }
        };

        let (reload_tx, _) = broadcast::channel(RELOAD_CHANNEL_CAPACITY);
        let mut tasks = Vec::with_capacity(5);
        {
            let m = Arc::clone(&scalers);
            let rx = reload_tx.subscribe();
            tasks.push(tokio::spawn(async move { m.run(rx).await }));
        }
        {
            let m = Arc::clone(&healers);
            let rx = reload_tx.subscribe();
            tasks.push(tokio::spawn(async move { m.run(rx).await }));
        }
        {
            let m = Arc::clone(&schedulers);
            let rx = reload_tx.subscribe();
            tasks.push(tokio::spawn(async move { m.run(rx).await }));
        }
        {
            let m = Arc::clone(&membership);
            tasks.push(tokio::spawn(async move { m.run(reload_tx).await }));
        }

        info!(
            member = %config.name,
            address = %config.bind_address,
            scalers = scaler_count,
            healers = healer_count,
            schedulers = scheduler_count,
            "fleetd started"
        );

        Ok(Self {
            config,
            store,
            membership,
            scalers,
            healers,
            schedulers,
            fatal: fatal_rx,
            cancel: CancellationToken::new(),
            tasks,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Returns the coordination store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Returns the membership service.
    #[must_use]
    pub const fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// Returns the scaler manager.
    #[must_use]
    pub const fn scalers(&self) -> &Arc<ScalerManager> {
        &self.scalers
    }

    /// Returns the healer manager.
    #[must_use]
    pub const fn healers(&self) -> &Arc<HealerManager> {
        &self.healers
    }

    /// Returns the scheduler manager.
    #[must_use]
    pub const fn schedulers(&self) -> &Arc<SchedulerManager> {
        &self.schedulers
    }

    /// Waits for the first fatal store error reported by any component.
    pub async fn fatal(&mut self) -> Option<StoreError> {
        self.fatal.recv().await
    }

    /// Stops every manager, persisting worker state, then leaves the cluster.
    ///
    /// Managers stop before the member record is revoked so a survivor that
    /// rebalances on the leave reads the persisted state.
    pub async fn shutdown(self) {
        info!(member = %self.config.name, "fleetd shutting down");
        tokio::join!(
            self.scalers.stop(),
            self.healers.stop(),
            self.schedulers.stop(),
        );

        if let Err(e) = self.membership.leave().await {
            warn!(error = %e, "failed to leave cluster cleanly");
        }
        self.membership.shutdown();
        self.cancel.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(member = %self.config.name, "fleetd stopped");
    }
}
