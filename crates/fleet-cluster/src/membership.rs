//! Cluster membership service.
//!
//! [`Membership`] registers the local process under a leased key, keeps the
//! lease alive, follows every other member through a prefix watch and answers
//! ownership questions against its consistent-hash ring.
//!
//! Lease keep-alive failures and watch failures are fatal: they are sent to
//! the process [`FatalSink`] and the affected loop exits. Neither is retried
//! here, since a member that cannot prove its lease cannot prove ownership.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fleet_store::{CoordinationStore, FatalSink, LeaseId, StoreError, WatchEvent, WatchStream, keys};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ClusterError, Result};
use crate::member::Member;
use crate::ring::{ConsistentRing, DEFAULT_VIRTUAL_NODES, HashRing};
use crate::state::ClusterState;

/// Default lease TTL of a member record.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Configuration for the membership service.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Local member name.
    pub name: String,
    /// Address the local process is bound to.
    pub bind_address: IpAddr,
    /// TTL of the member lease.
    pub lease_ttl: Duration,
    /// Keep-alive period. Defaults to a third of the TTL.
    pub keepalive_interval: Option<Duration>,
    /// Virtual ring points per member.
    pub virtual_nodes: usize,
}

impl MembershipConfig {
    /// Creates a configuration with default lease and ring settings.
    #[must_use]
    pub fn new(name: impl Into<String>, bind_address: IpAddr) -> Self {
        Self {
            name: name.into(),
            bind_address,
            ..Self::default()
        }
    }

    /// Returns the effective keep-alive period.
    #[must_use]
    pub fn keepalive_period(&self) -> Duration {
        self.keepalive_interval
            .unwrap_or(self.lease_ttl / 3)
            .max(Duration::from_millis(10))
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            name: "fleet".to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            lease_ttl: DEFAULT_LEASE_TTL,
            keepalive_interval: None,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// Answer to "does the local process own this key".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    /// Name of the local member.
    pub local: String,
    /// Name of the owning member, if the ring is not empty.
    pub owner: Option<String>,
    /// True if the local member owns the key.
    pub is_owner: bool,
}

/// Source of ownership decisions for work-item keys.
pub trait OwnershipOracle: Send + Sync + 'static {
    /// Resolves the owner of `key` from the local point of view.
    fn local_is_worker(&self, key: &str) -> Ownership;
}

#[derive(Debug)]
struct View {
    ring: ConsistentRing,
    members: HashMap<String, Member>,
}

impl View {
    fn add(&mut self, member: Member) -> bool {
        self.ring.add(&member.id);
        self.members.insert(member.id.clone(), member).is_none()
    }

    fn remove(&mut self, id: &str) -> Option<Member> {
        self.ring.remove(id);
        self.members.remove(id)
    }
}

/// The cluster membership service.
pub struct Membership {
    store: Arc<dyn CoordinationStore>,
    config: MembershipConfig,
    local: Member,
    view: RwLock<View>,
    state: Mutex<ClusterState>,
    lease: Mutex<Option<LeaseId>>,
    pending_watch: Mutex<Option<WatchStream>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    fatal: FatalSink,
    cancel: CancellationToken,
    keepalive_cancel: CancellationToken,
    joins: AtomicU64,
    leaves: AtomicU64,
}

impl Membership {
    /// Creates a membership service for the configured local member.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, config: MembershipConfig, fatal: FatalSink) -> Self {
        let local = Member::new(config.name.clone(), config.bind_address);
        let cancel = CancellationToken::new();
        let keepalive_cancel = cancel.child_token();
        Self {
            store,
            view: RwLock::new(View {
                ring: ConsistentRing::new(config.virtual_nodes),
                members: HashMap::new(),
            }),
            config,
            local,
            state: Mutex::new(ClusterState::Joining),
            lease: Mutex::new(None),
            pending_watch: Mutex::new(None),
            keepalive: Mutex::new(None),
            fatal,
            cancel,
            keepalive_cancel,
            joins: AtomicU64::new(0),
            leaves: AtomicU64::new(0),
        }
    }

    /// Returns the local member.
    #[must_use]
    pub const fn local(&self) -> &Member {
        &self.local
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClusterState {
        *self.state.lock()
    }

    /// Returns the lease backing the local member record.
    #[must_use]
    pub fn lease(&self) -> Option<LeaseId> {
        *self.lease.lock()
    }

    /// Returns every member currently on the ring, sorted by id.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        let view = self.view.read();
        let mut members: Vec<Member> = view.members.values().cloned().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// Returns the member ids on the ring.
    #[must_use]
    pub fn ring_nodes(&self) -> Vec<String> {
        self.view.read().ring.nodes().iter().cloned().collect()
    }

    /// Number of member put events observed by [`Membership::run`].
    #[must_use]
    pub fn joins_observed(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }

    /// Number of member delete events observed by [`Membership::run`].
    #[must_use]
    pub fn leaves_observed(&self) -> u64 {
        self.leaves.load(Ordering::Relaxed)
    }

    /// Registers the local member.
    ///
    /// Fails with [`ClusterError::DuplicateMember`] if a record with the same
    /// id already exists. On success the lease keep-alive loop is running, the
    /// ring holds every registered member and the state is `Alive`.
    pub async fn join(&self) -> Result<()> {
        let state = self.state();
        if state != ClusterState::Joining {
            return Err(ClusterError::InvalidState {
                state,
                expected: ClusterState::Joining,
            });
        }

        let key = keys::member_key(&self.local.id);
        if self.store.get(&key).await?.is_some() {
            return Err(ClusterError::DuplicateMember {
                id: self.local.id.clone(),
            });
        }

        let lease = self.store.grant_lease(self.config.lease_ttl).await?;
        let record = serde_json::to_vec(&self.local)?;
        self.store.put_with_lease(&key, record, lease).await?;
        *self.lease.lock() = Some(lease);

        *self.keepalive.lock() = Some(tokio::spawn(keep_alive_loop(
            Arc::clone(&self.store),
            lease,
            self.config.keepalive_period(),
            self.keepalive_cancel.clone(),
            self.fatal.clone(),
        )));

        // Watch before listing so no member change falls between the two.
        let stream = self.store.watch_prefix(keys::CLUSTER_PREFIX).await?;
        *self.pending_watch.lock() = Some(stream);

        let existing = self.store.get_prefix(keys::CLUSTER_PREFIX).await?;
        {
            let mut view = self.view.write();
            view.add(self.local.clone());
            for kv in existing {
                match serde_json::from_slice::<Member>(&kv.value) {
                    Ok(member) => {
                        view.add(member);
                    }
                    Err(e) => warn!(key = %kv.key, error = %e, "skipping undecodable member record"),
                }
            }
        }

        *self.state.lock() = ClusterState::Alive;
        info!(
            member = %self.local,
            lease = %lease,
            members = self.view.read().members.len(),
            "joined cluster"
        );
        Ok(())
    }

    /// Follows membership changes until shutdown or a fatal watch error.
    ///
    /// Every observed join or leave updates the ring and sends a reload
    /// signal so managers can rebalance.
    pub async fn run(&self, reload: broadcast::Sender<()>) {
        let pending = self.pending_watch.lock().take();
        let mut stream = match pending {
            Some(stream) => stream,
            None => match self.store.watch_prefix(keys::CLUSTER_PREFIX).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "failed to watch cluster members");
                    let _ = self.fatal.send(e);
                    return;
                }
            },
        };

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("membership watch stopped");
                    break;
                }
                event = stream.recv() => match event {
                    Some(Ok(event)) => self.apply(event, &reload),
                    Some(Err(e)) => {
                        error!(error = %e, "cluster watch failed");
                        let _ = self.fatal.send(e);
                        break;
                    }
                    None => {
                        error!("cluster watch closed");
                        let _ = self.fatal.send(StoreError::WatchClosed {
                            prefix: keys::CLUSTER_PREFIX.to_string(),
                        });
                        break;
                    }
                },
            }
        }
    }

    fn apply(&self, event: WatchEvent, reload: &broadcast::Sender<()>) {
        match event {
            WatchEvent::Put { kv, .. } => {
                let member = match serde_json::from_slice::<Member>(&kv.value) {
                    Ok(member) => member,
                    Err(e) => {
                        warn!(key = %kv.key, error = %e, "ignoring undecodable member record");
                        return;
                    }
                };
                let is_new = self.view.write().add(member.clone());
                self.joins.fetch_add(1, Ordering::Relaxed);
                info!(member = %member, new = is_new, "member joined");
            }
            WatchEvent::Delete { key, .. } => {
                let Some(id) = keys::strip(&key, keys::CLUSTER_PREFIX) else {
                    return;
                };
                let removed = self.view.write().remove(id);
                self.leaves.fetch_add(1, Ordering::Relaxed);
                if id == self.local.id && self.state() == ClusterState::Alive {
                    warn!(member = %self.local, "local member record removed while alive");
                }
                info!(member_id = %id, known = removed.is_some(), "member left");
            }
        }
        let _ = reload.send(());
    }

    /// Deregisters the local member.
    ///
    /// Stops the keep-alive loop and deletes the member key directly. Calling
    /// it in any state other than `Alive`, or after [`Membership::shutdown`],
    /// does nothing: a member that was shut down stays registered until its
    /// lease runs out.
    pub async fn leave(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            debug!(member = %self.local, "leave after shutdown ignored");
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            if *state != ClusterState::Alive {
                debug!(state = %*state, "leave ignored");
                return Ok(());
            }
            *state = ClusterState::Leaving;
        }

        self.keepalive_cancel.cancel();
        let handle = self.keepalive.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let result = self.store.delete(&keys::member_key(&self.local.id)).await;
        *self.state.lock() = ClusterState::Left;

        match result {
            Ok(_) => {
                info!(member = %self.local, "left cluster");
                Ok(())
            }
            Err(e) => {
                warn!(member = %self.local, error = %e, "failed to delete member record");
                Err(e.into())
            }
        }
    }

    /// Stops the watch and keep-alive loops without touching the store.
    ///
    /// A later [`Membership::leave`] is a no-op; leave first to deregister.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl OwnershipOracle for Membership {
    fn local_is_worker(&self, key: &str) -> Ownership {
        let view = self.view.read();
        let owner_id = view.ring.get(key);
        let is_owner = owner_id == Some(self.local.id.as_str());
        let owner = owner_id.map(|id| {
            view.members
                .get(id)
                .map_or_else(|| id.to_string(), |m| m.name.clone())
        });
        Ownership {
            local: self.local.name.clone(),
            owner,
            is_owner,
        }
    }
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("local", &self.local)
            .field("state", &self.state())
            .field("members", &self.view.read().members.len())
            .finish_non_exhaustive()
    }
}

async fn keep_alive_loop(
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    every: Duration,
    cancel: CancellationToken,
    fatal: FatalSink,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.keep_alive(lease).await {
                    error!(lease = %lease, error = %e, "lease keep-alive failed");
                    let _ = fatal.send(e);
                    break;
                }
                debug!(lease = %lease, "lease refreshed");
            }
        }
    }
}
