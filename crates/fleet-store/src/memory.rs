//! In-memory coordination store.
//!
//! [`MemStore`] implements the full [`CoordinationStore`] contract inside one
//! process: revisions, prefix watches and lease expiry driven by
//! `tokio::time`, so tests running with a paused clock can expire leases
//! deterministically. Every handle returned by `clone()` shares the same data.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::store::{CoordinationStore, KeyValue, LeaseId, WatchEvent, WatchStream};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
    create_revision: i64,
    mod_revision: i64,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<Watcher>,
    revision: i64,
    next_lease: i64,
    fault: Option<StoreError>,
}

impl Inner {
    fn check_fault(&self) -> Result<()> {
        match &self.fault {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn notify(&mut self, event: &WatchEvent) {
        let key = event.key().to_string();
        self.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(Ok(event.clone())).is_ok()
        });
    }

    fn snapshot(key: &str, entry: &Entry) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            lease: entry.lease,
            create_revision: entry.create_revision,
            mod_revision: entry.mod_revision,
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        self.revision += 1;
        let revision = self.revision;
        let prev = self.data.get(key).cloned();

        if let Some(old_lease) = prev.as_ref().and_then(|p| p.lease) {
            if let Some(l) = self.leases.get_mut(&old_lease) {
                l.keys.remove(key);
            }
        }
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }

        let entry = Entry {
            value,
            lease,
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
        };
        let kv = Self::snapshot(key, &entry);
        let prev = prev.map(|p| Self::snapshot(key, &p));
        self.data.insert(key.to_string(), entry);
        self.notify(&WatchEvent::Put { kv, prev });
        Ok(())
    }

    fn delete(&mut self, key: &str) -> bool {
        let Some(prev) = self.data.remove(key) else {
            return false;
        };
        self.revision += 1;
        if let Some(id) = prev.lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.remove(key);
            }
        }
        let prev = Self::snapshot(key, &prev);
        self.notify(&WatchEvent::Delete {
            key: key.to_string(),
            prev: Some(prev),
        });
        true
    }

    fn drop_lease(&mut self, id: LeaseId) -> usize {
        let Some(lease) = self.leases.remove(&id) else {
            return 0;
        };
        lease.keys.iter().filter(|key| self.delete(key)).count()
    }

    fn expire_due(&mut self, now: Instant) {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let removed = self.drop_lease(id);
            info!(lease = %id, keys_removed = removed, "lease expired");
        }
    }
}

/// Process-local [`CoordinationStore`] with watch and lease support.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expires every lease whose deadline has passed and deletes its keys.
    pub fn expire_leases(&self) {
        self.inner.lock().expire_due(Instant::now());
    }

    /// Spawns a task that expires leases every `every` until `cancel` fires.
    pub fn spawn_reaper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => store.expire_leases(),
                }
            }
            debug!("lease reaper stopped");
        })
    }

    /// Makes every subsequent operation fail with `fault`, or clears the fault.
    pub fn set_fault(&self, fault: Option<StoreError>) {
        self.inner.lock().fault = fault;
    }

    /// Terminates every open watch stream with `err`.
    pub fn fail_watches(&self, err: &StoreError) {
        let mut inner = self.inner.lock();
        for watcher in inner.watchers.drain(..) {
            let _ = watcher.tx.send(Err(err.clone()));
        }
    }

    /// Returns the number of live leases.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.inner.lock().leases.len()
    }

    /// Returns the current store revision.
    #[must_use]
    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }
}

#[async_trait]
impl CoordinationStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        inner.expire_due(Instant::now());
        Ok(inner.data.get(key).map(|e| Inner::snapshot(key, e)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        inner.expire_due(Instant::now());
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| Inner::snapshot(k, e))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        inner.expire_due(Instant::now());
        inner.put(key, value, None)
    }

    async fn update(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        inner.expire_due(Instant::now());
        if !inner.data.contains_key(key) {
            return Ok(false);
        }
        inner.put(key, value, None)?;
        Ok(true)
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        inner.expire_due(Instant::now());
        inner.put(key, value, Some(lease))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        inner.expire_due(Instant::now());
        Ok(inner.delete(key))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        inner.next_lease += 1;
        let id = LeaseId(inner.next_lease);
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        debug!(lease = %id, ttl_secs = ttl.as_secs(), "granted lease");
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        let now = Instant::now();
        inner.expire_due(now);
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.deadline = now + entry.ttl;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        if !inner.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }
        inner.drop_lease(lease);
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
