//! etcd-backed coordination store.
//!
//! [`EtcdStore`] maps the [`CoordinationStore`] contract onto the etcd v3
//! API: leases are etcd leases, [`CoordinationStore::update`] is a
//! transaction guarded on the key's create revision, and prefix watches are
//! forwarded from the gRPC watch stream into a [`WatchStream`].

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::store::{CoordinationStore, KeyValue, LeaseId, WatchEvent, WatchStream};

/// How long to wait for the initial connection unless configured otherwise.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// [`CoordinationStore`] talking to an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connects to the cluster at `endpoints`.
    ///
    /// `timeout` bounds the connection attempt and every later request.
    pub async fn connect(endpoints: &[String], timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable("no etcd endpoints configured".to_string()));
        }
        let options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(store_error)?;
        info!(endpoints = ?endpoints, "connected to etcd");
        Ok(Self { client })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let response = self.client().get(key, None).await.map_err(store_error)?;
        response.kvs().first().map(convert).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let response = self
            .client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_error)?;
        // etcd answers ranges in ascending key order
        response.kvs().iter().map(convert).collect()
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.client().put(key, value, None).await.map_err(store_error)?;
        Ok(())
    }

    async fn update(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Greater, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let response = self.client().txn(txn).await.map_err(store_error)?;
        Ok(response.succeeded())
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        self.client()
            .put(key, value, Some(PutOptions::new().with_lease(lease.0)))
            .await
            .map_err(|e| lease_error(e, lease))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let response = self.client().delete(key, None).await.map_err(store_error)?;
        Ok(response.deleted() > 0)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let response = self
            .client()
            .lease_grant(ttl_secs(ttl), None)
            .await
            .map_err(store_error)?;
        let id = LeaseId(response.id());
        debug!(lease = %id, ttl_secs = response.ttl(), "granted lease");
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        // opening the stream performs one refresh and rejects unknown leases
        self.client()
            .lease_keep_alive(lease.0)
            .await
            .map_err(|e| lease_error(e, lease))?;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.client()
            .lease_revoke(lease.0)
            .await
            .map_err(|e| lease_error(e, lease))?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let (watcher, mut stream) = self
            .client()
            .watch(prefix, Some(options))
            .await
            .map_err(store_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            // dropping the watcher cancels the server-side watch
            let _watcher = watcher;
            loop {
                let message = tokio::select! {
                    () = tx.closed() => break,
                    message = stream.message() => message,
                };
                match message {
                    Ok(Some(response)) if response.canceled() => {
                        warn!(prefix = %prefix, "etcd cancelled watch");
                        let _ = tx.send(Err(StoreError::WatchClosed { prefix: prefix.clone() }));
                        break;
                    }
                    Ok(Some(response)) => {
                        for event in response.events() {
                            if tx.send(watch_event(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Err(StoreError::WatchClosed { prefix: prefix.clone() }));
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(store_error(e)));
                        break;
                    }
                }
            }
            debug!(prefix = %prefix, "etcd watch forwarder stopped");
        });

        Ok(rx)
    }
}

fn convert(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| StoreError::Serialization(format!("non UTF-8 key: {e}")))?;
    Ok(KeyValue {
        key: key.to_string(),
        value: kv.value().to_vec(),
        lease: (kv.lease() != 0).then_some(LeaseId(kv.lease())),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    })
}

fn watch_event(event: &etcd_client::Event) -> Result<WatchEvent> {
    let kv = event
        .kv()
        .ok_or_else(|| StoreError::Serialization("watch event without key-value".to_string()))?;
    let prev = event.prev_kv().map(convert).transpose()?;
    match event.event_type() {
        EventType::Put => Ok(WatchEvent::Put { kv: convert(kv)?, prev }),
        EventType::Delete => Ok(WatchEvent::Delete {
            key: convert(kv)?.key,
            prev,
        }),
    }
}

/// Whole seconds for an etcd lease, rounded up and never zero.
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

fn classify(message: &str) -> Option<StoreError> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no leader") {
        Some(StoreError::NoLeader)
    } else if lower.contains("deadline") || lower.contains("timed out") || lower.contains("timeout") {
        Some(StoreError::Timeout(message.to_string()))
    } else {
        None
    }
}

fn store_error(err: etcd_client::Error) -> StoreError {
    let message = match &err {
        etcd_client::Error::GRpcStatus(status) => status.message().to_string(),
        other => other.to_string(),
    };
    classify(&message).unwrap_or(StoreError::Unavailable(message))
}

fn lease_error(err: etcd_client::Error, lease: LeaseId) -> StoreError {
    let missing = match &err {
        etcd_client::Error::LeaseKeepAliveError(_) => true,
        etcd_client::Error::GRpcStatus(status) => status.message().contains("lease not found"),
        _ => false,
    };
    if missing {
        StoreError::LeaseNotFound(lease)
    } else {
        store_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    mod conversion_tests {
        use super::*;

        #[test_case(Duration::from_secs(30), 30 ; "whole seconds")]
        #[test_case(Duration::from_millis(2500), 3 ; "rounded up")]
        #[test_case(Duration::from_millis(10), 1 ; "never zero")]
        #[test_case(Duration::ZERO, 1 ; "zero becomes one")]
        fn test_ttl_secs(ttl: Duration, expected: i64) {
            assert_eq!(ttl_secs(ttl), expected);
        }

        #[test]
        fn test_classify_messages() {
            assert_eq!(classify("etcdserver: no leader"), Some(StoreError::NoLeader));
            assert!(matches!(
                classify("etcdserver: request timed out"),
                Some(StoreError::Timeout(_))
            ));
            assert_eq!(classify("etcdserver: mvcc: required revision has been compacted"), None);
        }
    }

    mod connect_tests {
        use super::*;

        #[tokio::test]
        async fn test_empty_endpoints_are_rejected() {
            let err = EtcdStore::connect(&[], DEFAULT_CONNECT_TIMEOUT).await.unwrap_err();
            assert!(matches!(err, StoreError::Unavailable(_)));
        }

        #[tokio::test]
        async fn test_unreachable_cluster_is_a_connectivity_error() {
            let endpoints = vec!["http://127.0.0.1:1".to_string()];
            let result = match EtcdStore::connect(&endpoints, Duration::from_millis(500)).await {
                Ok(store) => store.get("/scalers/aws/web").await.map(|_| ()),
                Err(e) => Err(e),
            };
            assert!(result.unwrap_err().is_connectivity());
        }
    }
}
