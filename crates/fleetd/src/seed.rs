//! Work-item seeding.
//!
//! A seed file lists definitions per domain, each tagged with its provider:
//!
//! ```json
//! {
//!   "scalers": [{ "provider": "aws", "id": "web", "query": "cpu > 0.9", "interval": "15s" }],
//!   "healers": [{ "provider": "aws", "id": "aws-healer", "query": "up == 0", "interval": "30s" }],
//!   "schedulers": [{ "provider": "aws", "id": "office", "from_cron": "0 9 * * 1-5", "to_cron": "0 18 * * 1-5" }]
//! }
//! ```
//!
//! Every entry is validated before anything is written.

use std::collections::BTreeSet;
use std::path::Path;

use fleet_store::{CoordinationStore, keys};
use fleet_worker::{
    Healer, HealerDefinition, Scaler, Scheduler, SchedulerDefinition, Task, WorkItemDefinition,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DaemonError, Result};

/// A definition together with the provider it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedEntry<D> {
    /// Provider id, the second segment of the store key.
    pub provider: String,
    /// The definition itself.
    #[serde(flatten)]
    pub definition: D,
}

/// Contents of a seed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedFile {
    /// Scaler definitions.
    #[serde(default)]
    pub scalers: Vec<SeedEntry<WorkItemDefinition>>,
    /// Healer definitions, at most one per provider.
    #[serde(default)]
    pub healers: Vec<SeedEntry<HealerDefinition>>,
    /// Scheduler definitions.
    #[serde(default)]
    pub schedulers: Vec<SeedEntry<SchedulerDefinition>>,
}

impl SeedFile {
    /// Reads a seed file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!("failed to read seed file '{}': {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scalers.len() + self.healers.len() + self.schedulers.len()
    }

    /// Returns true if the file lists nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validates every entry and returns the store writes it expands to.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Seed`] for the first invalid or duplicate entry.
    pub fn plan(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut seen = BTreeSet::new();
        let mut writes = Vec::with_capacity(self.len());

        for entry in &self.scalers {
            let key = keys::scaler_key(&entry.provider, &entry.definition.id);
            writes.push(prepare::<Scaler>(&mut seen, key, entry)?);
        }
        for entry in &self.healers {
            let key = keys::healer_key(&entry.provider);
            writes.push(prepare::<Healer>(&mut seen, key, entry)?);
        }
        for entry in &self.schedulers {
            let key = keys::scheduler_key(&entry.provider, &entry.definition.id);
            writes.push(prepare::<Scheduler>(&mut seen, key, entry)?);
        }
        Ok(writes)
    }

    /// Validates the whole file, then writes every entry to `store`.
    ///
    /// Returns the number of entries written.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (nothing is written) or a store
    /// write fails.
    pub async fn apply(&self, store: &dyn CoordinationStore) -> Result<usize> {
        let writes = self.plan()?;
        for (key, value) in &writes {
            store.put(key, value.clone()).await?;
            info!(key = %key, "seeded work item");
        }
        Ok(writes.len())
    }
}

fn prepare<T: Task>(
    seen: &mut BTreeSet<String>,
    key: String,
    entry: &SeedEntry<T::Definition>,
) -> Result<(String, Vec<u8>)> {
    let reject = |key: &str, reason: String| DaemonError::Seed {
        key: key.to_string(),
        reason,
    };

    if entry.provider.is_empty() || entry.provider.contains('/') {
        return Err(reject(&key, "provider must be a non-empty path segment".to_string()));
    }
    T::validate(&entry.definition).map_err(|e| reject(&key, e.to_string()))?;
    if !seen.insert(key.clone()) {
        return Err(reject(&key, "duplicate entry".to_string()));
    }

    let value = serde_json::to_vec(&entry.definition)?;
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_store::MemStore;

    const SEED: &str = r#"{
        "scalers": [
            { "provider": "aws", "id": "web", "query": "cpu > 0.9", "interval": "15s", "duration": "1m" },
            { "provider": "gcp", "id": "web", "query": "cpu > 0.9", "interval": "15s" }
        ],
        "healers": [
            { "provider": "aws", "id": "aws-healer", "query": "up == 0", "interval": "30s" }
        ],
        "schedulers": [
            { "provider": "aws", "id": "office", "from_cron": "0 9 * * 1-5", "to_cron": "0 18 * * 1-5" }
        ]
    }"#;

    fn parse(json: &str) -> SeedFile {
        serde_json::from_str(json).unwrap()
    }

    mod planning_tests {
        use super::*;

        #[test]
        fn test_keys_follow_layout() {
            let seed = parse(SEED);
            let keys: Vec<_> = seed.plan().unwrap().into_iter().map(|(k, _)| k).collect();
            assert_eq!(
                keys,
                vec![
                    "/scalers/aws/web",
                    "/scalers/gcp/web",
                    "/healers/aws",
                    "/schedulers/aws/office",
                ]
            );
            assert_eq!(seed.len(), 4);
        }

        #[test]
        fn test_provider_is_not_stored_in_value() {
            let seed = parse(SEED);
            let (_, value) = &seed.plan().unwrap()[0];
            let stored: serde_json::Value = serde_json::from_slice(value).unwrap();
            assert!(stored.get("provider").is_none());
            assert_eq!(stored["id"], "web");
        }

        #[test]
        fn test_duplicate_healer_is_rejected() {
            let seed = parse(
                r#"{ "healers": [
                    { "provider": "aws", "id": "a", "query": "up == 0", "interval": "30s" },
                    { "provider": "aws", "id": "b", "query": "up == 0", "interval": "30s" }
                ] }"#,
            );
            let err = seed.plan().unwrap_err();
            assert!(matches!(err, DaemonError::Seed { ref key, .. } if key == "/healers/aws"));
        }

        #[test]
        fn test_invalid_cron_is_rejected() {
            let seed = parse(
                r#"{ "schedulers": [
                    { "provider": "aws", "id": "bad", "from_cron": "0 25 * * *", "to_cron": "0 18 * * *" }
                ] }"#,
            );
            assert!(matches!(seed.plan(), Err(DaemonError::Seed { .. })));
        }

        #[test]
        fn test_provider_with_slash_is_rejected() {
            let seed = parse(
                r#"{ "scalers": [
                    { "provider": "aws/eu", "id": "web", "query": "cpu > 0.9", "interval": "15s" }
                ] }"#,
            );
            assert!(matches!(seed.plan(), Err(DaemonError::Seed { .. })));
        }
    }

    mod applying_tests {
        use super::*;

        #[tokio::test]
        async fn test_apply_writes_every_entry() {
            let store = MemStore::new();
            let written = parse(SEED).apply(&store).await.unwrap();

            assert_eq!(written, 4);
            assert_eq!(store.get_prefix(keys::SCALERS_PREFIX).await.unwrap().len(), 2);
            assert!(store.get("/healers/aws").await.unwrap().is_some());
        }

        #[tokio::test]
        async fn test_invalid_seed_writes_nothing() {
            let store = MemStore::new();
            let seed = parse(
                r#"{
                    "scalers": [{ "provider": "aws", "id": "web", "query": "cpu > 0.9", "interval": "15s" }],
                    "schedulers": [{ "provider": "aws", "id": "", "from_cron": "* * * * *", "to_cron": "* * * * *" }]
                }"#,
            );

            assert!(seed.apply(&store).await.is_err());
            assert!(store.get_prefix(keys::SCALERS_PREFIX).await.unwrap().is_empty());
        }

        #[test]
        fn test_load_from_file() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("seed.json");
            std::fs::write(&path, SEED).unwrap();
            assert_eq!(SeedFile::load(&path).unwrap().len(), 4);
        }
    }
}
