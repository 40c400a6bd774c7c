//! Daemon configuration.
//!
//! Configuration for the fleet daemon, including:
//! - Member identity and ring settings
//! - Coordination store endpoints
//! - Metrics backend and action transport endpoints
//! - Scheduler boundary tick and logging format

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use fleet_cluster::MembershipConfig;
use fleet_worker::HttpTransportConfig;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DaemonError, Result};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleetd/config.json";

/// Upper bound on ring points per member.
const MAX_VIRTUAL_NODES: usize = 1024;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Member name, unique per bind address.
    pub name: String,
    /// Address this process is bound to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// TTL of the member lease.
    #[serde(default = "default_lease_ttl", with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// Virtual ring points per member.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    /// etcd endpoints. Empty runs a single member over an in-process store.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub store_endpoints: Vec<String>,
    /// Connect and request timeout of the coordination store.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,
    /// Base URL of the Prometheus-compatible metrics backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_url: Option<String>,
    /// Per-request timeout of backend queries and actions.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Endpoint accepting mail actions as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail_relay: Option<String>,
    /// Base URL of the workflow service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_endpoint: Option<String>,
    /// Boundary tick of the scheduler domain.
    #[serde(default = "default_scheduler_tick", with = "humantime_serde")]
    pub scheduler_tick: Duration,
    /// Lease expiry sweep period of the in-process store.
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub reaper_interval: Duration,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_lease_ttl() -> Duration {
    fleet_cluster::DEFAULT_LEASE_TTL
}

fn default_virtual_nodes() -> usize {
    fleet_cluster::DEFAULT_VIRTUAL_NODES
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_scheduler_tick() -> Duration {
    fleet_manager::DEFAULT_BOUNDARY_TICK
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(1)
}

impl DaemonConfig {
    /// Creates a configuration with defaults for everything but the name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_address: default_bind_address(),
            lease_ttl: default_lease_ttl(),
            virtual_nodes: default_virtual_nodes(),
            store_endpoints: Vec::new(),
            store_timeout: default_store_timeout(),
            metrics_url: None,
            http_timeout: default_http_timeout(),
            mail_relay: None,
            workflow_endpoint: None,
            scheduler_tick: default_scheduler_tick(),
            reaper_interval: default_reaper_interval(),
            log_format: LogFormat::Text,
        }
    }

    /// Load and validate configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| DaemonError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DaemonError::Config("name cannot be empty".to_string()));
        }

        if self.name.len() > 64 {
            return Err(DaemonError::Config(
                "name cannot exceed 64 characters".to_string(),
            ));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DaemonError::Config(
                "name must contain only alphanumeric characters, hyphens, and underscores"
                    .to_string(),
            ));
        }

        if self.lease_ttl < Duration::from_secs(1) {
            return Err(DaemonError::Config(
                "lease_ttl must be at least 1s".to_string(),
            ));
        }

        if self.virtual_nodes == 0 || self.virtual_nodes > MAX_VIRTUAL_NODES {
            return Err(DaemonError::Config(format!(
                "virtual_nodes must be between 1 and {MAX_VIRTUAL_NODES}"
            )));
        }

        for (field, value) in [
            ("store_timeout", self.store_timeout),
            ("http_timeout", self.http_timeout),
            ("scheduler_tick", self.scheduler_tick),
            ("reaper_interval", self.reaper_interval),
        ] {
            if value.is_zero() {
                return Err(DaemonError::Config(format!(
                    "{field} must be greater than 0"
                )));
            }
        }

        for (field, value) in [
            ("metrics_url", &self.metrics_url),
            ("mail_relay", &self.mail_relay),
            ("workflow_endpoint", &self.workflow_endpoint),
        ] {
            if let Some(raw) = value {
                check_http_url(field, raw)?;
            }
        }

        for endpoint in &self.store_endpoints {
            check_http_url("store_endpoints", endpoint)?;
        }

        Ok(())
    }

    /// Returns true if the store is an external etcd cluster.
    #[must_use]
    pub fn uses_external_store(&self) -> bool {
        !self.store_endpoints.is_empty()
    }

    /// Membership settings derived from this configuration.
    #[must_use]
    pub fn membership(&self) -> MembershipConfig {
        MembershipConfig {
            name: self.name.clone(),
            bind_address: self.bind_address,
            lease_ttl: self.lease_ttl,
            keepalive_interval: None,
            virtual_nodes: self.virtual_nodes,
        }
    }

    /// Transport settings derived from this configuration.
    #[must_use]
    pub fn transport(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            timeout: self.http_timeout,
            mail_relay: self.mail_relay.clone(),
            workflow_endpoint: self.workflow_endpoint.clone(),
        }
    }
}

fn check_http_url(field: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| DaemonError::Config(format!("{field} is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DaemonError::Config(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parsing_tests {
        use super::*;

        #[test]
        fn test_minimal_config_applies_defaults() {
            let config = DaemonConfig::from_json(r#"{ "name": "fleet-a" }"#).unwrap();

            assert_eq!(config.name, "fleet-a");
            assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
            assert_eq!(config.lease_ttl, Duration::from_secs(30));
            assert_eq!(config.scheduler_tick, Duration::from_secs(30));
            assert_eq!(config.metrics_url, None);
            assert_eq!(config.log_format, LogFormat::Text);
            assert!(!config.uses_external_store());
        }

        #[test]
        fn test_full_config() {
            let json = r#"{
                "name": "fleet-b",
                "bind_address": "10.0.0.7",
                "lease_ttl": "10s",
                "virtual_nodes": 16,
                "store_endpoints": ["http://etcd-0:2379", "http://etcd-1:2379"],
                "store_timeout": "2s",
                "metrics_url": "http://prometheus:9090",
                "http_timeout": "3s",
                "mail_relay": "http://mailer.local/send",
                "workflow_endpoint": "https://flows.local/api/workflows",
                "scheduler_tick": "1m",
                "reaper_interval": "250ms",
                "log_format": "json"
            }"#;

            let config = DaemonConfig::from_json(json).unwrap();

            assert_eq!(config.bind_address, "10.0.0.7".parse::<IpAddr>().unwrap());
            assert_eq!(config.lease_ttl, Duration::from_secs(10));
            assert_eq!(config.virtual_nodes, 16);
            assert_eq!(config.store_endpoints.len(), 2);
            assert_eq!(config.store_timeout, Duration::from_secs(2));
            assert!(config.uses_external_store());
            assert_eq!(config.scheduler_tick, Duration::from_secs(60));
            assert_eq!(config.reaper_interval, Duration::from_millis(250));
            assert_eq!(config.log_format, LogFormat::Json);
            assert_eq!(config.transport().timeout, Duration::from_secs(3));
            assert_eq!(config.membership().virtual_nodes, 16);
        }

        #[test]
        fn test_missing_name_is_rejected() {
            let err = DaemonConfig::from_json("{}").unwrap_err();
            assert!(err.to_string().contains("invalid JSON"));
        }
    }

    mod validation_tests {
        use super::*;

        #[test]
        fn test_empty_name() {
            let err = DaemonConfig::new("").validate().unwrap_err();
            assert!(err.to_string().contains("name cannot be empty"));
        }

        #[test]
        fn test_name_with_invalid_characters() {
            let err = DaemonConfig::new("fleet a").validate().unwrap_err();
            assert!(err.to_string().contains("alphanumeric"));
        }

        #[test]
        fn test_short_lease_ttl() {
            let mut config = DaemonConfig::new("fleet-a");
            config.lease_ttl = Duration::from_millis(200);
            assert!(config.validate().is_err());
        }

        #[test]
        fn test_zero_virtual_nodes() {
            let mut config = DaemonConfig::new("fleet-a");
            config.virtual_nodes = 0;
            assert!(config.validate().is_err());
        }

        #[test]
        fn test_zero_scheduler_tick() {
            let mut config = DaemonConfig::new("fleet-a");
            config.scheduler_tick = Duration::ZERO;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("scheduler_tick"));
        }

        #[test]
        fn test_store_endpoint_without_scheme() {
            let mut config = DaemonConfig::new("fleet-a");
            config.store_endpoints = vec!["etcd-0:2379".to_string()];
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("store_endpoints"));
        }

        #[test]
        fn test_zero_store_timeout() {
            let mut config = DaemonConfig::new("fleet-a");
            config.store_timeout = Duration::ZERO;
            assert!(config.validate().unwrap_err().to_string().contains("store_timeout"));
        }

        #[test]
        fn test_non_http_metrics_url() {
            let mut config = DaemonConfig::new("fleet-a");
            config.metrics_url = Some("ftp://prometheus".to_string());
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("metrics_url"));
        }
    }

    mod persistence_tests {
        use super::*;

        #[test]
        fn test_save_then_load() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("config.json");

            let mut config = DaemonConfig::new("fleet-a");
            config.metrics_url = Some("http://prometheus:9090".to_string());
            config.save(&path).unwrap();

            assert_eq!(DaemonConfig::load(&path).unwrap(), config);
        }

        #[test]
        fn test_load_missing_file() {
            let dir = tempfile::tempdir().unwrap();
            let err = DaemonConfig::load(dir.path().join("absent.json")).unwrap_err();
            assert!(err.to_string().contains("failed to read config file"));
        }
    }
}
