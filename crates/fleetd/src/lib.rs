//! Fleet control-plane daemon.
//!
//! `fleetd` joins the cluster, starts one manager per work-item domain and
//! keeps them running until a signal or a fatal store error. In standalone
//! mode the coordination store lives in-process and is filled from a seed
//! file.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod seed;

pub use config::{DEFAULT_CONFIG_PATH, DaemonConfig, LogFormat};
pub use daemon::{Daemon, worker_env};
pub use error::{DaemonError, Result};
pub use seed::{SeedEntry, SeedFile};
