//! Worker managers for the fleet control plane.
//!
//! One [`Manager`] runs per work-item domain. It starts workers for the items
//! the local member owns, follows definition changes through a store watch,
//! and rebalances whenever cluster membership changes: items that moved away
//! are stopped and their runtime state persisted so the new owner resumes
//! them where they left off.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod manager;

use fleet_worker::{Healer, Scaler, Scheduler};

pub use error::{ManagerError, Result};
pub use manager::{
    DEFAULT_BOUNDARY_TICK, Manager, ManagerConfig, ManagerState, ManagerStats, RebalanceReport,
};

/// Manager of the scaler domain.
pub type ScalerManager = Manager<Scaler>;
/// Manager of the healer domain.
pub type HealerManager = Manager<Healer>;
/// Manager of the scheduler domain.
pub type SchedulerManager = Manager<Scheduler>;
