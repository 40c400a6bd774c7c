//! Per-item workers for the fleet control plane.
//!
//! A [`Worker`] evaluates one work item on a timer. Query-driven kinds
//! ([`Scaler`], [`Healer`]) feed their backend answers into an [`Alert`] and
//! fire their actions once the condition has held for `duration`, at most
//! once per `cooldown`. [`Scheduler`] items fire when a cron window opens or
//! closes. Actions are run by the [`Dispatcher`], concurrently and with
//! bounded retry.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use chrono::Utc;
//! use fleet_worker::{
//!     Dispatcher, RecordingTransport, Sample, Scaler, StaticBackend, TickOutcome,
//!     WorkItemDefinition, Worker, WorkerEnv,
//! };
//!
//! # tokio_test::block_on(async {
//! let backend = Arc::new(StaticBackend::new());
//! backend.set_default(Ok(vec![Sample::labelled("instance", "10.0.0.1", 0.97)]));
//! let env = WorkerEnv::new(backend, Dispatcher::new(Arc::new(RecordingTransport::new())));
//!
//! let definition = WorkItemDefinition::new("web", "cpu > 0.9", Duration::from_secs(5));
//! let worker = Worker::<Scaler>::new("/scalers/aws/web", definition, &env)?;
//! assert!(matches!(worker.evaluate(Utc::now()).await, TickOutcome::Fired(_)));
//! # Ok::<(), fleet_worker::WorkerError>(())
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod action;
pub mod alert;
pub mod backend;
pub mod cron;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod healer;
pub mod retry;
pub mod scaler;
pub mod scheduler;
pub mod task;
pub mod transport;
pub mod worker;

pub use action::{
    Action, ActionKind, ActionTarget, FireContext, HttpAction, MailAction, Transition,
    WorkflowAction,
};
pub use alert::{Alert, AlertDecision};
pub use backend::{MetricsBackend, PrometheusBackend, Sample, StaticBackend};
pub use cron::CronSchedule;
pub use dispatch::{DispatchReport, DispatchStats, Dispatcher};
pub use domain::Domain;
pub use error::{ActionError, BackendError, Result, WorkerError};
pub use healer::{DEFAULT_INSTANCE_LABEL, Healer, HealerDefinition};
pub use retry::{DelayType, MAX_BACKOFF_DELAY, RetryPolicy, retry_with_policy};
pub use scaler::{Scaler, WorkItemDefinition};
pub use scheduler::{Scheduler, SchedulerDefinition, WindowState};
pub use task::{TaskHandle, spawn_supervised};
pub use transport::{
    ActionTransport, HttpTransport, HttpTransportConfig, RecordedCall, RecordingTransport,
};
pub use worker::{
    Task, TaskContext, TickOutcome, Worker, WorkerEnv, WorkerState, WorkerStats,
    WorkerStatsSnapshot,
};
