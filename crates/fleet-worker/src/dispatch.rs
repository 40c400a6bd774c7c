//! Concurrent action dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::action::{Action, ActionTarget, FireContext};
use crate::error::ActionError;
use crate::retry::retry_with_policy;
use crate::transport::ActionTransport;

/// Outcome of one `dispatch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Actions that eventually succeeded.
    pub succeeded: usize,
    /// Actions that failed after retries.
    pub failed: usize,
}

impl DispatchReport {
    /// Returns true if no action failed.
    #[must_use]
    pub const fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Lifetime counters of a dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl DispatchStats {
    /// Actions that succeeded.
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Actions that failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Runs an action set concurrently over a shared transport.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn ActionTransport>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(transport: Arc<dyn ActionTransport>) -> Self {
        Self {
            transport,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Returns the lifetime counters.
    #[must_use]
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Executes every action in its own task and waits for all of them.
    ///
    /// A failing action never cancels its siblings.
    pub async fn dispatch(&self, actions: &[Action], ctx: &FireContext) -> DispatchReport {
        let mut set = JoinSet::new();
        for (index, action) in actions.iter().cloned().enumerate() {
            let transport = Arc::clone(&self.transport);
            let ctx = ctx.clone();
            set.spawn(async move {
                let result = retry_with_policy(&action.retry, |_| {
                    send_once(transport.as_ref(), &action.target, &ctx)
                })
                .await;
                (index, action, result)
            });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, action, Ok(()))) => {
                    report.succeeded += 1;
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    info!(
                        key = %ctx.key,
                        fire_id = %ctx.fire_id,
                        index,
                        kind = %action.kind(),
                        destination = %action.destination(),
                        "action executed"
                    );
                }
                Ok((index, action, Err(e))) => {
                    report.failed += 1;
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %ctx.key,
                        fire_id = %ctx.fire_id,
                        index,
                        kind = %action.kind(),
                        destination = %action.destination(),
                        error = %e,
                        "action failed"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(key = %ctx.key, fire_id = %ctx.fire_id, error = %e, "action task aborted");
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("succeeded", &self.stats.succeeded())
            .field("failed", &self.stats.failed())
            .finish_non_exhaustive()
    }
}

async fn send_once(
    transport: &dyn ActionTransport,
    target: &ActionTarget,
    ctx: &FireContext,
) -> Result<(), ActionError> {
    match target {
        ActionTarget::Http(http) => transport.send_http(http, ctx).await,
        ActionTarget::Mail(mail) => transport.send_mail(mail, ctx).await,
        ActionTarget::WorkflowTrigger(workflow) => transport.trigger_workflow(workflow, ctx).await,
    }
}
