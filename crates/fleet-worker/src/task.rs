//! Supervised background tasks.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Handle to a spawned task that can be cancelled and awaited.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Spawns `f` with a fresh cancellation token.
///
/// The future must exit promptly once the token is cancelled.
pub fn spawn_supervised<F, Fut>(name: impl Into<String>, f: F) -> TaskHandle
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let join = tokio::spawn(f(cancel.clone()));
    TaskHandle {
        name: name.into(),
        cancel,
        join,
    }
}

impl TaskHandle {
    /// Returns the task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cancellation without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the task to exit. A panic is logged, not propagated.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(task = %self.name, error = %e, "task exited abnormally");
        }
    }

    /// Cancels the task and waits for it to exit.
    pub async fn stop(self) {
        self.cancel();
        self.join().await;
    }
}
