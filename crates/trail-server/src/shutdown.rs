//! Orderly stop of the daemon's long-running tasks.
//!
//! Every task watches one `CancellationToken` and is registered here under a
//! name. Stopping cancels the token, then gives the tasks a shared grace
//! period; whatever is still running after it is aborted and reported.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a task that should exit once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Track `handle` so `stop` waits for it.
    pub fn register(&mut self, name: &'static str, handle: JoinHandle<()>) {
        debug!(task = name, "task registered for shutdown");
        self.tasks.push((name, handle));
    }

    /// Cancel the token and wait for registered tasks, in registration order,
    /// until `grace` runs out. Returns the names of tasks that had to be aborted.
    pub async fn stop(&mut self, grace: Duration) -> Vec<&'static str> {
        self.token.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        info!(tasks = tasks.len(), grace_ms = grace.as_millis() as u64, "stopping tasks");

        let deadline = Instant::now() + grace;
        let mut aborted = Vec::new();
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    handle.abort();
                    warn!(task = name, "task outlived the grace period, aborted");
                    aborted.push(name);
                }
            }
        }
        aborted
    }
}
