//! Graceful shutdown coordination via `CancellationToken`.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Coordinates graceful shutdown across all server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then wait until `deadline` for every task in `tracker`.
    ///
    /// Returns `true` if all tracked tasks finished in time.
    pub async fn drain(&self, tracker: &TaskTracker, deadline: Instant) -> bool {
        self.shutdown();
        let _ = tracker.close();
        info!(task_count = tracker.len(), "waiting for sessions to finish");

        if tokio::time::timeout_at(deadline, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "drain deadline reached, some sessions still running");
            false
        } else {
            true
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
