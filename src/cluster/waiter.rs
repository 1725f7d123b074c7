//! Deletion Waiter - blocks until a workload unit disappears from the platform

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::gateway::{ClusterGateway, GatewayError};

/// Default interval between existence checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound on how long to wait for a deletion
pub const DEFAULT_DELETION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("Timed out after {waited:?} waiting for '{name}' to be deleted")]
    Timeout { name: String, waited: Duration },

    #[error("Wait for deletion of '{0}' was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Platform(GatewayError),
}

/// Polls the gateway at a fixed interval until a unit is gone
#[derive(Debug, Clone, Copy)]
pub struct DeletionWaiter {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for DeletionWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_DELETION_TIMEOUT)
    }
}

impl DeletionWaiter {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until `get_workload_unit(name)` reports not-found.
    ///
    /// Any other gateway error fails immediately. The task sleeps between
    /// polls and wakes early if `cancel` fires.
    pub async fn await_deletion(
        &self,
        gateway: &dyn ClusterGateway,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        let start = Instant::now();
        let deadline = start + self.timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled(name.to_string()));
            }

            match gateway.get_workload_unit(name).await {
                Err(e) if e.is_not_found() => {
                    debug!(unit = name, waited = ?start.elapsed(), "Workload unit deleted");
                    return Ok(());
                }
                Err(e) => return Err(WaitError::Platform(e)),
                Ok(_) => trace!(unit = name, "Workload unit still present"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout {
                    name: name.to_string(),
                    waited: start.elapsed(),
                });
            }
            let next_poll = (now + self.poll_interval).min(deadline);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled(name.to_string()));
                }
                _ = tokio::time::sleep_until(next_poll) => {}
            }
        }
    }
}
