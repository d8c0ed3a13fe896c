//! Token liveness monitor.

use crate::session::SessionManager;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to the recurring liveness check.
///
/// The task is stopped only through [`MonitorHandle::stop`] or when the
/// session manager it watches is dropped; there is no implicit teardown.
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Spawn the liveness task. Each tick re-validates the session's access
    /// token via [`SessionManager::liveness_tick`].
    pub(crate) fn spawn(session: Weak<SessionManager>, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // interval fires immediately; the first real check is one period out
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match session.upgrade() {
                    Some(session) => session.liveness_tick().await,
                    None => {
                        debug!("session manager dropped, liveness monitor exiting");
                        break;
                    }
                }
            }
        });

        Self { task }
    }

    /// Whether the task is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the task.
    pub fn stop(self) {
        self.task.abort();
    }
}
