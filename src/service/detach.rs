//! Delayed teardown after the last detach

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Runs teardown work once a grace period has elapsed
///
/// The scheduled work re-checks the binding count itself, so a reattach
/// during the grace period turns the teardown into a no-op.
#[derive(Debug, Clone)]
pub struct DetachScheduler {
    grace: Duration,
}

impl DetachScheduler {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Run `teardown` after the grace period on the current tokio runtime
    ///
    /// Returns false if called outside a runtime, in which case nothing is
    /// scheduled.
    pub fn schedule<F>(&self, what: &str, teardown: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime; teardown of {} not scheduled", what);
                return false;
            }
        };

        debug!("Scheduling teardown of {} in {:?}", what, self.grace);
        let grace = self.grace;
        handle.spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            teardown.await;
        });
        true
    }
}
