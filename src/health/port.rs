//! Port readiness probe

use super::backoff::ExponentialBackoff;
use super::HealthSettings;
use crate::error::{CorralError, CorralResult};
use crate::orchestration::{ProcessHandle, Runtime};
use crate::service::Port;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Dial `port` inside the resource's network namespace until a connection
/// succeeds
///
/// Retries back off exponentially and stop only on cancellation.
pub async fn wait_for_port(
    runtime: &dyn Runtime,
    handle: &ProcessHandle,
    port: &Port,
    settings: &HealthSettings,
    cancel: &CancellationToken,
) -> CorralResult<()> {
    let mut backoff = ExponentialBackoff::new(
        settings.initial_interval,
        settings.max_interval,
        settings.multiplier,
    );

    loop {
        match runtime.dial(handle, port, settings.dial_timeout).await {
            Ok(()) => {
                info!(process = %handle, port = %port, "port is healthy");
                return Ok(());
            }
            Err(e) => {
                warn!(process = %handle, port = %port, "port not ready: {}", e);
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return Err(CorralError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
