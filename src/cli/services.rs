//! Stack startup shared by `up` and `run`

use crate::config::Config;
use crate::error::CorralResult;
use crate::orchestration::create_runtime;
use crate::service::{Binding, ClientId, RegistrySettings, ServiceRegistry};
use crate::stack::Stack;
use crate::ui::{TaskSpinner, UiContext};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A registry with a stack's services bound to one client
pub(crate) struct RunningStack {
    pub registry: ServiceRegistry,
    pub binding: Binding,
}

impl RunningStack {
    /// Release the binding and stop everything the registry still runs
    pub async fn shutdown(self) -> CorralResult<()> {
        self.binding.release();
        self.registry.shutdown().await
    }
}

/// Cancel `cancel` on the first Ctrl-C
pub(crate) fn cancel_on_interrupt(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received");
            cancel.cancel();
        }
    });
}

/// Load `stack_path` and start every service in it
pub(crate) async fn start_stack(
    ctx: &UiContext,
    config: &Config,
    stack_path: &Path,
    cancel: &CancellationToken,
) -> CorralResult<RunningStack> {
    let stack = Stack::load(stack_path).await?;
    let bindings = stack.bindings()?;

    let runtime = create_runtime(&config.runtime)?;
    runtime.ensure_ready().await?;
    let registry = ServiceRegistry::new(runtime, RegistrySettings::from(config));

    let mut spinner = TaskSpinner::new(ctx);
    spinner.start(&format!(
        "Starting {} service(s) on {}",
        bindings.len(),
        registry.runtime().runtime_name()
    ));

    match registry.bind(ClientId::new(), &bindings, cancel).await {
        Ok(binding) => {
            spinner.stop(&format!("{} service(s) healthy", binding.len()));
            Ok(RunningStack { registry, binding })
        }
        Err(e) => {
            spinner.stop_error("Service startup failed");
            if let Err(stop_err) = registry.shutdown().await {
                warn!("Failed to stop services after startup failure: {}", stop_err);
            }
            Err(e)
        }
    }
}
