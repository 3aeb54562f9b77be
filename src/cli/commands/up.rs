//! Up command - start a stack and hold it until interrupted

use crate::cli::args::UpArgs;
use crate::cli::services::{cancel_on_interrupt, start_stack};
use crate::config::Config;
use crate::error::CorralResult;
use crate::service::{ServiceBinding, ServiceHandle, ServiceRegistry};
use crate::ui::{self, UiContext};
use console::style;
use tokio_util::sync::CancellationToken;

/// Execute the up command
pub async fn execute(args: UpArgs, config: &Config) -> CorralResult<()> {
    let ctx = UiContext::detect();
    let cancel = CancellationToken::new();
    cancel_on_interrupt(&cancel);

    let stack = start_stack(&ctx, config, &args.file, &cancel).await?;

    ui::section("Services");
    for (binding, handle) in stack.binding.bound() {
        print_service(&stack.registry, binding, handle).await;
    }

    println!();
    println!("{}", style("Press Ctrl-C to stop").dim());
    cancel.cancelled().await;

    println!();
    println!("{}", style("Stopping services...").dim());
    stack.shutdown().await
}

async fn print_service(registry: &ServiceRegistry, binding: &ServiceBinding, handle: &ServiceHandle) {
    let address = registry
        .runtime()
        .network_address(handle.process())
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    let ports = handle
        .ports()
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    println!(
        "  {} {}",
        style(handle.hostname()).cyan().bold(),
        style(&binding.aliases).dim()
    );
    ui::key_value("hostname", &handle.full_hostname());
    ui::key_value("address", &address);
    if !ports.is_empty() {
        ui::key_value("ports", &ports);
    }
    ui::key_value("process", handle.process().short_id());
}
