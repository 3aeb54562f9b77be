//! Run command - run a host command with a stack's services attached

use crate::cli::args::RunArgs;
use crate::cli::services::{cancel_on_interrupt, start_stack};
use crate::config::Config;
use crate::error::{CorralError, CorralResult};
use crate::ui::UiContext;
use std::collections::BTreeMap;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Execute the run command
pub async fn execute(args: RunArgs, config: &Config) -> CorralResult<()> {
    let ctx = UiContext::detect();
    let cancel = CancellationToken::new();
    cancel_on_interrupt(&cancel);

    let stack = start_stack(&ctx, config, &args.file, &cancel).await?;
    let env = stack.binding.env();

    let result = run_command(&args.command, &env, &cancel).await;

    if let Err(e) = stack.shutdown().await {
        warn!("Failed to stop services: {}", e);
    }
    result
}

async fn run_command(
    command: &[String],
    env: &BTreeMap<String, String>,
    cancel: &CancellationToken,
) -> CorralResult<()> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| CorralError::User("No command given".to_string()))?;
    let display = command.join(" ");

    debug!("Running {:?} with {} alias variable(s)", command, env.len());
    let mut child = Command::new(program)
        .args(rest)
        .envs(env)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CorralError::command_failed(display.clone(), e))?;

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status.map_err(|e| CorralError::command_failed(display.clone(), e))?,
        None => {
            info!("Interrupted, killing {}", program);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", program, e);
            }
            return Err(CorralError::Cancelled);
        }
    };

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(CorralError::CommandExit {
            command: display,
            code,
        }),
        None => Err(CorralError::ProcessSignaled),
    }
}
