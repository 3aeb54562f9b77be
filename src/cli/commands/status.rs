//! Status command - check runtime availability

use crate::config::{Config, ConfigManager};
use crate::error::CorralResult;
use crate::orchestration::{create_runtime, Backend};
use console::{style, Emoji};
use std::process::Stdio;
use tokio::process::Command;

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[FAIL] ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "[WARN] ");

/// Execute the status command
pub async fn execute(config: &Config, manager: &ConfigManager) -> CorralResult<()> {
    println!("{}", style("Corral System Status").bold().cyan());
    println!();

    println!("{}", style("Configuration:").bold());
    if manager.path().exists() {
        println!("  {} {}", CHECK, manager.path().display());
    } else {
        println!(
            "  {} {} - Run: corral config init",
            WARN,
            style("Using defaults").yellow()
        );
    }

    let all_ok = match Backend::parse(&config.runtime.backend) {
        Ok(Backend::Podman) => check_podman(config).await,
        Ok(Backend::Process) => {
            println!();
            println!("{}", style("Runtime (host processes):").bold());
            println!(
                "  {} {} - services run unisolated on this host",
                WARN,
                style("No container isolation").yellow()
            );
            true
        }
        Err(e) => {
            println!();
            println!("  {} {}", CROSS, style(e).red());
            false
        }
    };

    println!();
    if all_ok {
        println!("{}", style("All critical checks passed").green().bold());
    } else {
        println!(
            "{}",
            style("Some checks failed - see above for details").yellow().bold()
        );
    }

    Ok(())
}

async fn check_podman(config: &Config) -> bool {
    println!();
    println!("{}", style("Podman:").bold());

    let version = Command::new("podman")
        .arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match version {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let first_line = stdout.lines().next().unwrap_or("unknown");
            println!("  {} {}", CHECK, style(first_line.trim()).green());
        }
        _ => {
            println!(
                "  {} {} - Install from https://podman.io",
                CROSS,
                style("Not installed").red()
            );
            return false;
        }
    }

    match create_runtime(&config.runtime) {
        Ok(runtime) => match runtime.ensure_ready().await {
            Ok(()) => {
                println!("  {} {}", CHECK, style("Rootless mode").green());
                println!("  {} Network: {}", CHECK, config.runtime.network);
                true
            }
            Err(e) => {
                let hint = e.hint().unwrap_or("see podman info");
                println!("  {} {} - {}", WARN, style(e).yellow(), hint);
                false
            }
        },
        Err(e) => {
            println!("  {} {} - {}", CROSS, style("Error").red(), e);
            false
        }
    }
}
