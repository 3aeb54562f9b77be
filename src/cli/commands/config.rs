//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{CorralError, CorralResult};
use crate::orchestration::Backend;
use crate::ui::{self, UiContext};

const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "runtime.backend",
    "runtime.network",
    "runtime.dial_image",
    "services.detach_grace_ms",
    "health.initial_interval_ms",
    "health.max_interval_ms",
    "health.multiplier",
    "health.dial_timeout_ms",
    "health.port_deadline_secs",
    "health.command_timeout_secs",
    "health.command_interval_ms",
];

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> CorralResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let mut config = config.clone();
            set_value(&mut config, &key, &value)?;
            manager.save(&config).await?;
            ui::step_ok(&UiContext::detect(), &format!("Set {} = {}", key, value));
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> CorralResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> CorralResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn(
            &ctx,
            &format!("Config already exists at {} (use --force to overwrite)", path.display()),
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}

/// Apply one dotted `key = value` assignment
pub fn set_value(config: &mut Config, key: &str, value: &str) -> CorralResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => match value {
            "text" | "json" => config.general.log_format = value.to_string(),
            _ => return Err(invalid(key, value, "expected text or json")),
        },
        ["runtime", "backend"] => {
            config.runtime.backend = Backend::parse(value)?.name().to_string();
        }
        ["runtime", "network"] => config.runtime.network = value.to_string(),
        ["runtime", "dial_image"] => config.runtime.dial_image = value.to_string(),
        ["services", "detach_grace_ms"] => config.services.detach_grace_ms = parse_u64(key, value)?,
        ["health", "initial_interval_ms"] => config.health.initial_interval_ms = parse_u64(key, value)?,
        ["health", "max_interval_ms"] => config.health.max_interval_ms = parse_u64(key, value)?,
        ["health", "multiplier"] => {
            config.health.multiplier = value
                .parse::<f64>()
                .ok()
                .filter(|m| m.is_finite() && *m >= 1.0)
                .ok_or_else(|| invalid(key, value, "expected a number >= 1"))?;
        }
        ["health", "dial_timeout_ms"] => config.health.dial_timeout_ms = parse_u64(key, value)?,
        ["health", "port_deadline_secs"] => config.health.port_deadline_secs = parse_u64(key, value)?,
        ["health", "command_timeout_secs"] => {
            config.health.command_timeout_secs = parse_u64(key, value)?
        }
        ["health", "command_interval_ms"] => {
            config.health.command_interval_ms = parse_u64(key, value)?
        }
        _ => {
            return Err(CorralError::User(format!(
                "Unknown config key: {}. Valid keys: {}",
                key,
                VALID_KEYS.join(", ")
            )))
        }
    }

    Ok(())
}

fn parse_u64(key: &str, value: &str) -> CorralResult<u64> {
    value
        .parse()
        .map_err(|_| invalid(key, value, "expected a non-negative integer"))
}

fn invalid(key: &str, value: &str, reason: &str) -> CorralError {
    CorralError::User(format!("Invalid value '{}' for {}: {}", value, key, reason))
}
