//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Corral - shared service and cache lifecycle for container builds
///
/// Starts the services declared in a stack file once, shares them between
/// every consumer that asks for the same definition, and tears them down a
/// grace period after the last consumer lets go.
#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CORRAL_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the content digest of a JSON or TOML document
    Digest(DigestArgs),

    /// Start every service in a stack and keep it running until interrupted
    Up(UpArgs),

    /// Run a host command with a stack's services attached
    Run(RunArgs),

    /// Check runtime availability
    Status,

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the digest command
#[derive(Parser, Debug)]
pub struct DigestArgs {
    /// Document to digest (reads stdin when omitted)
    pub file: Option<PathBuf>,

    /// Input format
    #[arg(short, long, default_value = "auto")]
    pub format: InputFormat,

    /// Print the 12-character short form
    #[arg(long)]
    pub short: bool,
}

/// Input format for the digest command
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputFormat {
    /// JSON, falling back to TOML
    Auto,
    Json,
    Toml,
}

/// Arguments for the up command
#[derive(Parser, Debug)]
pub struct UpArgs {
    /// Stack file
    #[arg(short, long, default_value = "corral.toml")]
    pub file: PathBuf,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Stack file
    #[arg(short, long, default_value = "corral.toml")]
    pub file: PathBuf,

    /// Command and arguments to run
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., services.detach_grace_ms)
        key: String,
        /// Value to set
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_trailing_command() {
        let cli = Cli::parse_from(["corral", "run", "-f", "stack.toml", "--", "psql", "-c", "select 1"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.file, PathBuf::from("stack.toml"));
                assert_eq!(args.command, vec!["psql", "-c", "select 1"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn digest_defaults() {
        let cli = Cli::parse_from(["corral", "digest"]);
        match cli.command {
            Commands::Digest(args) => {
                assert!(args.file.is_none());
                assert_eq!(args.format, InputFormat::Auto);
                assert!(!args.short);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::parse_from(["corral", "status", "-vv"]);
        assert_eq!(cli.verbose, 2);
    }
}
