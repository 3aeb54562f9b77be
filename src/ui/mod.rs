//! Terminal output for the CLI
//!
//! Spinners and colored markers in an interactive terminal, plain tagged
//! lines when output is piped or running under CI.

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{key_value, section, step_ok, step_ok_detail, step_warn};
pub use progress::TaskSpinner;
