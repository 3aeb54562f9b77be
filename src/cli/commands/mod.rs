//! CLI command implementations

pub mod config;
pub mod digest;
pub mod run;
pub mod status;
pub mod up;

pub use config::execute as config;
pub use digest::execute as digest;
pub use run::execute as run;
pub use status::execute as status;
pub use up::execute as up;
