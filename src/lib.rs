//! Corral - shared service and cache lifecycle for container builds
//!
//! Deduplicates expensive content-addressed work through a single-flight
//! [`cache::KeyedCache`] and runs long-lived network services through a
//! reference-counted [`service::ServiceRegistry`], so identical requests
//! share one computation and one running instance.

pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod health;
pub mod orchestration;
pub mod service;
pub mod stack;
pub mod ui;

pub use error::{CorralError, CorralResult};
