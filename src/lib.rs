#![forbid(unsafe_code)]

//! Resilient five-stage incident pipeline orchestrator.

pub mod api;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod resilience;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
