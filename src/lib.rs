#![forbid(unsafe_code)]

//! Supervision and control plane for an external terminal-server process.

pub mod config;
pub mod control;
pub mod errors;
pub mod lifecycle;
pub mod supervisor;
pub mod window;

pub use config::SupervisorConfig;
pub use errors::{AppError, Result};
