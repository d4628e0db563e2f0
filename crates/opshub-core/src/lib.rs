//! opshub-core: Shared library for the opshub remote connection manager.
//!
//! This crate provides:
//! - The error taxonomy used across the lifecycle core
//! - Remote endpoint descriptors (address, credentials, tunnel chain)
//! - The replay-log record codec (stable external format)
//! - The typed stats snapshot model and its command-output parsers
//! - Logging setup

pub mod constants;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod record;
pub mod stats;

pub use endpoint::{AuthMethod, Endpoint, MachineStatus, ResourceId};
pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
pub use stats::StatsSnapshot;
