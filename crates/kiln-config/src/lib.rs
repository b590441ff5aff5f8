//! KDL configuration parsing for the Kiln build server.
//!
//! This crate handles parsing of:
//! - Job definitions (`jobs.kdl`)
//! - Controller configuration (`kiln.kdl`)

pub mod error;
pub mod jobs;
mod kdl_util;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use jobs::{load_jobs, parse_job_document, parse_jobs};
pub use system::{SystemConfig, load_system_config, parse_system_config};
