//! Core domain types and traits for the Kiln build server.
//!
//! This crate contains:
//! - Identifiers, build results and the build record (`Run`)
//! - Job definitions and the job dependency graph
//! - Nodes and label expressions
//! - Build environments
//! - Fingerprints and range sets
//! - Collaborator traits: remote execution channel, persistence, SCM, build steps

pub mod changelog;
pub mod channel;
pub mod console;
pub mod env;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod job;
pub mod node;
pub mod persistence;
pub mod result;
pub mod run;
pub mod step;

pub use error::{Error, Result};
pub use id::{BuildPtr, QueueId, ResourceId};
pub use result::BuildResult;
