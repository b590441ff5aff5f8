//! Execution backends for Kiln.
//!
//! - [`local::LocalChannel`] runs processes on the controller's own machine
//! - [`git::GitScm`] checks sources out through the node's `git`
//! - [`steps`] holds the built-in builders, publishers and pre-build hooks

pub mod git;
pub mod local;
pub mod process;
pub mod steps;

pub use git::GitScm;
pub use local::LocalChannel;
pub use process::{run_captured, run_logged, Captured};
pub use steps::{build_step, prebuild_hook, FingerprintStep, RequireEnvHook, ShellStep};

use kiln_core::job::ScmSpec;
use kiln_core::step::{NullScm, Scm};
use std::sync::Arc;

/// Instantiate the SCM a job is configured with.
pub fn scm_for(spec: &ScmSpec) -> Arc<dyn Scm> {
    match spec {
        ScmSpec::None => Arc::new(NullScm),
        ScmSpec::Git { url, branch } => Arc::new(GitScm::new(url.clone(), branch.clone())),
    }
}
