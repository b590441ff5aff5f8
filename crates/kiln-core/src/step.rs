//! Build steps, pre-build hooks and source control.

use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::changelog::ChangeLogSet;
use crate::channel::RemoteChannel;
use crate::console::Console;
use crate::env::EnvVars;
use crate::fingerprint::FingerprintRecorder;
use crate::run::Run;
use crate::{BuildResult, Result};

/// What a step hands to the build while it runs.
pub struct StepContext<'a> {
    /// The build being executed. Steps may attach actions; the result is
    /// applied by the runner from the returned outcome.
    pub run: &'a mut Run,
    pub env: &'a EnvVars,
    pub workspace: &'a Path,
    pub channel: &'a dyn RemoteChannel,
    pub console: &'a Console,
    /// Cancelled when the build is aborted.
    pub cancel: &'a CancellationToken,
    pub fingerprints: &'a dyn FingerprintRecorder,
}

/// Result of a step that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Continue with the next step; the build result becomes at least this bad.
    Done(BuildResult),
    /// Stop the current phase and go to cleanup.
    Fatal(BuildResult),
}

impl StepOutcome {
    pub fn result(self) -> BuildResult {
        match self {
            StepOutcome::Done(r) | StepOutcome::Fatal(r) => r,
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, StepOutcome::Fatal(_))
    }
}

/// A builder or publisher.
#[async_trait]
pub trait BuildStep: Send + Sync {
    /// Name shown in the console.
    fn name(&self) -> &str;

    /// Errors are caught by the runner, logged with the step name and
    /// demote the build to FAILURE.
    async fn perform(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome>;
}

/// Check run before the build steps. Returning false fails the build.
#[async_trait]
pub trait PreBuildHook: Send + Sync {
    fn name(&self) -> &str;

    async fn prebuild(&self, ctx: &mut StepContext<'_>) -> Result<bool>;
}

/// What checkout produced.
#[derive(Debug, Clone, Default)]
pub struct Checkout {
    pub revision: Option<String>,
    pub changes: ChangeLogSet,
}

/// Inputs of a checkout attempt.
pub struct CheckoutContext<'a> {
    pub run: &'a Run,
    /// Revision built by the previous build of the job, if known.
    pub previous_revision: Option<&'a str>,
    pub workspace: &'a Path,
    pub env: &'a EnvVars,
    pub channel: &'a dyn RemoteChannel,
    pub console: &'a Console,
    pub cancel: &'a CancellationToken,
}

/// Source control retrieval into a workspace.
///
/// `Error::Interrupted` aborts the build; every other error counts as a
/// failed attempt and is retried.
#[async_trait]
pub trait Scm: Send + Sync {
    fn name(&self) -> &str;

    async fn checkout(&self, ctx: &CheckoutContext<'_>) -> Result<Checkout>;

    /// Variables this SCM contributes to the build environment.
    fn build_env(&self, _env: &mut EnvVars) {}
}

/// No source control: the workspace is used as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScm;

#[async_trait]
impl Scm for NullScm {
    fn name(&self) -> &str {
        "none"
    }

    async fn checkout(&self, _ctx: &CheckoutContext<'_>) -> Result<Checkout> {
        Ok(Checkout::default())
    }
}
