//! What a build does between checkout and cleanup, per kind of job.

use async_trait::async_trait;
use kiln_core::channel::RemoteChannel;
use kiln_core::console::Console;
use kiln_core::env::EnvVars;
use kiln_core::fingerprint::FingerprintRecorder;
use kiln_core::job::JobDef;
use kiln_core::run::Run;
use kiln_core::step::{BuildStep, PreBuildHook, Scm, StepContext};
use kiln_core::{BuildResult, Error, Result};
use kiln_executor::{build_step, prebuild_hook};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Runs steps against one build and applies their results.
pub struct StepRunner<'a> {
    pub run: &'a mut Run,
    pub env: &'a EnvVars,
    pub workspace: &'a Path,
    pub channel: &'a dyn RemoteChannel,
    pub console: &'a Console,
    pub cancel: &'a CancellationToken,
    pub fingerprints: &'a dyn FingerprintRecorder,
}

impl StepRunner<'_> {
    fn context(&mut self) -> StepContext<'_> {
        StepContext {
            run: &mut *self.run,
            env: self.env,
            workspace: self.workspace,
            channel: self.channel,
            console: self.console,
            cancel: self.cancel,
            fingerprints: self.fingerprints,
        }
    }

    /// Run one build step.
    ///
    /// A step error is logged with the step name and demotes the build to
    /// FAILURE. Returns false when the step asked to stop the build.
    pub async fn perform(&mut self, step: &dyn BuildStep) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        let before = self.run.result().unwrap_or(BuildResult::Success);

        let outcome = {
            let mut ctx = self.context();
            step.perform(&mut ctx).await
        };
        let proceed = match outcome {
            Ok(outcome) => {
                self.run.set_result(outcome.result());
                !outcome.is_fatal()
            }
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            Err(e) => {
                warn!(build = %self.run.full_display_name(), step = step.name(), error = %e, "Build step failed");
                self.console.error(step.name(), &e);
                self.run.set_result(BuildResult::Failure);
                true
            }
        };

        let after = self.run.result().unwrap_or(BuildResult::Success);
        if after != before {
            self.console.println(format!(
                "Build step '{}' changed build result to {}",
                step.name(),
                after
            ));
        }
        if !proceed {
            self.console
                .println(format!("Build step '{}' marked build as failure", step.name()));
        }
        Ok(proceed)
    }

    /// Run one pre-build hook. Errors count as a failed hook.
    pub async fn prebuild(&mut self, hook: &dyn PreBuildHook) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        let ok = {
            let mut ctx = self.context();
            hook.prebuild(&mut ctx).await
        };
        match ok {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.console
                    .println(format!("Pre-build check '{}' failed", hook.name()));
                Ok(false)
            }
            Err(Error::Interrupted) => Err(Error::Interrupted),
            Err(e) => {
                self.console.error(hook.name(), &e);
                Ok(false)
            }
        }
    }
}

/// Behaviour that differs between kinds of job.
#[async_trait]
pub trait JobKind: Send + Sync {
    /// Checks of this job, run after the controller-wide ones.
    fn prebuild_hooks(&self) -> Vec<Arc<dyn PreBuildHook>>;

    /// The BUILDING phase. Returns false when the build must skip straight to cleanup.
    async fn build(&self, steps: &mut StepRunner<'_>) -> Result<bool>;

    /// The POST_BUILD phase. Every step runs even if earlier ones failed.
    async fn post(&self, steps: &mut StepRunner<'_>) -> Result<()>;
}

/// Ordered builders followed by publishers.
pub struct Freestyle {
    prebuild: Vec<Arc<dyn PreBuildHook>>,
    builders: Vec<Arc<dyn BuildStep>>,
    publishers: Vec<Arc<dyn BuildStep>>,
}

impl Freestyle {
    pub fn new(
        prebuild: Vec<Arc<dyn PreBuildHook>>,
        builders: Vec<Arc<dyn BuildStep>>,
        publishers: Vec<Arc<dyn BuildStep>>,
    ) -> Self {
        Self {
            prebuild,
            builders,
            publishers,
        }
    }

    pub fn from_def(def: &JobDef) -> Result<Self> {
        Ok(Self {
            prebuild: def.prebuild.iter().map(prebuild_hook).collect::<Result<_>>()?,
            builders: def.builders.iter().map(build_step).collect::<Result<_>>()?,
            publishers: def.publishers.iter().map(build_step).collect::<Result<_>>()?,
        })
    }
}

#[async_trait]
impl JobKind for Freestyle {
    fn prebuild_hooks(&self) -> Vec<Arc<dyn PreBuildHook>> {
        self.prebuild.clone()
    }

    async fn build(&self, steps: &mut StepRunner<'_>) -> Result<bool> {
        for builder in &self.builders {
            if !steps.perform(builder.as_ref()).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn post(&self, steps: &mut StepRunner<'_>) -> Result<()> {
        for publisher in &self.publishers {
            steps.perform(publisher.as_ref()).await?;
        }
        Ok(())
    }
}

/// The job kind a definition describes.
pub fn kind_for(def: &JobDef) -> Result<Arc<dyn JobKind>> {
    Ok(Arc::new(Freestyle::from_def(def)?))
}

/// How a job is carried out: its kind and its source control.
#[derive(Clone)]
pub struct JobBinding {
    pub kind: Arc<dyn JobKind>,
    pub scm: Arc<dyn Scm>,
}

/// Bindings of the jobs known to the controller.
#[derive(Default)]
pub struct JobBindings {
    map: RwLock<HashMap<String, JobBinding>>,
}

impl JobBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, job: impl Into<String>, binding: JobBinding) {
        self.map.write().insert(job.into(), binding);
    }

    pub fn get(&self, job: &str) -> Option<JobBinding> {
        self.map.read().get(job).cloned()
    }

    pub fn require(&self, job: &str) -> Result<JobBinding> {
        self.get(job)
            .ok_or_else(|| Error::NotFound(format!("job '{}' has no binding", job)))
    }

    pub fn remove(&self, job: &str) -> Option<JobBinding> {
        self.map.write().remove(job)
    }
}
