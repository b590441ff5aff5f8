//! Built-in build steps and pre-build hooks.

use async_trait::async_trait;
use chrono::TimeDelta;
use kiln_core::channel::ProcSpec;
use kiln_core::job::StepSpec;
use kiln_core::step::{BuildStep, PreBuildHook, StepContext, StepOutcome};
use kiln_core::{BuildResult, Error, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::process::run_logged;

/// Files modified this many seconds before the build started still count as produced by it.
const MTIME_SLACK_SECS: i64 = 2;

/// Runs a script with `/bin/sh -c` in the workspace.
#[derive(Debug, Clone)]
pub struct ShellStep {
    command: String,
    unstable_return: Option<i32>,
}

impl ShellStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            unstable_return: None,
        }
    }

    /// Exit code that marks the build UNSTABLE instead of FAILURE.
    pub fn with_unstable_return(mut self, code: Option<i32>) -> Self {
        self.unstable_return = code;
        self
    }

    fn result_for(&self, code: Option<i32>) -> BuildResult {
        match code {
            Some(0) => BuildResult::Success,
            Some(c) if self.unstable_return == Some(c) => BuildResult::Unstable,
            _ => BuildResult::Failure,
        }
    }
}

#[async_trait]
impl BuildStep for ShellStep {
    fn name(&self) -> &str {
        "shell"
    }

    async fn perform(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        ctx.console.println(format!("+ {}", self.command));
        let spec = ProcSpec::shell(&self.command, ctx.workspace).with_env(ctx.env.as_map().clone());
        let exit = run_logged(ctx.channel, spec, ctx.console, ctx.cancel).await?;

        let result = self.result_for(exit.code);
        if result != BuildResult::Success {
            match exit.code {
                Some(code) => ctx.console.println(format!("Script exited with code {}", code)),
                None => ctx.console.println("Script was killed by a signal"),
            }
        }
        Ok(StepOutcome::Done(result))
    }
}

#[async_trait]
impl PreBuildHook for ShellStep {
    fn name(&self) -> &str {
        "shell"
    }

    async fn prebuild(&self, ctx: &mut StepContext<'_>) -> Result<bool> {
        Ok(self.perform(ctx).await?.result() == BuildResult::Success)
    }
}

/// Records md5 fingerprints of build outputs.
#[derive(Debug, Clone)]
pub struct FingerprintStep {
    targets: Vec<String>,
}

impl FingerprintStep {
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl BuildStep for FingerprintStep {
    fn name(&self) -> &str {
        "fingerprint"
    }

    async fn perform(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        ctx.console.println("Recording fingerprints");
        let user = ctx.run.ptr();
        let started = ctx.run.start_time.unwrap_or(ctx.run.timestamp);

        let mut records = BTreeMap::new();
        let mut result = BuildResult::Success;
        for target in &self.targets {
            let rel = ctx.env.expand(target);
            let path = ctx.workspace.join(&rel);
            let digest = match ctx.channel.digest(&path).await {
                Ok(d) => d,
                Err(e) => {
                    ctx.console
                        .println(format!("ERROR: unable to fingerprint '{}': {}", rel, e));
                    result = BuildResult::Failure;
                    continue;
                }
            };

            let produced = digest.modified >= started - TimeDelta::seconds(MTIME_SLACK_SECS);
            let producer = produced.then(|| user.clone());
            let file_name = Path::new(&rel)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| rel.clone());
            debug!(file = %rel, md5 = %digest.md5, produced = producer.is_some(), "Fingerprinting");

            ctx.fingerprints
                .record(&digest.md5, &file_name, producer, &user)
                .await?;
            records.insert(rel, digest.md5);
        }

        if !records.is_empty() {
            ctx.run.add_fingerprints(records);
        }
        Ok(StepOutcome::Done(result))
    }
}

/// Refuses to build unless a variable is present in the build environment.
#[derive(Debug, Clone)]
pub struct RequireEnvHook {
    var: String,
}

impl RequireEnvHook {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl PreBuildHook for RequireEnvHook {
    fn name(&self) -> &str {
        "require-env"
    }

    async fn prebuild(&self, ctx: &mut StepContext<'_>) -> Result<bool> {
        if ctx.env.get(&self.var).is_some() {
            return Ok(true);
        }
        ctx.console
            .println(format!("Required variable {} is not set", self.var));
        Ok(false)
    }
}

/// Instantiate a builder or publisher.
pub fn build_step(spec: &StepSpec) -> Result<Arc<dyn BuildStep>> {
    match spec {
        StepSpec::Shell {
            command,
            unstable_return,
        } => Ok(Arc::new(
            ShellStep::new(command.clone()).with_unstable_return(*unstable_return),
        )),
        StepSpec::Fingerprint { targets } => Ok(Arc::new(FingerprintStep::new(targets.clone()))),
        StepSpec::RequireEnv { name } => Err(Error::InvalidInput(format!(
            "require-env '{}' is only valid as a pre-build hook",
            name
        ))),
    }
}

/// Instantiate a pre-build hook.
pub fn prebuild_hook(spec: &StepSpec) -> Result<Arc<dyn PreBuildHook>> {
    match spec {
        StepSpec::Shell {
            command,
            unstable_return,
        } => Ok(Arc::new(
            ShellStep::new(command.clone()).with_unstable_return(*unstable_return),
        )),
        StepSpec::RequireEnv { name } => Ok(Arc::new(RequireEnvHook::new(name.clone()))),
        StepSpec::Fingerprint { .. } => Err(Error::InvalidInput(
            "fingerprint is not a pre-build hook".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalChannel;
    use kiln_core::console::Console;
    use kiln_core::env::EnvVars;
    use kiln_core::fingerprint::{Fingerprint, FingerprintRecorder};
    use kiln_core::run::Run;
    use kiln_core::BuildPtr;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorded {
        calls: Mutex<Vec<(String, Option<BuildPtr>)>>,
    }

    #[async_trait]
    impl FingerprintRecorder for Recorded {
        async fn record(
            &self,
            md5sum: &str,
            file_name: &str,
            producer: Option<BuildPtr>,
            user: &BuildPtr,
        ) -> Result<Fingerprint> {
            self.calls.lock().push((file_name.to_string(), producer.clone()));
            let mut fp = Fingerprint::new(producer, file_name, md5sum);
            fp.add_for(&user.job, user.number)?;
            Ok(fp)
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        channel: LocalChannel,
        console: Console,
        cancel: CancellationToken,
        recorder: Recorded,
        run: Run,
        env: EnvVars,
    }

    impl Harness {
        fn new() -> Self {
            let mut run = Run::new("app", 3);
            run.start_time = Some(chrono::Utc::now());
            let mut env = EnvVars::new();
            env.put("OUT", "dist");
            Self {
                dir: tempfile::tempdir().unwrap(),
                channel: LocalChannel::new("local"),
                console: Console::new(),
                cancel: CancellationToken::new(),
                recorder: Recorded::default(),
                run,
                env,
            }
        }

        fn ctx(&mut self) -> StepContext<'_> {
            StepContext {
                run: &mut self.run,
                env: &self.env,
                workspace: self.dir.path(),
                channel: &self.channel,
                console: &self.console,
                cancel: &self.cancel,
                fingerprints: &self.recorder,
            }
        }
    }

    #[tokio::test]
    async fn test_shell_results() {
        let mut h = Harness::new();
        let ok = ShellStep::new("echo $OUT");
        assert_eq!(
            BuildStep::perform(&ok, &mut h.ctx()).await.unwrap(),
            StepOutcome::Done(BuildResult::Success)
        );
        assert!(h.console.contains("dist"));

        let unstable = ShellStep::new("exit 2").with_unstable_return(Some(2));
        assert_eq!(
            BuildStep::perform(&unstable, &mut h.ctx()).await.unwrap().result(),
            BuildResult::Unstable
        );

        let failing = ShellStep::new("exit 1").with_unstable_return(Some(2));
        assert_eq!(
            BuildStep::perform(&failing, &mut h.ctx()).await.unwrap().result(),
            BuildResult::Failure
        );
        assert!(h.console.contains("Script exited with code 1"));
    }

    #[tokio::test]
    async fn test_fingerprint_marks_fresh_files_as_produced() {
        let mut h = Harness::new();
        std::fs::create_dir(h.dir.path().join("dist")).unwrap();
        std::fs::write(h.dir.path().join("dist/app.tar"), b"payload").unwrap();

        let step = FingerprintStep::new(vec!["${OUT}/app.tar".to_string()]);
        let outcome = step.perform(&mut h.ctx()).await.unwrap();
        assert_eq!(outcome.result(), BuildResult::Success);

        let calls = h.recorder.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "app.tar");
        assert_eq!(calls[0].1, Some(BuildPtr::new("app", 3)));
        assert_eq!(h.run.fingerprints().len(), 1);
        assert!(h.run.fingerprints().contains_key("dist/app.tar"));
    }

    #[tokio::test]
    async fn test_fingerprint_old_file_has_no_producer() {
        let mut h = Harness::new();
        std::fs::write(h.dir.path().join("old.jar"), b"x").unwrap();
        h.run.start_time = Some(chrono::Utc::now() + TimeDelta::hours(1));

        let step = FingerprintStep::new(vec!["old.jar".to_string()]);
        step.perform(&mut h.ctx()).await.unwrap();
        assert_eq!(h.recorder.calls.lock()[0].1, None);
    }

    #[tokio::test]
    async fn test_fingerprint_missing_file_fails() {
        let mut h = Harness::new();
        let step = FingerprintStep::new(vec!["nope.bin".to_string()]);
        let outcome = step.perform(&mut h.ctx()).await.unwrap();
        assert_eq!(outcome.result(), BuildResult::Failure);
        assert!(h.console.contains("unable to fingerprint 'nope.bin'"));
        assert!(h.run.fingerprints().is_empty());
    }

    #[tokio::test]
    async fn test_require_env() {
        let mut h = Harness::new();
        assert!(RequireEnvHook::new("OUT").prebuild(&mut h.ctx()).await.unwrap());
        assert!(!RequireEnvHook::new("TOKEN").prebuild(&mut h.ctx()).await.unwrap());
        assert!(h.console.contains("Required variable TOKEN is not set"));
    }

    #[test]
    fn test_factories_reject_misplaced_steps() {
        assert!(build_step(&StepSpec::RequireEnv { name: "X".to_string() }).is_err());
        assert!(prebuild_hook(&StepSpec::Fingerprint { targets: vec![] }).is_err());
        assert!(build_step(&StepSpec::Fingerprint { targets: vec![] }).is_ok());
    }
}
