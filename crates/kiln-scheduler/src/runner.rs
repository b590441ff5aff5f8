//! Execution of a single build.
//!
//! A build moves through `ALLOCATING_WORKSPACE → CHECKOUT → PRE_BUILD →
//! BUILDING → POST_BUILD → CLEANUP`. Any phase may jump straight to CLEANUP
//! (abort, checkout exhaustion, a fatal step). CLEANUP always runs: it
//! releases the workspace, persists the record and notifies listeners.

use crate::job::{JobKind, StepRunner};
use crate::listeners::Listeners;
use crate::nodes::NodeHandle;
use crate::workspace::{Lease, WorkspaceList};
use chrono::Utc;
use kiln_core::console::Console;
use kiln_core::env::EnvVars;
use kiln_core::fingerprint::FingerprintRecorder;
use kiln_core::job::JobDef;
use kiln_core::run::{Phase, Run};
use kiln_core::step::{CheckoutContext, Scm};
use kiln_core::{BuildPtr, BuildResult, Error, QueueId, Result};
use kiln_storage::BuildHistory;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle notifications published by the runner.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    Started {
        build: BuildPtr,
        node: String,
        executor: usize,
    },
    PhaseChanged {
        build: BuildPtr,
        phase: Phase,
    },
    Completed {
        build: BuildPtr,
        queue_id: Option<QueueId>,
        result: BuildResult,
    },
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Checkout attempts for jobs that do not set their own.
    pub checkout_retry_count: u32,
    /// Pause between checkout attempts.
    pub checkout_retry_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            checkout_retry_count: 0,
            checkout_retry_backoff: Duration::from_secs(10),
        }
    }
}

/// Everything needed to run one build.
pub struct Execution {
    pub run: Run,
    pub job: Arc<JobDef>,
    pub kind: Arc<dyn JobKind>,
    pub scm: Arc<dyn Scm>,
    pub node: Arc<NodeHandle>,
    pub executor: usize,
    /// Cancelling aborts the build.
    pub cancel: CancellationToken,
}

struct Build {
    run: Run,
    job: Arc<JobDef>,
    kind: Arc<dyn JobKind>,
    scm: Arc<dyn Scm>,
    node: Arc<NodeHandle>,
    executor: usize,
    cancel: CancellationToken,
    console: Console,
    env: EnvVars,
    lease: Option<Lease>,
    workspace: PathBuf,
}

impl Build {
    fn steps<'s>(&'s mut self, fingerprints: &'s dyn FingerprintRecorder) -> StepRunner<'s> {
        StepRunner {
            run: &mut self.run,
            env: &self.env,
            workspace: &self.workspace,
            channel: self.node.channel.as_ref(),
            console: &self.console,
            cancel: &self.cancel,
            fingerprints,
        }
    }

    fn name(&self) -> String {
        self.run.full_display_name()
    }

    /// Variables that identify this build and override every other source.
    fn characteristic_vars(&self) -> BTreeMap<String, String> {
        let number = self.run.number.to_string();
        let mut vars = BTreeMap::new();
        vars.insert("BUILD_NUMBER".to_string(), number.clone());
        vars.insert("BUILD_ID".to_string(), number);
        vars.insert("BUILD_TAG".to_string(), self.run.build_tag());
        vars.insert("JOB_NAME".to_string(), self.run.job.clone());
        vars.insert("NODE_NAME".to_string(), self.node.name().to_string());
        vars.insert("EXECUTOR_NUMBER".to_string(), self.executor.to_string());
        if let Some(lease) = &self.lease {
            vars.insert("WORKSPACE".to_string(), lease.path.display().to_string());
        }
        vars
    }
}

/// Drives builds through their lifecycle.
pub struct BuildRunner {
    history: Arc<BuildHistory>,
    workspaces: WorkspaceList,
    listeners: Arc<Listeners>,
    config: RunnerConfig,
    events: broadcast::Sender<BuildEvent>,
}

impl BuildRunner {
    pub fn new(
        history: Arc<BuildHistory>,
        workspaces: WorkspaceList,
        listeners: Arc<Listeners>,
        config: RunnerConfig,
        events: broadcast::Sender<BuildEvent>,
    ) -> Self {
        Self {
            history,
            workspaces,
            listeners,
            config,
            events,
        }
    }

    pub fn history(&self) -> &Arc<BuildHistory> {
        &self.history
    }

    pub fn workspaces(&self) -> &WorkspaceList {
        &self.workspaces
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BuildEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run a build to completion and return its final record.
    pub async fn execute(&self, exec: Execution) -> Run {
        let mut b = Build {
            run: exec.run,
            job: exec.job,
            kind: exec.kind,
            scm: exec.scm,
            node: exec.node,
            executor: exec.executor,
            cancel: exec.cancel,
            console: Console::new(),
            env: EnvVars::new(),
            lease: None,
            workspace: PathBuf::new(),
        };
        b.run.built_on = Some(b.node.name().to_string());
        b.run.start_time = Some(Utc::now());
        for cause in b.run.causes() {
            b.console.println(cause);
        }

        info!(build = %b.name(), node = %b.node.name(), executor = b.executor, "Build started");
        self.emit(BuildEvent::Started {
            build: b.run.ptr(),
            node: b.node.name().to_string(),
            executor: b.executor,
        });
        for listener in self.listeners.run_listeners() {
            listener.on_started(&b.run, &b.console).await;
        }

        match self.drive(&mut b).await {
            Ok(()) => {}
            Err(Error::Interrupted) => {
                b.run.set_result(BuildResult::Aborted);
                b.console.println("Build was aborted");
                info!(build = %b.name(), phase = %b.run.phase, "Build aborted");
            }
            Err(Error::RunnerAborted(reason)) => {
                b.run.set_result(BuildResult::Failure);
                b.console.println(format!("ERROR: {}", reason));
                warn!(build = %b.name(), reason = %reason, "Build aborted by runner");
            }
            Err(e) => {
                b.run.set_result(BuildResult::Failure);
                b.console.println(format!("FATAL: {}", e));
                error!(build = %b.name(), phase = %b.run.phase, error = %e, "Build failed");
            }
        }
        if b.run.result().is_none() {
            b.run.set_result(BuildResult::Success);
        }

        self.cleanup(b).await
    }

    fn enter(&self, b: &mut Build, phase: Phase) {
        b.run.phase = phase;
        b.console.marker(phase);
        debug!(build = %b.name(), phase = %phase, "Phase changed");
        self.history.runs().update(&b.run);
        self.emit(BuildEvent::PhaseChanged {
            build: b.run.ptr(),
            phase,
        });
    }

    async fn drive(&self, b: &mut Build) -> Result<()> {
        let fingerprints = self.history.fingerprints().clone();

        self.enter(b, Phase::AllocatingWorkspace);
        let lease = {
            let env = self.environment(b);
            self.decide_workspace(b, &env).await?
        };
        b.console.println(format!(
            "Building on {} in workspace {}",
            b.node.name(),
            lease.path.display()
        ));
        b.workspace = lease.path.clone();
        b.run.workspace = Some(lease.path.clone());
        b.lease = Some(lease);
        b.env = self.environment(b);

        b.node.channel.mkdirs(&b.workspace).await?;
        for listener in self.listeners.workspace_listeners() {
            listener.before_use(&b.run, &b.workspace, &b.console).await?;
        }

        self.enter(b, Phase::Checkout);
        self.checkout(b).await?;

        self.enter(b, Phase::PreBuild);
        if self.prebuild(b, &*fingerprints).await? {
            self.enter(b, Phase::Building);
            let kind = b.kind.clone();
            if !kind.build(&mut b.steps(&*fingerprints)).await? {
                return Ok(());
            }
        } else {
            b.run.set_result(BuildResult::Failure);
            b.console.println("Pre-build checks failed; skipping build steps");
        }

        if !b.node.is_online() {
            b.console
                .println(format!("{} is offline; post-build steps may fail", b.node.name()));
            warn!(build = %b.name(), node = %b.node.name(), "Node went offline during build");
        }

        self.enter(b, Phase::PostBuild);
        let kind = b.kind.clone();
        kind.post(&mut b.steps(&*fingerprints)).await
    }

    /// Assemble the build environment.
    ///
    /// Sources in increasing precedence: node, job, build parameters, SCM,
    /// contributors. Characteristic variables are applied last, both before
    /// and after references are resolved.
    fn environment(&self, b: &Build) -> EnvVars {
        let mut env = EnvVars::new();
        env.override_all(b.node.node.env.iter());
        env.override_all(b.job.env.iter());
        let parameters = b.run.parameters();
        env.override_all(parameters.iter());
        b.scm.build_env(&mut env);
        for contributor in self.listeners.env_contributors() {
            contributor.contribute(&b.run, &b.node.node, &mut env);
        }

        let characteristic = b.characteristic_vars();
        if b.lease.is_none() {
            env.remove("WORKSPACE");
        }
        env.override_all(characteristic.iter());
        env.resolve();
        env.override_all(characteristic.iter());
        env
    }

    async fn decide_workspace(&self, b: &Build, env: &EnvVars) -> Result<Lease> {
        let node = b.node.name();
        if let Some(template) = &b.job.custom_workspace {
            let path = b.node.node.workspace_root.join(env.expand(template));
            debug!(build = %b.name(), path = %path.display(), "Using custom workspace");
            return Ok(self.workspaces.allocate_shared(node, &path));
        }

        let base = b.node.node.workspace_for(&b.job.name);
        let owner = b.name();
        if b.job.concurrent {
            return Ok(self.workspaces.allocate_any(node, &base, &owner));
        }
        tokio::select! {
            lease = self.workspaces.allocate(node, &base, &owner) => lease,
            _ = b.cancel.cancelled() => Err(Error::Interrupted),
        }
    }

    async fn checkout(&self, b: &mut Build) -> Result<()> {
        let attempts = b
            .job
            .scm_checkout_retry_count
            .unwrap_or(self.config.checkout_retry_count)
            .max(1);
        let backoff = self.config.checkout_retry_backoff;
        let previous = self
            .history
            .runs()
            .previous_build(&b.run.job, b.run.number)
            .and_then(|r| r.scm_revision().map(str::to_string));

        for attempt in 1..=attempts {
            let outcome = {
                let ctx = CheckoutContext {
                    run: &b.run,
                    previous_revision: previous.as_deref(),
                    workspace: &b.workspace,
                    env: &b.env,
                    channel: b.node.channel.as_ref(),
                    console: &b.console,
                    cancel: &b.cancel,
                };
                b.scm.checkout(&ctx).await
            };

            match outcome {
                Ok(checkout) => {
                    if let Some(revision) = checkout.revision {
                        b.run.set_scm_revision(revision);
                    }
                    let key = self
                        .history
                        .runs()
                        .save_changelog(&b.run, &checkout.changes)
                        .await?;
                    b.run.changelog = Some(key);
                    self.history.changesets().put(b.run.ptr(), checkout.changes);
                    return Ok(());
                }
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(e) => {
                    b.console.error(b.scm.name(), &e);
                    warn!(build = %b.name(), attempt, attempts, error = %e, "Checkout failed");
                    if attempt < attempts {
                        b.console
                            .println(format!("Retrying after {} seconds", backoff.as_secs()));
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = b.cancel.cancelled() => return Err(Error::Interrupted),
                        }
                    }
                }
            }
        }

        Err(Error::RunnerAborted(format!(
            "checkout failed after {} attempt(s)",
            attempts
        )))
    }

    /// Controller-wide hooks first, then the job's own. Stops at the first failure.
    async fn prebuild(&self, b: &mut Build, fingerprints: &dyn FingerprintRecorder) -> Result<bool> {
        let hooks: Vec<_> = self
            .listeners
            .prebuild_hooks()
            .into_iter()
            .chain(b.kind.prebuild_hooks())
            .collect();
        let mut steps = b.steps(fingerprints);
        for hook in hooks {
            if !steps.prebuild(hook.as_ref()).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn cleanup(&self, mut b: Build) -> Run {
        self.enter(&mut b, Phase::Cleanup);
        if let Some(lease) = b.lease.take() {
            lease.release();
        }
        b.env = EnvVars::new();

        if let Some(start) = b.run.start_time {
            let elapsed = (Utc::now() - start).num_milliseconds();
            b.run.duration_ms = Some(u64::try_from(elapsed).unwrap_or(0));
        }
        // Culprits look at whether the build is still running, so compute
        // them before leaving CLEANUP.
        match self.history.culprits(&b.run).await {
            Ok(culprits) => b.run.culprits = culprits,
            Err(e) => warn!(build = %b.name(), error = %e, "Failed to compute culprits"),
        }

        let result = b.run.result().unwrap_or(BuildResult::Success);
        b.run.phase = Phase::Completed;
        b.console.println(format!("Finished: {}", result));

        let runs = self.history.runs();
        if let Err(e) = runs.save(&b.run).await {
            error!(build = %b.name(), error = %e, "Failed to persist build record");
        }
        if let Err(e) = runs.update_pointers(&b.run).await {
            warn!(build = %b.name(), error = %e, "Failed to update build pointers");
        }
        info!(
            build = %b.name(),
            result = %result,
            duration_ms = b.run.duration_ms.unwrap_or(0),
            "Build completed"
        );

        for listener in self.listeners.run_listeners() {
            listener.on_completed(&b.run, &b.console).await;
        }
        for trigger in self.listeners.triggers() {
            trigger.on_finished(&b.run, &b.console).await;
        }

        if let Some(policy) = &b.job.discard {
            if let Err(e) = self
                .history
                .discard_old_builds(&b.job.name, policy, Utc::now())
                .await
            {
                warn!(job = %b.job.name, error = %e, "Failed to discard old builds");
            }
        }

        if let Err(e) = runs.save_log(&b.run, &b.console.text()).await {
            warn!(build = %b.name(), error = %e, "Failed to persist console log");
        }
        self.emit(BuildEvent::Completed {
            build: b.run.ptr(),
            queue_id: b.run.queue_id,
            result,
        });
        b.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::{Script, ScriptedStep};
    use crate::job::Freestyle;
    use crate::listeners::{DownstreamTrigger, EnvironmentContributor, RunListener};
    use async_trait::async_trait;
    use kiln_core::changelog::{ChangeEntry, ChangeLogSet};
    use kiln_core::job::{DiscardPolicy, JobRegistry};
    use kiln_core::node::Node;
    use kiln_core::step::{BuildStep, Checkout, NullScm, PreBuildHook, StepContext, StepOutcome};
    use kiln_executor::LocalChannel;
    use kiln_storage::{ChangeSetCache, FingerprintStore, MemoryPersistence, RunStore};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        runner: Arc<BuildRunner>,
        history: Arc<BuildHistory>,
        listeners: Arc<Listeners>,
        node: Arc<NodeHandle>,
        _dir: TempDir,
    }

    impl Fixture {
        fn new(retry: u32) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let persistence = Arc::new(MemoryPersistence::new());
            let history = Arc::new(BuildHistory::new(
                Arc::new(RunStore::new(persistence.clone())),
                Arc::new(FingerprintStore::new(persistence.clone())),
                Arc::new(ChangeSetCache::new(persistence, 16)),
                Arc::new(JobRegistry::new()),
                false,
            ));
            let listeners = Arc::new(Listeners::new());
            let (events, _) = broadcast::channel(64);
            let runner = Arc::new(BuildRunner::new(
                history.clone(),
                WorkspaceList::new(),
                listeners.clone(),
                RunnerConfig {
                    checkout_retry_count: retry,
                    checkout_retry_backoff: Duration::from_secs(10),
                },
                events,
            ));
            let node = Arc::new(NodeHandle {
                node: Node::new("local", dir.path()),
                channel: Arc::new(LocalChannel::new("local")),
                stopped: CancellationToken::new(),
            });
            Self {
                runner,
                history,
                listeners,
                node,
                _dir: dir,
            }
        }

        async fn execution(&self, job: JobDef, kind: Arc<dyn JobKind>, scm: Arc<dyn Scm>) -> Execution {
            let number = self.history.runs().next_build_number(&job.name).await.unwrap();
            Execution {
                run: Run::new(job.name.clone(), number),
                job: Arc::new(job),
                kind,
                scm,
                node: self.node.clone(),
                executor: 0,
                cancel: CancellationToken::new(),
            }
        }

        async fn run(&self, job: JobDef, kind: Arc<dyn JobKind>, scm: Arc<dyn Scm>) -> Run {
            let exec = self.execution(job, kind, scm).await;
            self.runner.execute(exec).await
        }
    }

    fn freestyle(
        prebuild: Vec<Arc<dyn PreBuildHook>>,
        builders: &[&Arc<ScriptedStep>],
        publishers: &[&Arc<ScriptedStep>],
    ) -> Arc<dyn JobKind> {
        let list = |s: &[&Arc<ScriptedStep>]| -> Vec<Arc<dyn BuildStep>> {
            s.iter().map(|s| (*s).clone() as Arc<dyn BuildStep>).collect()
        };
        Arc::new(Freestyle::new(prebuild, list(builders), list(publishers)))
    }

    /// Fails the first `failures` checkouts.
    struct FlakyScm {
        failures: usize,
        calls: AtomicUsize,
        author: Option<&'static str>,
    }

    impl FlakyScm {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                author: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Scm for FlakyScm {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn checkout(&self, _ctx: &CheckoutContext<'_>) -> Result<Checkout> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Error::ExecutionFailed("remote hung up".to_string()));
            }
            let changes = ChangeLogSet {
                entries: self
                    .author
                    .map(|a| ChangeEntry {
                        commit_id: "c0ffee".to_string(),
                        author: a.to_string(),
                        message: "fix".to_string(),
                        affected_paths: vec![],
                    })
                    .into_iter()
                    .collect(),
            };
            Ok(Checkout {
                revision: Some("c0ffee".to_string()),
                changes,
            })
        }
    }

    struct EnvCapture(Mutex<Option<EnvVars>>);

    #[async_trait]
    impl BuildStep for EnvCapture {
        fn name(&self) -> &str {
            "capture"
        }

        async fn perform(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
            *self.0.lock() = Some(ctx.env.clone());
            Ok(StepOutcome::Done(BuildResult::Success))
        }
    }

    struct Refuse;

    #[async_trait]
    impl PreBuildHook for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        async fn prebuild(&self, _ctx: &mut StepContext<'_>) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_successful_build() {
        let fx = Fixture::new(0);
        let compile = ScriptedStep::new("compile", Script::Result(BuildResult::Success));
        let run = fx
            .run(JobDef::new("app"), freestyle(vec![], &[&compile], &[]), Arc::new(NullScm))
            .await;

        assert_eq!(run.result(), Some(BuildResult::Success));
        assert_eq!(run.phase, Phase::Completed);
        assert_eq!(run.built_on.as_deref(), Some("local"));
        assert_eq!(run.workspace, Some(fx.node.node.workspace_for("app")));
        assert!(run.duration_ms.is_some());
        assert!(fx.runner.workspaces().in_use("local").is_empty());

        let runs = fx.history.runs();
        assert_eq!(runs.get("app", 1).unwrap().result(), Some(BuildResult::Success));
        assert_eq!(runs.last_successful("app"), Some(1));
        assert_eq!(runs.last_stable("app"), Some(1));
        let log = runs.load_log("app", 1).await.unwrap().unwrap();
        assert!(log.contains("Finished: SUCCESS"));
        assert!(log.contains("BUILDING"));

        // An empty checkout still leaves a change log behind.
        let key = run.changelog.clone().unwrap();
        let data = runs.persistence().read(&key).await.unwrap().unwrap();
        let changes: ChangeLogSet = serde_json::from_slice(&data).unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_characteristic_vars_win() {
        struct Wrapper;
        impl EnvironmentContributor for Wrapper {
            fn contribute(&self, _run: &Run, _node: &Node, env: &mut EnvVars) {
                env.put("BUILD_NUMBER", "FROM_WRAPPER");
                env.put("WORKSPACE", "/elsewhere");
                env.put("ARTIFACT", "app-${BUILD_NUMBER}.tar");
            }
        }

        let fx = Fixture::new(0);
        fx.listeners.add_env_contributor(Arc::new(Wrapper));
        let capture = Arc::new(EnvCapture(Mutex::new(None)));
        let kind = Arc::new(Freestyle::new(vec![], vec![capture.clone() as Arc<dyn BuildStep>], vec![]));

        let mut job = JobDef::new("app");
        job.env.insert("JOB_NAME".to_string(), "spoofed".to_string());
        job.env.insert("LANG".to_string(), "C".to_string());
        let run = fx.run(job, kind, Arc::new(NullScm)).await;
        assert_eq!(run.result(), Some(BuildResult::Success));

        let env = capture.0.lock().clone().unwrap();
        assert_eq!(env.get("BUILD_NUMBER"), Some("1"));
        assert_eq!(env.get("JOB_NAME"), Some("app"));
        assert_eq!(env.get("BUILD_TAG"), Some("kiln-app-1"));
        assert_eq!(env.get("NODE_NAME"), Some("local"));
        assert_eq!(env.get("EXECUTOR_NUMBER"), Some("0"));
        assert_eq!(env.get("ARTIFACT"), Some("app-1.tar"));
        assert_eq!(env.get("LANG"), Some("C"));
        let ws = fx.node.node.workspace_for("app");
        assert_eq!(env.get("WORKSPACE"), Some(ws.display().to_string().as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_retry_succeeds() {
        let fx = Fixture::new(3);
        let scm = FlakyScm::new(2);
        let compile = ScriptedStep::new("compile", Script::Result(BuildResult::Success));
        let run = fx
            .run(JobDef::new("app"), freestyle(vec![], &[&compile], &[]), scm.clone())
            .await;

        assert_eq!(scm.calls(), 3);
        assert_eq!(run.result(), Some(BuildResult::Success));
        assert_eq!(run.scm_revision(), Some("c0ffee"));
        let log = fx.history.runs().load_log("app", 1).await.unwrap().unwrap();
        assert_eq!(log.matches("Retrying after 10 seconds").count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_exhaustion_fails_build() {
        let fx = Fixture::new(0);
        let scm = FlakyScm::new(usize::MAX);
        let compile = ScriptedStep::new("compile", Script::Result(BuildResult::Success));
        let publish = ScriptedStep::new("publish", Script::Result(BuildResult::Success));

        let mut job = JobDef::new("app");
        job.scm_checkout_retry_count = Some(2);
        let run = fx
            .run(job, freestyle(vec![], &[&compile], &[&publish]), scm.clone())
            .await;

        assert_eq!(scm.calls(), 2);
        assert_eq!(run.result(), Some(BuildResult::Failure));
        assert_eq!(compile.calls(), 0);
        assert_eq!(publish.calls(), 0);
        assert!(fx.runner.workspaces().in_use("local").is_empty());
        let log = fx.history.runs().load_log("app", 1).await.unwrap().unwrap();
        assert!(log.contains("checkout failed after 2 attempt(s)"));
    }

    #[tokio::test]
    async fn test_zero_retries_still_checks_out_once() {
        let fx = Fixture::new(0);
        let scm = FlakyScm::new(1);
        let run = fx
            .run(JobDef::new("app"), freestyle(vec![], &[], &[]), scm.clone())
            .await;
        assert_eq!(scm.calls(), 1);
        assert_eq!(run.result(), Some(BuildResult::Failure));
    }

    #[tokio::test]
    async fn test_prebuild_failure_skips_to_post_build() {
        let fx = Fixture::new(0);
        let compile = ScriptedStep::new("compile", Script::Result(BuildResult::Success));
        let publish = ScriptedStep::new("publish", Script::Result(BuildResult::Success));
        let run = fx
            .run(
                JobDef::new("app"),
                freestyle(vec![Arc::new(Refuse)], &[&compile], &[&publish]),
                Arc::new(NullScm),
            )
            .await;

        assert_eq!(run.result(), Some(BuildResult::Failure));
        assert_eq!(compile.calls(), 0);
        assert_eq!(publish.calls(), 1);
    }

    #[tokio::test]
    async fn test_fatal_step_skips_post_build() {
        let fx = Fixture::new(0);
        let compile = ScriptedStep::new("compile", Script::Fatal(BuildResult::Failure));
        let publish = ScriptedStep::new("publish", Script::Result(BuildResult::Success));
        let run = fx
            .run(
                JobDef::new("app"),
                freestyle(vec![], &[&compile], &[&publish]),
                Arc::new(NullScm),
            )
            .await;

        assert_eq!(run.result(), Some(BuildResult::Failure));
        assert_eq!(publish.calls(), 0);
        assert_eq!(fx.history.runs().last_successful("app"), None);
    }

    #[tokio::test]
    async fn test_aborted_build_still_cleans_up() {
        let fx = Fixture::new(0);
        let compile = ScriptedStep::new("compile", Script::Result(BuildResult::Success));
        let exec = fx
            .execution(JobDef::new("app"), freestyle(vec![], &[&compile], &[]), Arc::new(NullScm))
            .await;
        exec.cancel.cancel();
        let run = fx.runner.execute(exec).await;

        assert_eq!(run.result(), Some(BuildResult::Aborted));
        assert_eq!(compile.calls(), 0);
        assert!(fx.runner.workspaces().in_use("local").is_empty());
        assert_eq!(
            fx.history.runs().get("app", 1).unwrap().result(),
            Some(BuildResult::Aborted)
        );
    }

    #[tokio::test]
    async fn test_waits_for_busy_workspace() {
        let fx = Fixture::new(0);
        let path = fx.node.node.workspace_for("app");
        let held = fx
            .runner
            .workspaces()
            .try_allocate("local", &path, "someone else")
            .unwrap();

        let exec = fx
            .execution(JobDef::new("app"), freestyle(vec![], &[], &[]), Arc::new(NullScm))
            .await;
        let runner = fx.runner.clone();
        let build = tokio::spawn(async move { runner.execute(exec).await });

        while fx.runner.workspaces().waiting("local", &path) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!build.is_finished());

        held.release();
        let run = build.await.unwrap();
        assert_eq!(run.result(), Some(BuildResult::Success));
    }

    #[tokio::test]
    async fn test_custom_workspace_is_expanded_and_shared() {
        let fx = Fixture::new(0);
        let mut job = JobDef::new("app");
        job.custom_workspace = Some("shared/${JOB_NAME}".to_string());

        let path = fx.node.node.workspace_root.join("shared/app");
        let _other = fx.runner.workspaces().try_allocate("local", &path, "other").unwrap();

        let run = fx.run(job, freestyle(vec![], &[], &[]), Arc::new(NullScm)).await;
        assert_eq!(run.result(), Some(BuildResult::Success));
        assert_eq!(run.workspace, Some(path));
    }

    #[tokio::test]
    async fn test_culprits_and_listeners() {
        struct Seen(Mutex<Vec<String>>);

        #[async_trait]
        impl RunListener for Seen {
            async fn on_completed(&self, run: &Run, _console: &Console) {
                self.0.lock().push(format!("completed {} {:?}", run.number, run.result()));
            }
        }

        #[async_trait]
        impl DownstreamTrigger for Seen {
            async fn on_finished(&self, run: &Run, _console: &Console) {
                self.0.lock().push(format!("trigger {}", run.number));
            }
        }

        let fx = Fixture::new(0);
        let seen = Arc::new(Seen(Mutex::new(Vec::new())));
        fx.listeners.add_run_listener(seen.clone());
        fx.listeners.add_trigger(seen.clone());

        let scm = Arc::new(FlakyScm {
            failures: 0,
            calls: AtomicUsize::new(0),
            author: Some("alice"),
        });
        let tests = ScriptedStep::new("tests", Script::Result(BuildResult::Unstable));
        let run = fx
            .run(JobDef::new("app"), freestyle(vec![], &[&tests], &[]), scm)
            .await;

        assert_eq!(run.result(), Some(BuildResult::Unstable));
        assert!(run.culprits.contains("alice"));
        assert!(run.changelog.is_some());
        assert_eq!(
            *seen.0.lock(),
            vec!["completed 1 Some(Unstable)".to_string(), "trigger 1".to_string()]
        );
        let runs = fx.history.runs();
        assert_eq!(runs.last_successful("app"), Some(1));
        assert_eq!(runs.last_stable("app"), None);
    }

    #[tokio::test]
    async fn test_discarder_runs_after_build() {
        let fx = Fixture::new(0);
        let mut job = JobDef::new("app");
        job.discard = Some(DiscardPolicy {
            num_to_keep: Some(1),
            days_to_keep: None,
        });
        let fail = ScriptedStep::new("compile", Script::Result(BuildResult::Failure));
        for _ in 0..3 {
            fx.run(job.clone(), freestyle(vec![], &[&fail], &[]), Arc::new(NullScm))
                .await;
        }
        assert_eq!(fx.history.runs().numbers("app"), vec![3]);
    }
}
