//! The controller: owns the queue, nodes, executors and build history.

use crate::executor::{ActiveBuilds, Executor};
use crate::job::{JobBinding, JobBindings, kind_for};
use crate::listeners::{DownstreamTrigger, Listeners};
use crate::nodes::NodeRegistry;
use crate::queue::{Queue, QueueItemHandle, Task};
use crate::runner::{BuildEvent, BuildRunner, RunnerConfig};
use crate::workspace::WorkspaceList;
use async_trait::async_trait;
use kiln_config::SystemConfig;
use kiln_core::channel::RemoteChannel;
use kiln_core::console::Console;
use kiln_core::job::{JobDef, JobRegistry};
use kiln_core::node::Node;
use kiln_core::persistence::Persistence;
use kiln_core::run::{Cause, Run};
use kiln_core::{BuildPtr, BuildResult, Error, QueueId, Result};
use kiln_executor::{LocalChannel, scm_for};
use kiln_storage::{BuildHistory, ChangeSetCache, FingerprintStore, FsPersistence, RunStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Queues builds of a job's downstream projects when a build succeeds.
struct SubmitDownstream {
    jobs: Arc<JobRegistry>,
    queue: Arc<Queue>,
}

#[async_trait]
impl DownstreamTrigger for SubmitDownstream {
    async fn on_finished(&self, run: &Run, console: &Console) {
        if run.result() != Some(BuildResult::Success) {
            return;
        }
        for project in self.jobs.downstream_projects(&run.job) {
            let task = Task::new(project.name.clone()).with_cause(Cause::Upstream {
                job: run.job.clone(),
                number: run.number,
            });
            match self.queue.submit(task) {
                Ok(_) => console.println(format!("Triggering a new build of {}", project.name)),
                Err(Error::DuplicateTask(reason)) => {
                    debug!(job = %project.name, reason = %reason, "Downstream build already queued");
                }
                Err(e) => {
                    warn!(upstream = %run.full_display_name(), job = %project.name, error = %e, "Failed to trigger downstream build");
                }
            }
        }
    }
}

pub struct Controller {
    config: SystemConfig,
    jobs: Arc<JobRegistry>,
    bindings: Arc<JobBindings>,
    nodes: Arc<NodeRegistry>,
    queue: Arc<Queue>,
    runner: Arc<BuildRunner>,
    listeners: Arc<Listeners>,
    active: Arc<ActiveBuilds>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(config: SystemConfig, persistence: Arc<dyn Persistence>) -> Arc<Self> {
        let jobs = Arc::new(JobRegistry::new());
        let nodes = Arc::new(NodeRegistry::new());
        let queue = Arc::new(Queue::new(jobs.clone(), nodes.clone(), config.quiet_period));
        let history = Arc::new(BuildHistory::new(
            Arc::new(RunStore::new(persistence.clone())),
            Arc::new(FingerprintStore::new(persistence.clone())),
            Arc::new(ChangeSetCache::new(persistence, config.changeset_cache)),
            jobs.clone(),
            config.upstream_culprits,
        ));

        let listeners = Arc::new(Listeners::new());
        listeners.add_trigger(Arc::new(SubmitDownstream {
            jobs: jobs.clone(),
            queue: queue.clone(),
        }));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let runner = Arc::new(BuildRunner::new(
            history,
            WorkspaceList::new(),
            listeners.clone(),
            RunnerConfig {
                checkout_retry_count: config.scm_checkout_retry_count,
                checkout_retry_backoff: config.checkout_retry_backoff,
            },
            events,
        ));

        Arc::new(Self {
            config,
            jobs,
            bindings: Arc::new(JobBindings::new()),
            nodes,
            queue,
            runner,
            listeners,
            active: Arc::new(ActiveBuilds::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// A controller storing its records under `config.root`.
    pub fn open(config: SystemConfig) -> Arc<Self> {
        let persistence = Arc::new(FsPersistence::new(config.root.clone()));
        Self::new(config, persistence)
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn history(&self) -> &Arc<BuildHistory> {
        self.runner.history()
    }

    pub fn workspaces(&self) -> &WorkspaceList {
        self.runner.workspaces()
    }

    pub fn listeners(&self) -> &Arc<Listeners> {
        &self.listeners
    }

    pub fn active(&self) -> &Arc<ActiveBuilds> {
        &self.active
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.runner.subscribe()
    }

    /// Register a job built from its definition.
    pub async fn add_job(&self, def: JobDef) -> Result<()> {
        let binding = JobBinding {
            kind: kind_for(&def)?,
            scm: scm_for(&def.scm),
        };
        self.add_job_with(def, binding).await
    }

    /// Register a job with an explicit kind and SCM.
    ///
    /// The job's stored build records are loaded first; builds left
    /// unfinished by a previous controller come back as ABORTED.
    pub async fn add_job_with(&self, def: JobDef, binding: JobBinding) -> Result<()> {
        def.label_expr()?;
        self.history().runs().load_job(&def.name).await?;
        info!(job = %def.name, "Job registered");
        self.bindings.put(def.name.clone(), binding);
        self.jobs.put(def);
        self.queue.schedule();
        Ok(())
    }

    pub fn remove_job(&self, name: &str) -> bool {
        self.bindings.remove(name);
        let removed = self.jobs.remove(name).is_some();
        if removed {
            info!(job = %name, "Job removed");
            self.queue.schedule();
        }
        removed
    }

    /// Bring a node online and start one executor task per slot.
    pub fn connect(&self, node: Node, channel: Arc<dyn RemoteChannel>) -> Result<()> {
        let slots = node.num_executors;
        let handle = self.nodes.connect(node, channel, self.shutdown.child_token())?;
        info!(node = %handle.name(), executors = slots, "Node connected");

        let mut tasks = self.tasks.lock();
        for number in 0..slots {
            let executor = Executor {
                node: handle.clone(),
                number,
                queue: self.queue.clone(),
                jobs: self.jobs.clone(),
                bindings: self.bindings.clone(),
                runner: self.runner.clone(),
                active: self.active.clone(),
                shutdown: self.shutdown.child_token(),
            };
            tasks.push(tokio::spawn(executor.run()));
        }
        drop(tasks);

        self.queue.schedule();
        Ok(())
    }

    /// Connect every configured node through a local channel.
    pub fn connect_local_nodes(&self) -> Result<()> {
        for node in self.config.nodes.clone() {
            let channel = Arc::new(LocalChannel::new(node.name.clone()));
            self.connect(node, channel)?;
        }
        Ok(())
    }

    /// Take a node offline. Its executors stop taking work; running builds finish.
    pub fn disconnect(&self, name: &str) -> bool {
        let gone = self.nodes.disconnect(name).is_some();
        if gone {
            info!(node = %name, "Node disconnected");
            self.queue.schedule();
        }
        gone
    }

    pub fn submit(&self, task: Task) -> Result<QueueItemHandle> {
        self.queue.submit(task)
    }

    pub fn cancel(&self, id: QueueId) -> bool {
        self.queue.cancel(id)
    }

    /// Abort a running build. False if it is not running.
    pub fn abort(&self, job: &str, number: u32) -> bool {
        self.active.abort(&BuildPtr::new(job, number))
    }

    /// Start the queue maintenance loop.
    pub fn start(&self) {
        let queue = self.queue.clone();
        let interval = self.config.maintenance_interval;
        let cancel = self.shutdown.child_token();
        self.tasks
            .lock()
            .push(tokio::spawn(queue.run_maintenance(interval, cancel)));
    }

    /// Stop maintenance and every executor, aborting running builds, and
    /// wait for them to finish cleanup.
    pub async fn shutdown(&self) {
        info!("Controller shutting down");
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Controller task panicked");
            }
        }
    }
}

/// Wait until the build started from queue item `id` completes.
pub async fn wait_for_item(
    events: &mut broadcast::Receiver<BuildEvent>,
    id: QueueId,
) -> Result<(BuildPtr, BuildResult)> {
    loop {
        match events.recv().await {
            Ok(BuildEvent::Completed {
                build,
                queue_id: Some(q),
                result,
            }) if q == id => return Ok((build, result)),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Build events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::Internal("build event stream closed".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Freestyle;
    use crate::queue::ItemState;
    use kiln_core::step::{BuildStep, NullScm, StepContext, StepOutcome};
    use kiln_storage::MemoryPersistence;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    /// Blocks until released or the build is aborted.
    struct Gate(Semaphore);

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self(Semaphore::new(0)))
        }

        fn open(&self, builds: usize) {
            self.0.add_permits(builds);
        }
    }

    #[async_trait]
    impl BuildStep for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn perform(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
            tokio::select! {
                permit = self.0.acquire() => {
                    permit
                        .map_err(|e| Error::Internal(e.to_string()))?
                        .forget();
                    Ok(StepOutcome::Done(BuildResult::Success))
                }
                _ = ctx.cancel.cancelled() => Err(Error::Interrupted),
            }
        }
    }

    struct Fixture {
        controller: Arc<Controller>,
        dir: TempDir,
    }

    impl Fixture {
        fn new(executors: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = SystemConfig {
                root: dir.path().to_path_buf(),
                nodes: vec![Node::new("local", dir.path().join("workspace")).with_executors(executors)],
                ..SystemConfig::default()
            };
            let controller = Controller::new(config, Arc::new(MemoryPersistence::new()));
            controller.connect_local_nodes().unwrap();
            controller.start();
            Self { controller, dir }
        }

        async fn add(&self, mut def: JobDef, steps: Vec<Arc<dyn BuildStep>>) {
            def.quiet_period = Some(Duration::ZERO);
            let binding = JobBinding {
                kind: Arc::new(Freestyle::new(vec![], steps, vec![])),
                scm: Arc::new(NullScm),
            };
            self.controller.add_job_with(def, binding).await.unwrap();
        }
    }

    async fn started(events: &mut broadcast::Receiver<BuildEvent>, job: &str) -> BuildPtr {
        loop {
            if let BuildEvent::Started { build, .. } = events.recv().await.unwrap() {
                if build.job == job {
                    return build;
                }
            }
        }
    }

    async fn completed(events: &mut broadcast::Receiver<BuildEvent>, id: QueueId) -> (BuildPtr, BuildResult) {
        timeout(Duration::from_secs(30), wait_for_item(events, id))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_builds_get_contiguous_numbers() {
        let fx = Fixture::new(4);
        let mut def = JobDef::new("app");
        def.concurrent = true;
        fx.add(def, vec![]).await;

        let mut events = fx.controller.subscribe();
        let ids: Vec<_> = (0..8)
            .map(|i| {
                fx.controller
                    .submit(Task::new("app").with_parameter("SHARD", i.to_string()))
                    .unwrap()
                    .id
            })
            .collect();

        // Builds finish in any order; collect every completion before checking.
        let mut done: HashMap<QueueId, (BuildPtr, BuildResult)> = HashMap::new();
        timeout(Duration::from_secs(30), async {
            while ids.iter().any(|id| !done.contains_key(id)) {
                if let BuildEvent::Completed {
                    build,
                    queue_id: Some(id),
                    result,
                } = events.recv().await.unwrap()
                {
                    done.insert(id, (build, result));
                }
            }
        })
        .await
        .unwrap();

        let mut numbers = Vec::new();
        for id in &ids {
            let (build, result) = &done[id];
            assert_eq!(*result, BuildResult::Success);
            numbers.push(build.number);
        }
        numbers.sort();
        assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
        fx.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_cap_blocks_second_build() {
        let fx = Fixture::new(2);
        let gate = Gate::new();
        fx.add(JobDef::new("app"), vec![gate.clone() as Arc<dyn BuildStep>]).await;

        let mut events = fx.controller.subscribe();
        let first = fx
            .controller
            .submit(Task::new("app").with_parameter("N", "1"))
            .unwrap();
        started(&mut events, "app").await;

        let second = fx
            .controller
            .submit(Task::new("app").with_parameter("N", "2"))
            .unwrap();
        fx.controller.queue().maintain();
        let view = fx.controller.queue().item(second.id).unwrap();
        assert!(matches!(view.state, ItemState::Blocked { .. }));
        assert!(view.why().unwrap().contains("already in progress"));

        gate.open(2);
        assert_eq!(completed(&mut events, first.id).await.0.number, 1);
        assert_eq!(completed(&mut events, second.id).await.0.number, 2);
        fx.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_success_triggers_downstream() {
        let fx = Fixture::new(2);
        let mut app = JobDef::new("app");
        app.downstream.push("deploy".to_string());
        fx.add(app, vec![]).await;
        fx.add(JobDef::new("deploy"), vec![]).await;

        let mut events = fx.controller.subscribe();
        let item = fx.controller.submit(Task::new("app")).unwrap();
        completed(&mut events, item.id).await;

        let deploy = timeout(Duration::from_secs(30), async {
            loop {
                if let Ok(BuildEvent::Completed { build, .. }) = events.recv().await {
                    if build.job == "deploy" {
                        return build;
                    }
                }
            }
        })
        .await
        .unwrap();

        let run = fx.controller.history().runs().get("deploy", deploy.number).unwrap();
        assert_eq!(
            run.causes(),
            vec![Cause::Upstream {
                job: "app".to_string(),
                number: 1
            }]
        );
        fx.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_abort_running_build() {
        let fx = Fixture::new(1);
        fx.add(JobDef::new("app"), vec![Gate::new() as Arc<dyn BuildStep>]).await;

        let mut events = fx.controller.subscribe();
        let item = fx.controller.submit(Task::new("app")).unwrap();
        let build = started(&mut events, "app").await;

        while !fx.controller.abort(&build.job, build.number) {
            tokio::task::yield_now().await;
        }
        let (_, result) = completed(&mut events, item.id).await;
        assert_eq!(result, BuildResult::Aborted);
        fx.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnected_node_takes_no_work() {
        let fx = Fixture::new(1);
        fx.add(JobDef::new("app"), vec![]).await;

        assert!(fx.controller.disconnect("local"));
        let item = fx.controller.submit(Task::new("app")).unwrap();
        fx.controller.queue().maintain();
        let view = fx.controller.queue().item(item.id).unwrap();
        assert!(view.stuck);
        assert!(fx.controller.history().runs().numbers("app").is_empty());
        fx.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_uses_filesystem_records() {
        let fx = Fixture::new(0);
        let config = SystemConfig {
            root: fx.dir.path().join("records"),
            nodes: vec![],
            ..SystemConfig::default()
        };
        let controller = Controller::open(config);
        controller.add_job(JobDef::new("app")).await.unwrap();
        assert!(controller.jobs().get("app").is_some());
        assert!(controller.remove_job("app"));
        assert!(!controller.remove_job("app"));
        fx.controller.shutdown().await;
    }
}
