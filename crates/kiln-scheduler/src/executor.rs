//! Executor slots: one task per slot, taking work from the queue.

use crate::job::JobBindings;
use crate::nodes::NodeHandle;
use crate::queue::{Queue, WorkUnit};
use crate::runner::{BuildRunner, Execution};
use kiln_core::job::JobRegistry;
use kiln_core::run::{Run, RunAction};
use kiln_core::{BuildPtr, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Abort handles of the builds currently running.
#[derive(Default)]
pub struct ActiveBuilds {
    builds: Mutex<HashMap<BuildPtr, CancellationToken>>,
}

impl ActiveBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, build: BuildPtr, cancel: CancellationToken) {
        self.builds.lock().insert(build, cancel);
    }

    fn remove(&self, build: &BuildPtr) {
        self.builds.lock().remove(build);
    }

    /// Ask a running build to stop. False if it is not running here.
    pub fn abort(&self, build: &BuildPtr) -> bool {
        match self.builds.lock().get(build) {
            Some(cancel) => {
                info!(build = %build, "Abort requested");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<BuildPtr> {
        let mut builds: Vec<_> = self.builds.lock().keys().cloned().collect();
        builds.sort();
        builds
    }
}

/// One executor slot of a node.
pub struct Executor {
    pub node: Arc<NodeHandle>,
    pub number: usize,
    pub queue: Arc<Queue>,
    pub jobs: Arc<JobRegistry>,
    pub bindings: Arc<JobBindings>,
    pub runner: Arc<BuildRunner>,
    pub active: Arc<ActiveBuilds>,
    /// Stops the slot and aborts its build.
    pub shutdown: CancellationToken,
}

impl Executor {
    /// Take and run builds until shut down or the node disconnects.
    ///
    /// A disconnect stops the slot from taking new work; a build already
    /// running is left to finish.
    pub async fn run(self) {
        info!(node = %self.node.name(), executor = self.number, "Executor started");

        loop {
            let unit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.node.stopped.cancelled() => break,
                unit = self.queue.offer(self.node.name(), self.number) => unit,
            };
            match unit {
                Ok(unit) => {
                    let job = unit.task.job.clone();
                    if let Err(e) = self.build(unit).await {
                        error!(node = %self.node.name(), executor = self.number, job = %job, error = %e, "Could not start build");
                    }
                    self.queue.on_completed(&job);
                }
                Err(e) => {
                    warn!(node = %self.node.name(), executor = self.number, error = %e, "Queue closed");
                    break;
                }
            }
        }

        info!(node = %self.node.name(), executor = self.number, "Executor stopped");
    }

    async fn build(&self, unit: WorkUnit) -> Result<Run> {
        let job = self.jobs.require(&unit.task.job)?;
        let binding = self.bindings.require(&job.name)?;

        // Numbers are taken here rather than at submission so a cancelled
        // queue item never leaves a gap.
        let number = self.runner.history().runs().next_build_number(&job.name).await?;
        let mut run = Run::new(job.name.clone(), number);
        run.queue_id = Some(unit.id);
        run.actions.push(RunAction::Causes {
            causes: unit.task.causes.clone(),
        });
        if !unit.task.parameters.is_empty() {
            run.actions.push(RunAction::Parameters {
                values: unit.task.parameters.clone(),
            });
        }
        self.queue.mark_started(unit.id, number);

        let ptr = run.ptr();
        let cancel = self.shutdown.child_token();
        self.active.insert(ptr.clone(), cancel.clone());
        let run = self
            .runner
            .execute(Execution {
                run,
                job,
                kind: binding.kind,
                scm: binding.scm,
                node: self.node.clone(),
                executor: self.number,
                cancel,
            })
            .await;
        self.active.remove(&ptr);
        Ok(run)
    }
}
