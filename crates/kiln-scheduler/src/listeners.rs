//! Callbacks that observe or extend builds.
//!
//! Each kind of callback is kept in an ordered list owned by the controller
//! and invoked in registration order.

use async_trait::async_trait;
use kiln_core::console::Console;
use kiln_core::env::EnvVars;
use kiln_core::node::Node;
use kiln_core::run::Run;
use kiln_core::step::PreBuildHook;
use kiln_core::Result;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Notified when builds start and finish.
#[async_trait]
pub trait RunListener: Send + Sync {
    async fn on_started(&self, _run: &Run, _console: &Console) {}

    /// Called after the run record has been persisted.
    async fn on_completed(&self, _run: &Run, _console: &Console) {}
}

/// Adds variables to the build environment.
///
/// Characteristic variables (`BUILD_NUMBER`, `JOB_NAME`, ...) set here are
/// overwritten by the build.
pub trait EnvironmentContributor: Send + Sync {
    fn contribute(&self, run: &Run, node: &Node, env: &mut EnvVars);
}

/// Notified before a build starts using a workspace.
#[async_trait]
pub trait WorkspaceListener: Send + Sync {
    /// An error fails the build before checkout.
    async fn before_use(&self, run: &Run, workspace: &Path, console: &Console) -> Result<()>;
}

/// Decides what to build after a run finishes.
#[async_trait]
pub trait DownstreamTrigger: Send + Sync {
    async fn on_finished(&self, run: &Run, console: &Console);
}

/// All registered callbacks.
#[derive(Default)]
pub struct Listeners {
    run: RwLock<Vec<Arc<dyn RunListener>>>,
    env: RwLock<Vec<Arc<dyn EnvironmentContributor>>>,
    prebuild: RwLock<Vec<Arc<dyn PreBuildHook>>>,
    workspace: RwLock<Vec<Arc<dyn WorkspaceListener>>>,
    triggers: RwLock<Vec<Arc<dyn DownstreamTrigger>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_run_listener(&self, l: Arc<dyn RunListener>) {
        self.run.write().push(l);
    }

    pub fn add_env_contributor(&self, c: Arc<dyn EnvironmentContributor>) {
        self.env.write().push(c);
    }

    /// Hooks that run for every job, before the job's own.
    pub fn add_prebuild_hook(&self, h: Arc<dyn PreBuildHook>) {
        self.prebuild.write().push(h);
    }

    pub fn add_workspace_listener(&self, l: Arc<dyn WorkspaceListener>) {
        self.workspace.write().push(l);
    }

    pub fn add_trigger(&self, t: Arc<dyn DownstreamTrigger>) {
        self.triggers.write().push(t);
    }

    pub fn run_listeners(&self) -> Vec<Arc<dyn RunListener>> {
        self.run.read().clone()
    }

    pub fn env_contributors(&self) -> Vec<Arc<dyn EnvironmentContributor>> {
        self.env.read().clone()
    }

    pub fn prebuild_hooks(&self) -> Vec<Arc<dyn PreBuildHook>> {
        self.prebuild.read().clone()
    }

    pub fn workspace_listeners(&self) -> Vec<Arc<dyn WorkspaceListener>> {
        self.workspace.read().clone()
    }

    pub fn triggers(&self) -> Vec<Arc<dyn DownstreamTrigger>> {
        self.triggers.read().clone()
    }
}
