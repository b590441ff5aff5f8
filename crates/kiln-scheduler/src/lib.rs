//! Build scheduling and execution for Kiln.
//!
//! The [`Controller`] ties the pieces together: the [`Queue`] matches queued
//! tasks to idle executor slots on connected nodes, each slot runs builds
//! through the [`BuildRunner`] lifecycle, and workspaces are leased from the
//! [`WorkspaceList`] for the duration of a build.

pub mod controller;
pub mod executor;
pub mod job;
pub mod listeners;
pub mod nodes;
pub mod queue;
pub mod runner;
pub mod workspace;

pub use controller::{Controller, wait_for_item};
pub use executor::{ActiveBuilds, Executor};
pub use job::{Freestyle, JobBinding, JobBindings, JobKind, StepRunner, kind_for};
pub use listeners::{
    DownstreamTrigger, EnvironmentContributor, Listeners, RunListener, WorkspaceListener,
};
pub use nodes::{NodeHandle, NodeRegistry};
pub use queue::{ItemState, ItemView, LeftItem, LeftOutcome, Queue, QueueItemHandle, Task, WorkUnit};
pub use runner::{BuildEvent, BuildRunner, Execution, RunnerConfig};
pub use workspace::{Lease, WorkspaceList};
