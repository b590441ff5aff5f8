//! Job definitions and the job dependency graph.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::node::LabelExpr;
use crate::{Error, Result};

/// A buildable job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    /// Unique job name.
    pub name: String,
    /// Restricts where the job may run. None means any node.
    #[serde(default)]
    pub label: Option<String>,
    /// Debounce delay before a queued build becomes buildable. None uses the controller default.
    #[serde(default)]
    pub quiet_period: Option<Duration>,
    /// Whether more than one build may run at a time.
    #[serde(default)]
    pub concurrent: bool,
    /// Upper bound on simultaneous builds when `concurrent` is set.
    #[serde(default)]
    pub max_concurrent_builds: Option<usize>,
    /// Source to check out into the workspace.
    #[serde(default)]
    pub scm: ScmSpec,
    /// Checkout attempt budget (at least one attempt is made). None uses the controller default.
    #[serde(default)]
    pub scm_checkout_retry_count: Option<u32>,
    /// Workspace path template, expanded against the build environment.
    /// Custom workspaces may be shared between jobs.
    #[serde(default)]
    pub custom_workspace: Option<String>,
    /// Wait while any upstream job is queued or building.
    #[serde(default)]
    pub block_on_upstream: bool,
    /// Keep upstream build records that builds of this job depend on.
    #[serde(default)]
    pub keep_dependencies: bool,
    #[serde(default)]
    pub discard: Option<DiscardPolicy>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Jobs to evaluate for triggering after a build of this job completes.
    #[serde(default)]
    pub downstream: Vec<String>,
    #[serde(default)]
    pub prebuild: Vec<StepSpec>,
    #[serde(default)]
    pub builders: Vec<StepSpec>,
    #[serde(default)]
    pub publishers: Vec<StepSpec>,
}

impl JobDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            quiet_period: None,
            concurrent: false,
            max_concurrent_builds: None,
            scm: ScmSpec::None,
            scm_checkout_retry_count: None,
            custom_workspace: None,
            block_on_upstream: false,
            keep_dependencies: false,
            discard: None,
            env: BTreeMap::new(),
            downstream: Vec::new(),
            prebuild: Vec::new(),
            builders: Vec::new(),
            publishers: Vec::new(),
        }
    }

    /// Parsed label expression.
    pub fn label_expr(&self) -> Result<Option<LabelExpr>> {
        self.label.as_deref().map(str::parse::<LabelExpr>).transpose()
    }

    /// Maximum number of simultaneous builds. None means unlimited.
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.concurrent {
            self.max_concurrent_builds
        } else {
            Some(1)
        }
    }

    /// Whether a fingerprint publisher is configured.
    pub fn records_fingerprints(&self) -> bool {
        self.publishers
            .iter()
            .any(|s| matches!(s, StepSpec::Fingerprint { .. }))
    }
}

/// Source control configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScmSpec {
    #[default]
    None,
    Git {
        url: String,
        #[serde(default)]
        branch: Option<String>,
    },
}

/// A configured build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    /// Run a shell command in the workspace.
    Shell {
        command: String,
        /// Exit code that marks the build UNSTABLE instead of FAILURE.
        #[serde(default)]
        unstable_return: Option<i32>,
    },
    /// Record fingerprints of workspace files.
    Fingerprint { targets: Vec<String> },
    /// Pre-build check: the named variable must be present in the build environment.
    RequireEnv { name: String },
}

/// Build discarder ("log rotation") policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardPolicy {
    pub num_to_keep: Option<usize>,
    pub days_to_keep: Option<u32>,
}

/// Registered jobs and the upstream/downstream graph between them.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<BTreeMap<String, Arc<JobDef>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a job definition.
    pub fn put(&self, job: JobDef) -> Arc<JobDef> {
        let job = Arc::new(job);
        self.jobs.write().insert(job.name.clone(), job.clone());
        job
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobDef>> {
        self.jobs.read().get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<JobDef>> {
        self.get(name)
            .ok_or_else(|| Error::NotFound(format!("job '{}'", name)))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<JobDef>> {
        self.jobs.write().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }

    /// Jobs listed as downstream of `name` that exist.
    pub fn downstream_projects(&self, name: &str) -> Vec<Arc<JobDef>> {
        let jobs = self.jobs.read();
        let Some(job) = jobs.get(name) else {
            return Vec::new();
        };
        job.downstream
            .iter()
            .filter_map(|d| jobs.get(d).cloned())
            .collect()
    }

    /// Jobs that list `name` as downstream.
    pub fn upstream_projects(&self, name: &str) -> Vec<Arc<JobDef>> {
        self.jobs
            .read()
            .values()
            .filter(|j| j.downstream.iter().any(|d| d == name))
            .cloned()
            .collect()
    }

    /// All jobs upstream of `name`, directly or transitively.
    pub fn transitive_upstream_projects(&self, name: &str) -> Vec<Arc<JobDef>> {
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        let mut pending: VecDeque<String> = VecDeque::from([name.to_string()]);
        while let Some(current) = pending.pop_front() {
            for up in self.upstream_projects(&current) {
                if up.name != name && seen.insert(up.name.clone()) {
                    pending.push_back(up.name.clone());
                    result.push(up);
                }
            }
        }
        result
    }
}
