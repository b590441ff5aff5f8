//! Build records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::{BuildPtr, BuildResult, QueueId, ResourceId};

/// Lifecycle phase of a build, also used as the state of an executor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AllocatingWorkspace,
    Checkout,
    PreBuild,
    Building,
    PostBuild,
    Cleanup,
    Completed,
}

impl Phase {
    /// Whether a build in this phase is still running.
    pub fn is_active(self) -> bool {
        !matches!(self, Phase::Idle | Phase::Completed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "IDLE",
            Phase::AllocatingWorkspace => "ALLOCATING_WORKSPACE",
            Phase::Checkout => "CHECKOUT",
            Phase::PreBuild => "PRE_BUILD",
            Phase::Building => "BUILDING",
            Phase::PostBuild => "POST_BUILD",
            Phase::Cleanup => "CLEANUP",
            Phase::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// Why a build was scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cause {
    User { id: String },
    Upstream { job: String, number: u32 },
    Timer,
    ScmChange,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::User { id } => write!(f, "Started by user {}", id),
            Cause::Upstream { job, number } => {
                write!(f, "Started by upstream project \"{}\" build number {}", job, number)
            }
            Cause::Timer => f.write_str("Started by timer"),
            Cause::ScmChange => f.write_str("Started by an SCM change"),
        }
    }
}

/// Data attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunAction {
    Causes { causes: Vec<Cause> },
    Parameters { values: BTreeMap<String, String> },
    /// File name → md5 of every artifact fingerprinted by this build.
    Fingerprints { records: BTreeMap<String, String> },
    ScmRevision { revision: String },
}

/// One execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: ResourceId,
    pub job: String,
    pub number: u32,
    pub queue_id: Option<QueueId>,
    /// When the build was scheduled (left the queue).
    pub timestamp: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    result: Option<BuildResult>,
    pub phase: Phase,
    pub built_on: Option<String>,
    pub workspace: Option<PathBuf>,
    /// Key of the persisted change log, once checkout has written one.
    pub changelog: Option<String>,
    pub culprits: BTreeSet<String>,
    pub actions: Vec<RunAction>,
    pub description: Option<String>,
    /// Explicit "keep this build forever" flag.
    pub keep_log: bool,
}

impl Run {
    pub fn new(job: impl Into<String>, number: u32) -> Self {
        Self {
            id: ResourceId::new(),
            job: job.into(),
            number,
            queue_id: None,
            timestamp: Utc::now(),
            start_time: None,
            duration_ms: None,
            result: None,
            phase: Phase::Idle,
            built_on: None,
            workspace: None,
            changelog: None,
            culprits: BTreeSet::new(),
            actions: Vec::new(),
            description: None,
            keep_log: false,
        }
    }

    pub fn ptr(&self) -> BuildPtr {
        BuildPtr::new(self.job.clone(), self.number)
    }

    pub fn result(&self) -> Option<BuildResult> {
        self.result
    }

    /// Sets the result. Once set, the result can only get worse.
    /// Returns true if the stored result changed.
    pub fn set_result(&mut self, result: BuildResult) -> bool {
        let combined = match self.result {
            Some(current) => current.combine(result),
            None => result,
        };
        let changed = self.result != Some(combined);
        self.result = Some(combined);
        changed
    }

    pub fn is_building(&self) -> bool {
        self.phase.is_active()
    }

    /// Finished builds are immutable apart from these two.
    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
    }

    pub fn set_keep_log(&mut self, keep: bool) {
        self.keep_log = keep;
    }

    pub fn causes(&self) -> Vec<Cause> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                RunAction::Causes { causes } => Some(causes.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.actions
            .iter()
            .find_map(|a| match a {
                RunAction::Parameters { values } => Some(values.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn scm_revision(&self) -> Option<&str> {
        self.actions.iter().find_map(|a| match a {
            RunAction::ScmRevision { revision } => Some(revision.as_str()),
            _ => None,
        })
    }

    /// File name → md5 recorded by fingerprint publishers.
    pub fn fingerprints(&self) -> BTreeMap<String, String> {
        self.actions
            .iter()
            .find_map(|a| match a {
                RunAction::Fingerprints { records } => Some(records.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Merge fingerprint records into the (single) fingerprint action.
    pub fn add_fingerprints(&mut self, records: BTreeMap<String, String>) {
        for action in &mut self.actions {
            if let RunAction::Fingerprints { records: existing } = action {
                existing.extend(records);
                return;
            }
        }
        self.actions.push(RunAction::Fingerprints { records });
    }

    pub fn set_scm_revision(&mut self, revision: impl Into<String>) {
        self.actions
            .retain(|a| !matches!(a, RunAction::ScmRevision { .. }));
        self.actions.push(RunAction::ScmRevision {
            revision: revision.into(),
        });
    }

    /// Display name like `app #12`.
    pub fn full_display_name(&self) -> String {
        format!("{} #{}", self.job, self.number)
    }

    /// Tag used in `BUILD_TAG`: `kiln-app-12`.
    pub fn build_tag(&self) -> String {
        format!("kiln-{}-{}", self.job, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_only_gets_worse() {
        let mut run = Run::new("app", 1);
        assert!(run.result().is_none());
        assert!(run.set_result(BuildResult::Unstable));
        assert!(!run.set_result(BuildResult::Success));
        assert_eq!(run.result(), Some(BuildResult::Unstable));
        assert!(run.set_result(BuildResult::Failure));
        assert!(!run.set_result(BuildResult::Unstable));
        assert_eq!(run.result(), Some(BuildResult::Failure));
    }

    #[test]
    fn test_every_sequence_is_monotonic() {
        let all = [
            BuildResult::Success,
            BuildResult::Unstable,
            BuildResult::Failure,
            BuildResult::NotBuilt,
            BuildResult::Aborted,
        ];
        for a in all {
            for b in all {
                let mut run = Run::new("app", 1);
                run.set_result(a);
                run.set_result(b);
                let r = run.result().unwrap();
                assert!(r.is_better_or_equal_to(BuildResult::Aborted));
                assert!(!r.is_worse_than(a.combine(b)));
                assert!(!a.is_worse_than(r));
            }
        }
    }

    #[test]
    fn test_building_follows_phase() {
        let mut run = Run::new("app", 1);
        assert!(!run.is_building());
        run.phase = Phase::Building;
        assert!(run.is_building());
        run.phase = Phase::Completed;
        assert!(!run.is_building());
    }

    #[test]
    fn test_fingerprint_action_merges() {
        let mut run = Run::new("app", 1);
        run.add_fingerprints([("a.jar".to_string(), "aa".to_string())].into());
        run.add_fingerprints([("b.jar".to_string(), "bb".to_string())].into());
        assert_eq!(run.fingerprints().len(), 2);
        assert_eq!(
            run.actions
                .iter()
                .filter(|a| matches!(a, RunAction::Fingerprints { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let mut run = Run::new("app", 4);
        run.set_result(BuildResult::Unstable);
        run.actions.push(RunAction::Causes {
            causes: vec![Cause::Upstream {
                job: "lib".to_string(),
                number: 2,
            }],
        });
        run.set_scm_revision("abc123");
        let json = serde_json::to_string(&run).unwrap();
        let back: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(back.result(), Some(BuildResult::Unstable));
        assert_eq!(back.scm_revision(), Some("abc123"));
        assert_eq!(back.causes().len(), 1);
        assert_eq!(back.build_tag(), "kiln-app-4");
    }
}
