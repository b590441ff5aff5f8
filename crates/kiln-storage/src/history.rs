//! Read-only projections over build records and fingerprints: results,
//! upstream/downstream relationships, dependency changes, culprits and
//! retention.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kiln_core::fingerprint::RangeSet;
use kiln_core::job::{DiscardPolicy, JobRegistry};
use kiln_core::run::Run;
use kiln_core::{BuildResult, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::changeset::ChangeSetCache;
use crate::fingerprint::FingerprintStore;
use crate::runs::RunStore;

/// A dependency that moved forward between two builds of the same job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyChange {
    pub project: String,
    /// Build of `project` used by the older build.
    pub from_id: u32,
    /// Build of `project` used by the newer build.
    pub to_id: u32,
}

/// Query surface used by the runner, the build discarder and reporting layers.
pub struct BuildHistory {
    runs: Arc<RunStore>,
    fingerprints: Arc<FingerprintStore>,
    changesets: Arc<ChangeSetCache>,
    jobs: Arc<JobRegistry>,
    upstream_culprits: bool,
}

impl BuildHistory {
    pub fn new(
        runs: Arc<RunStore>,
        fingerprints: Arc<FingerprintStore>,
        changesets: Arc<ChangeSetCache>,
        jobs: Arc<JobRegistry>,
        upstream_culprits: bool,
    ) -> Self {
        Self {
            runs,
            fingerprints,
            changesets,
            jobs,
            upstream_culprits,
        }
    }

    pub fn runs(&self) -> &Arc<RunStore> {
        &self.runs
    }

    pub fn fingerprints(&self) -> &Arc<FingerprintStore> {
        &self.fingerprints
    }

    pub fn changesets(&self) -> &Arc<ChangeSetCache> {
        &self.changesets
    }

    pub fn upstream_culprits(&self) -> bool {
        self.upstream_culprits
    }

    pub fn result(&self, job: &str, number: u32) -> Option<BuildResult> {
        self.runs.get(job, number).and_then(|r| r.result())
    }

    pub fn is_building(&self, job: &str, number: u32) -> bool {
        self.runs.get(job, number).is_some_and(|r| r.is_building())
    }

    /// Builds of `project` that used artifacts of `run`.
    pub async fn downstream_relationship(&self, run: &Run, project: &str) -> Result<RangeSet> {
        self.fingerprints
            .downstream_relationship(run, project, self.upstream_culprits)
            .await
    }

    /// Existing downstream build records, ascending.
    pub async fn downstream_runs(&self, run: &Run, project: &str) -> Result<Vec<Run>> {
        let rs = self.downstream_relationship(run, project).await?;
        Ok(rs
            .list_numbers()
            .filter_map(|n| self.runs.get(project, n))
            .collect())
    }

    /// For each downstream project that records fingerprints, the builds that used `run`.
    pub async fn downstream_builds(&self, run: &Run) -> Result<BTreeMap<String, RangeSet>> {
        let mut out = BTreeMap::new();
        for project in self.jobs.downstream_projects(&run.job) {
            if project.records_fingerprints() {
                let rs = self.downstream_relationship(run, &project.name).await?;
                out.insert(project.name.clone(), rs);
            }
        }
        Ok(out)
    }

    pub async fn upstream_relationship(&self, run: &Run, project: &str) -> Result<Option<u32>> {
        self.fingerprints
            .upstream_relationship(run, project, self.upstream_culprits)
            .await
    }

    /// The upstream build record itself, if it still exists.
    pub async fn upstream_run(&self, run: &Run, project: &str) -> Result<Option<Run>> {
        Ok(self
            .upstream_relationship(run, project)
            .await?
            .and_then(|n| self.runs.get(project, n)))
    }

    /// Direct upstream projects → build of each that fed `run`.
    pub async fn upstream_builds(&self, run: &Run) -> Result<BTreeMap<String, u32>> {
        let projects = self.jobs.upstream_projects(&run.job);
        self.upstream_builds_of(run, projects.iter().map(|p| p.name.as_str()))
            .await
    }

    /// Like [`upstream_builds`](Self::upstream_builds) over all transitive upstream projects.
    pub async fn transitive_upstream_builds(&self, run: &Run) -> Result<BTreeMap<String, u32>> {
        let projects = self.jobs.transitive_upstream_projects(&run.job);
        self.upstream_builds_of(run, projects.iter().map(|p| p.name.as_str()))
            .await
    }

    async fn upstream_builds_of(
        &self,
        run: &Run,
        projects: impl Iterator<Item = &str>,
    ) -> Result<BTreeMap<String, u32>> {
        let mut out = BTreeMap::new();
        for project in projects {
            if let Some(n) = self.upstream_relationship(run, project).await? {
                out.insert(project.to_string(), n);
            }
        }
        Ok(out)
    }

    /// Dependencies that `to` uses in a newer version than `from` did.
    pub async fn dependency_changes(
        &self,
        to: &Run,
        from: Option<&Run>,
    ) -> Result<BTreeMap<String, DependencyChange>> {
        let Some(from) = from else {
            return Ok(BTreeMap::new());
        };
        let new_deps = self.fingerprints.dependencies(to).await?;
        let old_deps = self.fingerprints.dependencies(from).await?;

        Ok(old_deps
            .into_iter()
            .filter_map(|(project, old)| {
                let new = *new_deps.get(&project)?;
                (old < new).then(|| {
                    (
                        project.clone(),
                        DependencyChange {
                            project,
                            from_id: old,
                            to_id: new,
                        },
                    )
                })
            })
            .collect())
    }

    /// Existing builds of the dependency in `(from_id, to_id]`, ascending.
    pub fn dependency_change_builds(&self, change: &DependencyChange) -> Vec<Run> {
        self.runs
            .between(&change.project, change.from_id, change.to_id)
    }

    /// Users suspected of causing the state of `run`.
    ///
    /// Authors of the run's own changes, plus the culprits of a failing
    /// previous build while this one is still running. With upstream culprits
    /// enabled, authors of upstream builds picked up since the last
    /// successful build are added too.
    pub async fn culprits(&self, run: &Run) -> Result<BTreeSet<String>> {
        let mut culprits = BTreeSet::new();

        if run.is_building() {
            if let Some(prev) = self.runs.previous_completed(&run.job, run.number) {
                if prev
                    .result()
                    .is_some_and(|r| r.is_worse_than(BuildResult::Success))
                {
                    culprits.extend(prev.culprits.iter().cloned());
                }
            }
        }

        culprits.extend(self.changesets.get(run).await.authors());

        if self.upstream_culprits
            && self
                .runs
                .previous_not_failed(&run.job, run.number)
                .is_some()
        {
            let since = self.runs.previous_successful(&run.job, run.number);
            for change in self.dependency_changes(run, since.as_ref()).await?.values() {
                for build in self.dependency_change_builds(change) {
                    culprits.extend(self.changesets.get(&build).await.authors());
                }
            }
        }

        Ok(culprits)
    }

    /// Why `run` must not be discarded, or None if it may be.
    ///
    /// A build is kept when a downstream job with `keep_dependencies` still
    /// has a build that used it, or when it is explicitly marked to keep.
    pub async fn why_keep_log(&self, run: &Run) -> Result<Option<String>> {
        'projects: for project in self.jobs.downstream_projects(&run.job) {
            if !project.keep_dependencies {
                continue;
            }
            let Some(first) = self.runs.first_build(&project.name) else {
                continue;
            };
            let rs = self.downstream_relationship(run, &project.name).await?;
            for n in rs.list_numbers_reverse() {
                if n < first.number {
                    continue 'projects;
                }
                if self.runs.get(&project.name, n).is_some() {
                    return Ok(Some(format!("kept because of {} #{}", project.name, n)));
                }
            }
        }

        if run.keep_log {
            return Ok(Some("kept forever".to_string()));
        }
        Ok(None)
    }

    async fn should_keep(&self, run: &Run) -> Result<bool> {
        if run.is_building() {
            return Ok(true);
        }
        if self.runs.last_successful(&run.job) == Some(run.number)
            || self.runs.last_stable(&run.job) == Some(run.number)
        {
            return Ok(true);
        }
        if let Some(reason) = self.why_keep_log(run).await? {
            debug!(build = %run.full_display_name(), reason, "Keeping build");
            return Ok(true);
        }
        Ok(false)
    }

    /// Apply a discard policy to `job`. Returns the deleted build numbers.
    ///
    /// Builds that are running, kept, or the job's last successful or last
    /// stable build are never deleted.
    pub async fn discard_old_builds(
        &self,
        job: &str,
        policy: &DiscardPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<u32>> {
        let mut deleted = Vec::new();

        if let Some(keep) = policy.num_to_keep {
            for run in self.runs.runs(job).into_iter().skip(keep) {
                if self.should_keep(&run).await? {
                    continue;
                }
                self.delete(&run).await?;
                deleted.push(run.number);
            }
        }

        if let Some(days) = policy.days_to_keep {
            let cutoff = now - ChronoDuration::days(i64::from(days));
            let mut oldest_first = self.runs.runs(job);
            oldest_first.reverse();
            for run in oldest_first {
                if run.timestamp >= cutoff {
                    break;
                }
                if self.should_keep(&run).await? {
                    continue;
                }
                self.delete(&run).await?;
                deleted.push(run.number);
            }
        }

        if !deleted.is_empty() {
            info!(job, count = deleted.len(), "Discarded old builds");
        }
        Ok(deleted)
    }

    async fn delete(&self, run: &Run) -> Result<()> {
        self.changesets.invalidate(&run.ptr());
        self.runs.delete(&run.job, run.number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPersistence;
    use kiln_core::changelog::{ChangeEntry, ChangeLogSet};
    use kiln_core::job::{JobDef, StepSpec};
    use kiln_core::run::Phase;

    const LIB_JAR: &str = "aaaa0000aaaa0000aaaa0000aaaa0000";
    const LIB_JAR_V2: &str = "bbbb1111bbbb1111bbbb1111bbbb1111";

    struct Fixture {
        history: BuildHistory,
        jobs: Arc<JobRegistry>,
    }

    fn fixture(upstream_culprits: bool) -> Fixture {
        let mem = Arc::new(MemoryPersistence::new());
        let jobs = Arc::new(JobRegistry::new());
        let mut a = JobDef::new("A");
        a.downstream = vec!["B".to_string()];
        jobs.put(a);
        let mut b = JobDef::new("B");
        b.publishers = vec![StepSpec::Fingerprint {
            targets: vec!["lib.jar".to_string()],
        }];
        jobs.put(b);

        let history = BuildHistory::new(
            Arc::new(RunStore::new(mem.clone())),
            Arc::new(FingerprintStore::new(mem.clone())),
            Arc::new(ChangeSetCache::new(mem, 16)),
            jobs.clone(),
            upstream_culprits,
        );
        Fixture { history, jobs }
    }

    fn completed(job: &str, number: u32, result: BuildResult) -> Run {
        let mut run = Run::new(job, number);
        run.set_result(result);
        run.phase = Phase::Completed;
        run
    }

    /// Record that `run` used `hash`; `produced` marks it as the artifact's origin.
    async fn use_artifact(f: &Fixture, run: &mut Run, hash: &str, produced: bool) {
        let producer = produced.then(|| run.ptr());
        f.history
            .fingerprints()
            .record(hash, "lib.jar", producer, &run.ptr())
            .await
            .unwrap();
        run.add_fingerprints([("lib.jar".to_string(), hash.to_string())].into());
        f.history.runs().update(run);
    }

    async fn with_author(f: &Fixture, run: &mut Run, author: &str) {
        let set = ChangeLogSet {
            entries: vec![ChangeEntry {
                commit_id: format!("{}-{}", run.job, run.number),
                author: author.to_string(),
                message: "change".to_string(),
                affected_paths: Vec::new(),
            }],
        };
        let key = f.history.runs().save_changelog(run, &set).await.unwrap();
        run.changelog = Some(key);
        f.history.runs().update(run);
    }

    #[tokio::test]
    async fn test_downstream_relationship_grows_with_usage() {
        let f = fixture(false);
        let mut a1 = completed("A", 1, BuildResult::Success);
        use_artifact(&f, &mut a1, LIB_JAR, true).await;
        let mut a2 = completed("A", 2, BuildResult::Success);
        use_artifact(&f, &mut a2, LIB_JAR_V2, true).await;

        let mut b1 = completed("B", 1, BuildResult::Success);
        use_artifact(&f, &mut b1, LIB_JAR, false).await;
        let rs = f.history.downstream_relationship(&a1, "B").await.unwrap();
        assert_eq!(rs.list_numbers().collect::<Vec<_>>(), vec![1]);

        let mut b2 = completed("B", 2, BuildResult::Success);
        use_artifact(&f, &mut b2, LIB_JAR, false).await;
        let rs = f.history.downstream_relationship(&a1, "B").await.unwrap();
        assert_eq!(rs.list_numbers().collect::<Vec<_>>(), vec![1, 2]);

        assert!(f
            .history
            .downstream_relationship(&a2, "B")
            .await
            .unwrap()
            .is_empty());

        let builds = f.history.downstream_builds(&a1).await.unwrap();
        assert_eq!(builds.get("B").map(|r| r.to_string()).as_deref(), Some("1-2"));

        let runs = f.history.downstream_runs(&a1, "B").await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn test_upstream_builds() {
        let f = fixture(false);
        let mut a1 = completed("A", 1, BuildResult::Success);
        use_artifact(&f, &mut a1, LIB_JAR, true).await;
        let mut b1 = completed("B", 1, BuildResult::Success);
        use_artifact(&f, &mut b1, LIB_JAR, false).await;

        let up = f.history.upstream_builds(&b1).await.unwrap();
        assert_eq!(up.get("A"), Some(&1));
        assert_eq!(f.history.upstream_run(&b1, "A").await.unwrap().unwrap().number, 1);

        let mut c = JobDef::new("C");
        c.downstream = vec!["A".to_string()];
        f.jobs.put(c);
        let transitive = f.history.transitive_upstream_builds(&b1).await.unwrap();
        assert_eq!(transitive.len(), 1);
        assert_eq!(transitive.get("A"), Some(&1));
    }

    #[tokio::test]
    async fn test_dependency_changes_and_builds() {
        let f = fixture(false);
        let mut a1 = completed("A", 1, BuildResult::Success);
        use_artifact(&f, &mut a1, LIB_JAR, true).await;
        f.history.runs().update(&completed("A", 2, BuildResult::Success));
        let mut a3 = completed("A", 3, BuildResult::Success);
        use_artifact(&f, &mut a3, LIB_JAR_V2, true).await;

        let mut b1 = completed("B", 1, BuildResult::Success);
        use_artifact(&f, &mut b1, LIB_JAR, false).await;
        let mut b2 = completed("B", 2, BuildResult::Success);
        use_artifact(&f, &mut b2, LIB_JAR_V2, false).await;

        let changes = f.history.dependency_changes(&b2, Some(&b1)).await.unwrap();
        let change = changes.get("A").unwrap();
        assert_eq!((change.from_id, change.to_id), (1, 3));
        let numbers: Vec<u32> = f
            .history
            .dependency_change_builds(change)
            .iter()
            .map(|r| r.number)
            .collect();
        assert_eq!(numbers, vec![2, 3]);

        assert!(f.history.dependency_changes(&b2, None).await.unwrap().is_empty());
        assert!(f
            .history
            .dependency_changes(&b1, Some(&b2))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_culprits_inherit_from_failing_previous() {
        let f = fixture(false);
        let mut b1 = completed("B", 1, BuildResult::Failure);
        b1.culprits.insert("carol".to_string());
        f.history.runs().update(&b1);

        let mut b2 = Run::new("B", 2);
        b2.phase = Phase::Building;
        with_author(&f, &mut b2, "dave").await;

        let culprits = f.history.culprits(&b2).await.unwrap();
        assert_eq!(
            culprits.into_iter().collect::<Vec<_>>(),
            vec!["carol".to_string(), "dave".to_string()]
        );

        // Once completed only the own changes count.
        b2.phase = Phase::Completed;
        let culprits = f.history.culprits(&b2).await.unwrap();
        assert_eq!(culprits.len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_culprits() {
        let f = fixture(true);
        let mut a1 = completed("A", 1, BuildResult::Success);
        use_artifact(&f, &mut a1, LIB_JAR, true).await;
        let mut a2 = completed("A", 2, BuildResult::Success);
        use_artifact(&f, &mut a2, LIB_JAR_V2, true).await;
        with_author(&f, &mut a2, "erin").await;

        let mut b1 = completed("B", 1, BuildResult::Success);
        use_artifact(&f, &mut b1, LIB_JAR, false).await;
        let mut b2 = completed("B", 2, BuildResult::Failure);
        use_artifact(&f, &mut b2, LIB_JAR_V2, false).await;

        let culprits = f.history.culprits(&b2).await.unwrap();
        assert!(culprits.contains("erin"));

        let plain = fixture(false);
        assert!(plain.history.culprits(&b2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_why_keep_log() {
        let f = fixture(false);
        let mut a1 = completed("A", 1, BuildResult::Success);
        use_artifact(&f, &mut a1, LIB_JAR, true).await;
        let mut b1 = completed("B", 1, BuildResult::Success);
        use_artifact(&f, &mut b1, LIB_JAR, false).await;

        assert!(f.history.why_keep_log(&a1).await.unwrap().is_none());

        let mut b = (*f.jobs.get("B").unwrap()).clone();
        b.keep_dependencies = true;
        f.jobs.put(b);
        assert_eq!(
            f.history.why_keep_log(&a1).await.unwrap().as_deref(),
            Some("kept because of B #1")
        );

        let mut a2 = completed("A", 2, BuildResult::Success);
        a2.set_keep_log(true);
        assert_eq!(
            f.history.why_keep_log(&a2).await.unwrap().as_deref(),
            Some("kept forever")
        );
    }

    #[tokio::test]
    async fn test_discard_keeps_protected_builds() {
        let f = fixture(false);
        let runs = f.history.runs();
        for (n, result) in [
            (1, BuildResult::Success),
            (2, BuildResult::Failure),
            (3, BuildResult::Unstable),
            (4, BuildResult::Failure),
            (5, BuildResult::Failure),
        ] {
            let run = completed("A", n, result);
            runs.save(&run).await.unwrap();
            runs.update_pointers(&run).await.unwrap();
        }
        let mut kept = runs.get("A", 2).unwrap();
        kept.set_keep_log(true);
        runs.save(&kept).await.unwrap();

        let policy = DiscardPolicy {
            num_to_keep: Some(1),
            days_to_keep: None,
        };
        let deleted = f
            .history
            .discard_old_builds("A", &policy, Utc::now())
            .await
            .unwrap();
        // 5 is within the limit, 3 is last successful, 1 is last stable, 2 is kept.
        assert_eq!(deleted, vec![4]);
        assert_eq!(runs.numbers("A"), vec![1, 2, 3, 5]);
    }

    #[tokio::test]
    async fn test_discard_by_age() {
        let f = fixture(false);
        let runs = f.history.runs();
        let now = Utc::now();
        for n in 1..=3 {
            let mut run = completed("A", n, BuildResult::Failure);
            run.timestamp = now - ChronoDuration::days(10 - i64::from(n));
            runs.save(&run).await.unwrap();
        }
        let mut fresh = completed("A", 4, BuildResult::Failure);
        fresh.timestamp = now;
        runs.save(&fresh).await.unwrap();

        let policy = DiscardPolicy {
            num_to_keep: None,
            days_to_keep: Some(5),
        };
        let deleted = f.history.discard_old_builds("A", &policy, now).await.unwrap();
        assert_eq!(deleted, vec![1, 2, 3]);
        assert_eq!(runs.numbers("A"), vec![4]);
    }
}
