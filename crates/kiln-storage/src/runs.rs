//! Build records of every job.
//!
//! Layout under the persistence root:
//!
//! ```text
//! jobs/<job>/nextBuildNumber
//! jobs/<job>/lastSuccessful
//! jobs/<job>/lastStable
//! jobs/<job>/builds/<n>/build.json
//! jobs/<job>/builds/<n>/changelog.json
//! jobs/<job>/builds/<n>/log
//! ```
//!
//! Records are cached in memory once a job has been loaded. Readers get
//! clones, so a snapshot never changes under them.

use bytes::Bytes;
use kiln_core::changelog::ChangeLogSet;
use kiln_core::persistence::Persistence;
use kiln_core::run::{Phase, Run};
use kiln_core::{BuildResult, Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub fn build_key(job: &str, number: u32, file: &str) -> String {
    format!("jobs/{}/builds/{}/{}", job, number, file)
}

fn job_key(job: &str, file: &str) -> String {
    format!("jobs/{}/{}", job, file)
}

#[derive(Debug)]
struct JobRuns {
    loaded: bool,
    runs: BTreeMap<u32, Run>,
    next_number: u32,
    last_successful: Option<u32>,
    last_stable: Option<u32>,
}

impl Default for JobRuns {
    fn default() -> Self {
        Self {
            loaded: false,
            runs: BTreeMap::new(),
            next_number: 1,
            last_successful: None,
            last_stable: None,
        }
    }
}

/// Persistent store of runs, build numbers and the last-successful/last-stable pointers.
pub struct RunStore {
    persistence: Arc<dyn Persistence>,
    jobs: RwLock<HashMap<String, JobRuns>>,
    /// Serializes writes of counters and pointers so the newest value lands last.
    counter_io: tokio::sync::Mutex<()>,
}

impl RunStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            jobs: RwLock::new(HashMap::new()),
            counter_io: tokio::sync::Mutex::new(()),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    async fn read_u32(&self, key: &str) -> Result<Option<u32>> {
        let Some(data) = self.persistence.read(key).await? else {
            return Ok(None);
        };
        match std::str::from_utf8(&data).ok().and_then(|s| s.trim().parse().ok()) {
            Some(n) => Ok(Some(n)),
            None => {
                warn!(key, "Ignoring unreadable counter");
                Ok(None)
            }
        }
    }

    /// Load a job's records from persistence, once.
    ///
    /// Records of builds that never completed (the controller stopped while
    /// they ran) are marked ABORTED.
    pub async fn load_job(&self, job: &str) -> Result<()> {
        if self.jobs.read().get(job).is_some_and(|j| j.loaded) {
            return Ok(());
        }

        let mut loaded = BTreeMap::new();
        for key in self.persistence.list(&format!("jobs/{}/builds/", job)).await? {
            if !key.ends_with("/build.json") {
                continue;
            }
            let Some(data) = self.persistence.read(&key).await? else {
                continue;
            };
            let mut run: Run = match serde_json::from_slice(&data) {
                Ok(run) => run,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable build record");
                    continue;
                }
            };
            if run.result().is_none() || run.phase.is_active() {
                info!(build = %run.full_display_name(), "Marking interrupted build as aborted");
                run.set_result(BuildResult::Aborted);
                run.phase = Phase::Completed;
                self.write_run(&run).await?;
            }
            loaded.insert(run.number, run);
        }

        let stored_next = self.read_u32(&job_key(job, "nextBuildNumber")).await?;
        let last_successful = self.read_u32(&job_key(job, "lastSuccessful")).await?;
        let last_stable = self.read_u32(&job_key(job, "lastStable")).await?;

        let mut jobs = self.jobs.write();
        let entry = jobs.entry(job.to_string()).or_default();
        if entry.loaded {
            return Ok(());
        }
        let highest = loaded.keys().next_back().copied().unwrap_or(0);
        entry.next_number = entry
            .next_number
            .max(stored_next.unwrap_or(1))
            .max(highest + 1);
        for (n, run) in loaded {
            entry.runs.entry(n).or_insert(run);
        }
        entry.last_successful = entry.last_successful.max(last_successful);
        entry.last_stable = entry.last_stable.max(last_stable);
        entry.loaded = true;

        debug!(job, builds = entry.runs.len(), next = entry.next_number, "Job records loaded");
        Ok(())
    }

    /// Allocate the next build number of `job` and persist the counter.
    ///
    /// Numbers are unique and strictly increasing per job, including across
    /// restarts.
    pub async fn next_build_number(&self, job: &str) -> Result<u32> {
        self.load_job(job).await?;
        let number = {
            let mut jobs = self.jobs.write();
            let entry = jobs.entry(job.to_string()).or_default();
            let n = entry.next_number;
            entry.next_number += 1;
            n
        };

        let _io = self.counter_io.lock().await;
        let current = self
            .jobs
            .read()
            .get(job)
            .map(|j| j.next_number)
            .unwrap_or(number + 1);
        self.persistence
            .atomic_write(
                &job_key(job, "nextBuildNumber"),
                Bytes::from(current.to_string()),
            )
            .await?;
        Ok(number)
    }

    /// Publish a snapshot of `run` to readers without writing it out.
    pub fn update(&self, run: &Run) {
        self.jobs
            .write()
            .entry(run.job.clone())
            .or_default()
            .runs
            .insert(run.number, run.clone());
    }

    async fn write_run(&self, run: &Run) -> Result<()> {
        let data = serde_json::to_vec_pretty(run)?;
        self.persistence
            .atomic_write(&build_key(&run.job, run.number, "build.json"), Bytes::from(data))
            .await
    }

    /// Persist `run` and publish it to readers.
    pub async fn save(&self, run: &Run) -> Result<()> {
        self.update(run);
        self.write_run(run).await
    }

    pub async fn save_log(&self, run: &Run, text: &str) -> Result<()> {
        self.persistence
            .atomic_write(
                &build_key(&run.job, run.number, "log"),
                Bytes::from(text.to_string()),
            )
            .await
    }

    pub async fn load_log(&self, job: &str, number: u32) -> Result<Option<String>> {
        Ok(self
            .persistence
            .read(&build_key(job, number, "log"))
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Persist a change log and return its key.
    pub async fn save_changelog(&self, run: &Run, changes: &ChangeLogSet) -> Result<String> {
        let key = build_key(&run.job, run.number, "changelog.json");
        let data = serde_json::to_vec_pretty(changes)?;
        self.persistence.atomic_write(&key, Bytes::from(data)).await?;
        Ok(key)
    }

    /// Move the last-successful/last-stable pointers forward if `run` qualifies.
    pub async fn update_pointers(&self, run: &Run) -> Result<()> {
        let Some(result) = run.result() else {
            return Ok(());
        };

        let (successful, stable) = {
            let mut jobs = self.jobs.write();
            let entry = jobs.entry(run.job.clone()).or_default();
            if result.is_successful() {
                entry.last_successful = entry.last_successful.max(Some(run.number));
            }
            if result == BuildResult::Success {
                entry.last_stable = entry.last_stable.max(Some(run.number));
            }
            (entry.last_successful, entry.last_stable)
        };

        let _io = self.counter_io.lock().await;
        if let Some(n) = successful.filter(|_| result.is_successful()) {
            self.persistence
                .atomic_write(&job_key(&run.job, "lastSuccessful"), Bytes::from(n.to_string()))
                .await?;
        }
        if let Some(n) = stable.filter(|_| result == BuildResult::Success) {
            self.persistence
                .atomic_write(&job_key(&run.job, "lastStable"), Bytes::from(n.to_string()))
                .await?;
        }
        Ok(())
    }

    /// Delete a build record and everything stored with it.
    pub async fn delete(&self, job: &str, number: u32) -> Result<()> {
        {
            let mut jobs = self.jobs.write();
            if let Some(entry) = jobs.get_mut(job) {
                if entry.runs.get(&number).is_some_and(Run::is_building) {
                    return Err(Error::Conflict(format!(
                        "{} #{} is still building",
                        job, number
                    )));
                }
                entry.runs.remove(&number);
            }
        }
        for file in ["build.json", "changelog.json", "log"] {
            self.persistence.delete(&build_key(job, number, file)).await?;
        }
        info!(job, number, "Build record deleted");
        Ok(())
    }

    fn with_job<T>(&self, job: &str, f: impl FnOnce(&JobRuns) -> Option<T>) -> Option<T> {
        self.jobs.read().get(job).and_then(f)
    }

    pub fn get(&self, job: &str, number: u32) -> Option<Run> {
        self.with_job(job, |j| j.runs.get(&number).cloned())
    }

    /// All runs of a job, newest first.
    pub fn runs(&self, job: &str) -> Vec<Run> {
        self.with_job(job, |j| Some(j.runs.values().rev().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn numbers(&self, job: &str) -> Vec<u32> {
        self.with_job(job, |j| Some(j.runs.keys().copied().collect()))
            .unwrap_or_default()
    }

    pub fn first_build(&self, job: &str) -> Option<Run> {
        self.with_job(job, |j| j.runs.values().next().cloned())
    }

    pub fn last_build(&self, job: &str) -> Option<Run> {
        self.with_job(job, |j| j.runs.values().next_back().cloned())
    }

    /// Number of runs of `job` that are currently building.
    pub fn building_count(&self, job: &str) -> usize {
        self.with_job(job, |j| Some(j.runs.values().filter(|r| r.is_building()).count()))
            .unwrap_or(0)
    }

    fn previous_matching(&self, job: &str, number: u32, pred: impl Fn(&Run) -> bool) -> Option<Run> {
        self.with_job(job, |j| {
            j.runs
                .range(..number)
                .rev()
                .map(|(_, r)| r)
                .find(|r| pred(r))
                .cloned()
        })
    }

    pub fn previous_build(&self, job: &str, number: u32) -> Option<Run> {
        self.previous_matching(job, number, |_| true)
    }

    pub fn previous_completed(&self, job: &str, number: u32) -> Option<Run> {
        self.previous_matching(job, number, |r| !r.is_building())
    }

    /// Previous completed build that was SUCCESS or UNSTABLE.
    pub fn previous_successful(&self, job: &str, number: u32) -> Option<Run> {
        self.previous_matching(job, number, |r| {
            !r.is_building() && r.result().is_some_and(BuildResult::is_successful)
        })
    }

    /// Previous completed build whose result was not FAILURE.
    pub fn previous_not_failed(&self, job: &str, number: u32) -> Option<Run> {
        self.previous_matching(job, number, |r| {
            !r.is_building() && r.result().is_some_and(|res| res != BuildResult::Failure)
        })
    }

    /// Runs with a number in `(from, to]`, ascending.
    pub fn between(&self, job: &str, from: u32, to: u32) -> Vec<Run> {
        if to <= from {
            return Vec::new();
        }
        self.with_job(job, |j| {
            Some(j.runs.range(from + 1..=to).map(|(_, r)| r.clone()).collect())
        })
        .unwrap_or_default()
    }

    pub fn last_successful(&self, job: &str) -> Option<u32> {
        self.with_job(job, |j| j.last_successful)
    }

    pub fn last_stable(&self, job: &str) -> Option<u32> {
        self.with_job(job, |j| j.last_stable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsPersistence;
    use crate::memory::MemoryPersistence;

    fn completed(job: &str, number: u32, result: BuildResult) -> Run {
        let mut run = Run::new(job, number);
        run.set_result(result);
        run.phase = Phase::Completed;
        run
    }

    #[tokio::test]
    async fn test_build_numbers_increase() {
        let store = RunStore::new(Arc::new(MemoryPersistence::new()));
        assert_eq!(store.next_build_number("app").await.unwrap(), 1);
        assert_eq!(store.next_build_number("app").await.unwrap(), 2);
        assert_eq!(store.next_build_number("lib").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_build_numbers_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RunStore::new(Arc::new(FsPersistence::new(dir.path())));
            for _ in 0..3 {
                store.next_build_number("app").await.unwrap();
            }
        }
        let store = RunStore::new(Arc::new(FsPersistence::new(dir.path())));
        assert_eq!(store.next_build_number("app").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_numbers_are_unique() {
        let store = Arc::new(RunStore::new(Arc::new(MemoryPersistence::new())));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.next_build_number("app").await.unwrap()
            }));
        }
        let mut numbers = Vec::new();
        for h in handles {
            numbers.push(h.await.unwrap());
        }
        numbers.sort();
        assert_eq!(numbers, (1..=16).collect::<Vec<_>>());

        let stored = store
            .persistence()
            .read("jobs/app/nextBuildNumber")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&stored[..], b"17");
    }

    #[tokio::test]
    async fn test_interrupted_runs_load_as_aborted() {
        let mem = Arc::new(MemoryPersistence::new());
        {
            let store = RunStore::new(mem.clone());
            let mut run = Run::new("app", 1);
            run.phase = Phase::Building;
            store.save(&run).await.unwrap();
            store.save(&completed("app", 2, BuildResult::Success)).await.unwrap();
        }

        let store = RunStore::new(mem);
        store.load_job("app").await.unwrap();
        let run = store.get("app", 1).unwrap();
        assert_eq!(run.result(), Some(BuildResult::Aborted));
        assert!(!run.is_building());
        assert_eq!(store.get("app", 2).unwrap().result(), Some(BuildResult::Success));
        assert_eq!(store.next_build_number("app").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_previous_queries() {
        let store = RunStore::new(Arc::new(MemoryPersistence::new()));
        store.update(&completed("app", 1, BuildResult::Success));
        store.update(&completed("app", 2, BuildResult::Failure));
        store.update(&completed("app", 3, BuildResult::Unstable));
        store.update(&completed("app", 4, BuildResult::Aborted));
        let mut building = Run::new("app", 5);
        building.phase = Phase::Building;
        store.update(&building);

        assert_eq!(store.previous_completed("app", 5).unwrap().number, 4);
        assert_eq!(store.previous_successful("app", 5).unwrap().number, 3);
        assert_eq!(store.previous_successful("app", 3).unwrap().number, 1);
        assert_eq!(store.previous_not_failed("app", 3).unwrap().number, 1);
        assert_eq!(store.previous_not_failed("app", 5).unwrap().number, 4);
        assert!(store.previous_build("app", 1).is_none());
        assert_eq!(store.building_count("app"), 1);
        assert_eq!(
            store.between("app", 1, 3).iter().map(|r| r.number).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn test_pointers() {
        let mem = Arc::new(MemoryPersistence::new());
        let store = RunStore::new(mem.clone());
        store.update_pointers(&completed("app", 1, BuildResult::Success)).await.unwrap();
        store.update_pointers(&completed("app", 2, BuildResult::Unstable)).await.unwrap();
        store.update_pointers(&completed("app", 3, BuildResult::Failure)).await.unwrap();

        assert_eq!(store.last_successful("app"), Some(2));
        assert_eq!(store.last_stable("app"), Some(1));

        let reloaded = RunStore::new(mem);
        reloaded.load_job("app").await.unwrap();
        assert_eq!(reloaded.last_successful("app"), Some(2));
        assert_eq!(reloaded.last_stable("app"), Some(1));
    }

    #[tokio::test]
    async fn test_delete_removes_files() {
        let mem = Arc::new(MemoryPersistence::new());
        let store = RunStore::new(mem.clone());
        let run = completed("app", 1, BuildResult::Success);
        store.save(&run).await.unwrap();
        store.save_log(&run, "hello\n").await.unwrap();
        store.save_changelog(&run, &ChangeLogSet::empty()).await.unwrap();
        assert_eq!(store.load_log("app", 1).await.unwrap().as_deref(), Some("hello\n"));

        store.delete("app", 1).await.unwrap();
        assert!(store.get("app", 1).is_none());
        assert!(mem.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_refuses_building_run() {
        let store = RunStore::new(Arc::new(MemoryPersistence::new()));
        let mut run = Run::new("app", 1);
        run.phase = Phase::Building;
        store.update(&run);
        assert!(matches!(store.delete("app", 1).await, Err(Error::Conflict(_))));
        assert!(store.get("app", 1).is_some());
    }
}
