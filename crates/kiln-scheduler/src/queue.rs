//! Build queue.
//!
//! Items move from waiting (quiet period) to blocked or buildable, and leave
//! the queue when an idle executor takes them. Every scheduling pass runs
//! under one lock, so "item became buildable" and "executor became free"
//! can never race each other.

use chrono::{DateTime, Utc};
use kiln_core::job::{JobDef, JobRegistry};
use kiln_core::node::LabelExpr;
use kiln_core::run::Cause;
use kiln_core::{Error, QueueId, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::nodes::NodeRegistry;

const LEFT_HISTORY: usize = 100;

/// Requested build of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub job: String,
    pub parameters: BTreeMap<String, String>,
    pub causes: Vec<Cause>,
    /// Higher goes first.
    pub priority: i32,
}

impl Task {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            parameters: BTreeMap::new(),
            causes: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_cause(mut self, cause: Cause) -> Self {
        self.causes.push(cause);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Same job with the same parameters.
    pub fn is_equivalent(&self, other: &Task) -> bool {
        self.job == other.job && self.parameters == other.parameters
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    /// In its quiet period.
    Waiting,
    Blocked { reason: String },
    Buildable,
}

#[derive(Debug, Clone)]
struct QueueItem {
    id: QueueId,
    task: Task,
    label: Option<LabelExpr>,
    submitted: DateTime<Utc>,
    due: Instant,
    state: ItemState,
    stuck: bool,
}

impl QueueItem {
    fn order(a: &QueueItem, b: &QueueItem) -> Ordering {
        b.task
            .priority
            .cmp(&a.task.priority)
            .then(a.submitted.cmp(&b.submitted))
            .then(a.id.cmp(&b.id))
    }
}

/// Returned by [`Queue::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItemHandle {
    pub id: QueueId,
    pub job: String,
    /// The submission was merged into an item already waiting.
    pub coalesced: bool,
}

/// Snapshot of a queued item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub id: QueueId,
    pub job: String,
    pub parameters: BTreeMap<String, String>,
    pub causes: Vec<Cause>,
    pub priority: i32,
    pub submitted: DateTime<Utc>,
    #[serde(flatten)]
    pub state: ItemState,
    /// No connected node can ever run this item.
    pub stuck: bool,
    pub due_in: Option<Duration>,
}

impl ItemView {
    /// Why the item is not running yet.
    pub fn why(&self) -> Option<String> {
        match &self.state {
            ItemState::Waiting => Some("In the quiet period".to_string()),
            ItemState::Blocked { reason } => Some(reason.clone()),
            ItemState::Buildable if self.stuck => {
                Some("There are no nodes with the label this job needs".to_string())
            }
            ItemState::Buildable => Some("Waiting for next available executor".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LeftOutcome {
    Cancelled,
    Assigned { node: String, executor: usize },
    Started { number: u32 },
}

/// An item that has left the queue.
#[derive(Debug, Clone, Serialize)]
pub struct LeftItem {
    pub id: QueueId,
    pub job: String,
    pub outcome: LeftOutcome,
    pub at: DateTime<Utc>,
}

/// Work handed to an executor.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: QueueId,
    pub task: Task,
    pub submitted: DateTime<Utc>,
    pub node: String,
    pub executor: usize,
    label: Option<LabelExpr>,
}

struct Offer {
    id: u64,
    node: String,
    executor: usize,
    tx: oneshot::Sender<WorkUnit>,
}

#[derive(Default)]
struct State {
    items: Vec<QueueItem>,
    offers: Vec<Offer>,
    running: HashMap<String, usize>,
    left: VecDeque<LeftItem>,
    next_item: u64,
    next_offer: u64,
}

impl State {
    fn running(&self, job: &str) -> usize {
        self.running.get(job).copied().unwrap_or(0)
    }

    fn push_left(&mut self, id: QueueId, job: &str, outcome: LeftOutcome) {
        if self.left.len() == LEFT_HISTORY {
            self.left.pop_front();
        }
        self.left.push_back(LeftItem {
            id,
            job: job.to_string(),
            outcome,
            at: Utc::now(),
        });
    }

    /// Put a unit an executor never picked up back in line.
    fn requeue(&mut self, unit: WorkUnit) {
        if let Some(n) = self.running.get_mut(&unit.task.job) {
            *n = n.saturating_sub(1);
        }
        self.left.retain(|l| l.id != unit.id);
        self.items.push(QueueItem {
            id: unit.id,
            task: unit.task,
            label: unit.label,
            submitted: unit.submitted,
            due: Instant::now(),
            state: ItemState::Buildable,
            stuck: false,
        });
    }
}

/// Cleans up after an executor that stopped waiting for work.
struct OfferGuard<'a> {
    queue: &'a Queue,
    id: u64,
    rx: oneshot::Receiver<WorkUnit>,
    done: bool,
}

impl Drop for OfferGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let requeued = {
            let mut state = self.queue.state.lock();
            if let Some(pos) = state.offers.iter().position(|o| o.id == self.id) {
                state.offers.remove(pos);
                false
            } else {
                self.rx.close();
                match self.rx.try_recv() {
                    Ok(unit) => {
                        debug!(item = %unit.id, job = %unit.task.job, "Executor went away, requeueing");
                        state.requeue(unit);
                        true
                    }
                    Err(_) => false,
                }
            }
        };
        if requeued {
            self.queue.maintain();
        }
    }
}

/// The build queue.
pub struct Queue {
    state: Mutex<State>,
    jobs: Arc<JobRegistry>,
    nodes: Arc<NodeRegistry>,
    quiet_period: Duration,
    wake: Notify,
}

impl Queue {
    pub fn new(jobs: Arc<JobRegistry>, nodes: Arc<NodeRegistry>, quiet_period: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            jobs,
            nodes,
            quiet_period,
            wake: Notify::new(),
        }
    }

    /// Queue a build of `task.job`.
    ///
    /// An equivalent item still in its quiet period absorbs the submission:
    /// its causes are merged and its timer restarts. Otherwise a job that
    /// does not allow concurrent builds refuses a second equivalent item.
    pub fn submit(&self, task: Task) -> Result<QueueItemHandle> {
        let job = self.jobs.require(&task.job)?;
        let label = job.label_expr()?;
        let quiet = job.quiet_period.unwrap_or(self.quiet_period);
        let now = Instant::now();

        let handle = {
            let mut state = self.state.lock();
            let existing = state.items.iter_mut().find(|i| i.task.is_equivalent(&task));
            match existing {
                Some(item) if item.state == ItemState::Waiting => {
                    item.due = if quiet.is_zero() {
                        now.min(item.due)
                    } else {
                        item.due.max(now + quiet)
                    };
                    for cause in task.causes {
                        if !item.task.causes.contains(&cause) {
                            item.task.causes.push(cause);
                        }
                    }
                    item.task.priority = item.task.priority.max(task.priority);
                    debug!(item = %item.id, job = %item.task.job, "Coalesced submission");
                    QueueItemHandle {
                        id: item.id,
                        job: item.task.job.clone(),
                        coalesced: true,
                    }
                }
                Some(item) if !job.concurrent => {
                    return Err(Error::DuplicateTask(format!(
                        "{} is already queued as item {}",
                        job.name, item.id
                    )));
                }
                _ => {
                    state.next_item += 1;
                    let id = QueueId(state.next_item);
                    info!(item = %id, job = %task.job, quiet_secs = quiet.as_secs(), "Queued");
                    let job_name = task.job.clone();
                    state.items.push(QueueItem {
                        id,
                        task,
                        label,
                        submitted: Utc::now(),
                        due: now + quiet,
                        state: ItemState::Waiting,
                        stuck: false,
                    });
                    QueueItemHandle {
                        id,
                        job: job_name,
                        coalesced: false,
                    }
                }
            }
        };

        self.schedule();
        Ok(handle)
    }

    /// Remove an item that has not been handed to an executor yet.
    pub fn cancel(&self, id: QueueId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.items.iter().position(|i| i.id == id) {
                Some(pos) => {
                    let item = state.items.remove(pos);
                    state.push_left(item.id, &item.task.job, LeftOutcome::Cancelled);
                    info!(item = %id, job = %item.task.job, "Cancelled");
                    true
                }
                None => false,
            }
        };
        if removed {
            self.schedule();
        }
        removed
    }

    /// Park an idle executor until the queue hands it work.
    ///
    /// Dropping the future withdraws the offer; work already handed to it
    /// goes back to the queue.
    pub async fn offer(&self, node: &str, executor: usize) -> Result<WorkUnit> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock();
            state.next_offer += 1;
            let id = state.next_offer;
            state.offers.push(Offer {
                id,
                node: node.to_string(),
                executor,
                tx,
            });
            id
        };
        let mut guard = OfferGuard {
            queue: self,
            id,
            rx,
            done: false,
        };
        self.maintain();

        let unit = (&mut guard.rx).await;
        guard.done = true;
        unit.map_err(|_| Error::Internal("queue dropped an executor offer".to_string()))
    }

    /// A build of `job` handed out by this queue has finished.
    pub fn on_completed(&self, job: &str) {
        {
            let mut state = self.state.lock();
            if let Some(n) = state.running.get_mut(job) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    state.running.remove(job);
                }
            }
        }
        self.schedule();
    }

    /// Record the build number an assigned item started as.
    pub fn mark_started(&self, id: QueueId, number: u32) {
        let mut state = self.state.lock();
        if let Some(left) = state.left.iter_mut().rev().find(|l| l.id == id) {
            left.outcome = LeftOutcome::Started { number };
        }
    }

    /// Run a scheduling pass now and let the maintenance loop recompute its deadline.
    pub fn schedule(&self) {
        self.maintain();
        self.wake.notify_one();
    }

    fn block_reason(&self, state: &State, job: &JobDef) -> Option<String> {
        if let Some(limit) = job.concurrency_limit() {
            if state.running(&job.name) >= limit {
                return Some(if limit == 1 {
                    format!("A build of {} is already in progress", job.name)
                } else {
                    format!("{} is already running {} builds", job.name, limit)
                });
            }
        }

        if job.block_on_upstream {
            for up in self.jobs.transitive_upstream_projects(&job.name) {
                if state.running(&up.name) > 0 {
                    return Some(format!("Upstream project {} is already building", up.name));
                }
                let pending = state.items.iter().any(|i| {
                    i.task.job == up.name && !matches!(i.state, ItemState::Blocked { .. })
                });
                if pending {
                    return Some(format!("Upstream project {} is waiting to build", up.name));
                }
            }
        }
        None
    }

    fn offer_matches(&self, offer: &Offer, label: Option<&LabelExpr>) -> bool {
        self.nodes
            .get(&offer.node)
            .is_some_and(|n| n.is_online() && n.node.satisfies(label))
    }

    /// One scheduling pass.
    pub fn maintain(&self) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.offers.retain(|o| !o.tx.is_closed());
        state.items.sort_by(QueueItem::order);

        let mut i = 0;
        while i < state.items.len() {
            if state.items[i].state == ItemState::Waiting && state.items[i].due > now {
                i += 1;
                continue;
            }

            let Some(job) = self.jobs.get(&state.items[i].task.job) else {
                state.items[i].state = ItemState::Blocked {
                    reason: format!("Job {} no longer exists", state.items[i].task.job),
                };
                i += 1;
                continue;
            };

            if let Some(reason) = self.block_reason(state, &job) {
                let item = &mut state.items[i];
                if !matches!(&item.state, ItemState::Blocked { reason: r } if *r == reason) {
                    debug!(item = %item.id, job = %job.name, reason = %reason, "Blocked");
                }
                item.state = ItemState::Blocked { reason };
                i += 1;
                continue;
            }

            let stuck = !self.nodes.any_can_take(state.items[i].label.as_ref());
            {
                let item = &mut state.items[i];
                item.state = ItemState::Buildable;
                if stuck && !item.stuck {
                    warn!(item = %item.id, job = %job.name, "No node can run this item");
                }
                item.stuck = stuck;
            }

            let mut assigned = None;
            while let Some(pos) = state
                .offers
                .iter()
                .position(|o| self.offer_matches(o, state.items[i].label.as_ref()))
            {
                let offer = state.offers.remove(pos);
                let item = &state.items[i];
                let unit = WorkUnit {
                    id: item.id,
                    task: item.task.clone(),
                    submitted: item.submitted,
                    node: offer.node.clone(),
                    executor: offer.executor,
                    label: item.label.clone(),
                };
                if offer.tx.send(unit).is_ok() {
                    assigned = Some((offer.node, offer.executor));
                    break;
                }
            }

            match assigned {
                Some((node, executor)) => {
                    let item = state.items.remove(i);
                    *state.running.entry(item.task.job.clone()).or_default() += 1;
                    info!(item = %item.id, job = %item.task.job, node = %node, executor, "Assigned");
                    state.push_left(item.id, &item.task.job, LeftOutcome::Assigned { node, executor });
                }
                None => i += 1,
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.state
            .lock()
            .items
            .iter()
            .filter(|i| i.state == ItemState::Waiting)
            .map(|i| i.due)
            .min()
    }

    /// Re-run scheduling passes until `cancel` fires: when a quiet period
    /// ends, after every `interval`, and whenever [`Queue::schedule`] is called.
    pub async fn run_maintenance(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Queue maintenance started");
        loop {
            let wait = self
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()).min(interval))
                .unwrap_or(interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            self.maintain();
        }
        info!("Queue maintenance stopped");
    }

    /// Items still in the queue, in scheduling order.
    pub fn items(&self) -> Vec<ItemView> {
        let now = Instant::now();
        let mut items = self.state.lock().items.clone();
        items.sort_by(QueueItem::order);
        items
            .into_iter()
            .map(|i| ItemView {
                due_in: (i.state == ItemState::Waiting).then(|| i.due.saturating_duration_since(now)),
                id: i.id,
                job: i.task.job,
                parameters: i.task.parameters,
                causes: i.task.causes,
                priority: i.task.priority,
                submitted: i.submitted,
                state: i.state,
                stuck: i.stuck,
            })
            .collect()
    }

    pub fn item(&self, id: QueueId) -> Option<ItemView> {
        self.items().into_iter().find(|i| i.id == id)
    }

    /// Recently departed items, oldest first.
    pub fn left(&self) -> Vec<LeftItem> {
        self.state.lock().left.iter().cloned().collect()
    }

    pub fn is_queued(&self, job: &str) -> bool {
        self.state.lock().items.iter().any(|i| i.task.job == job)
    }

    /// Builds of `job` handed out and not yet completed.
    pub fn running(&self, job: &str) -> usize {
        self.state.lock().running(job)
    }

    pub fn idle_offers(&self) -> usize {
        self.state.lock().offers.len()
    }
}
