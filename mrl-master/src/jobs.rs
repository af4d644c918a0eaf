use std::collections::{BTreeSet, VecDeque};

use common::protocol::JobSummary;
use common::{BucketId, JobId, SplitId};
use tracing::{debug, info};

use crate::worker_info::{WorkerID, WorkerState};

/// State of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Job not started.
    Queued,

    /// Mapping phase.
    Mapping,

    /// Reducing phase.
    Reducing,

    /// Job completed.
    Finished,
}

/// Parameters of a job, fixed at creation.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Number of map splits, M.
    pub map_tasks: u32,

    /// Number of reduce buckets, R.
    pub reduce_tasks: u32,

    /// A worker not heard from for this long gets no new work.
    pub heartbeat_timeout_ms: i64,

    /// A worker without progress for this long is dead and loses its work.
    pub acknowledge_timeout_ms: i64,

    /// Opaque code shipped to every worker.
    pub code: String,
}

/// A map split and who holds its output.
#[derive(Debug, Clone)]
pub struct Split {
    id: SplitId,

    /// Worker currently mapping this split.
    assigned_to: Option<WorkerID>,

    /// Workers that acknowledged mapping it and can serve its output.
    holders: BTreeSet<WorkerID>,
}

impl Split {
    fn new(id: SplitId) -> Self {
        Self {
            id,
            assigned_to: None,
            holders: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> SplitId {
        self.id
    }

    pub fn assigned_to(&self) -> Option<WorkerID> {
        self.assigned_to
    }

    pub fn is_mapped(&self) -> bool {
        !self.holders.is_empty()
    }

    pub fn holders(&self) -> impl Iterator<Item = WorkerID> + '_ {
        self.holders.iter().copied()
    }
}

/// A reduce partition.
#[derive(Debug, Clone)]
pub struct Bucket {
    id: BucketId,

    /// Worker currently reducing this bucket.
    assigned_to: Option<WorkerID>,

    reduced: bool,
}

impl Bucket {
    fn new(id: BucketId) -> Self {
        Self {
            id,
            assigned_to: None,
            reduced: false,
        }
    }

    pub fn id(&self) -> BucketId {
        self.id
    }

    pub fn assigned_to(&self) -> Option<WorkerID> {
        self.assigned_to
    }

    pub fn is_reduced(&self) -> bool {
        self.reduced
    }
}

/// A job context.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,

    /// The current state of the job.
    state: JobState,

    started: bool,

    code: String,

    heartbeat_timeout: i64,

    acknowledge_timeout: i64,

    splits: Vec<Split>,

    buckets: Vec<Bucket>,
}

impl Job {
    pub fn new(id: JobId, config: JobConfig) -> Self {
        Self {
            id,
            state: JobState::Queued,
            started: false,
            code: config.code,
            heartbeat_timeout: config.heartbeat_timeout_ms,
            acknowledge_timeout: config.acknowledge_timeout_ms,
            splits: (0..config.map_tasks).map(Split::new).collect(),
            buckets: (0..config.reduce_tasks).map(Bucket::new).collect(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Get the state of the job.
    pub fn get_state(&self) -> JobState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.state == JobState::Finished
    }

    /// Started and not finished: workers get tasks.
    pub fn is_running(&self) -> bool {
        self.is_started() && !self.is_finished()
    }

    pub fn map_tasks(&self) -> u32 {
        self.splits.len() as u32
    }

    pub fn reduce_tasks(&self) -> u32 {
        self.buckets.len() as u32
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn heartbeat_timeout(&self) -> i64 {
        self.heartbeat_timeout
    }

    pub fn acknowledge_timeout(&self) -> i64 {
        self.acknowledge_timeout
    }

    /// The summary sent along with every assignment.
    pub fn summary(&self) -> JobSummary {
        JobSummary::new(self.id, self.map_tasks(), self.reduce_tasks(), self.code.clone())
    }

    /// Enter the map phase.
    pub fn start(&mut self) {
        self.started = true;
        self.state = JobState::Mapping;
        info!(
            "Job {} started with {} splits and {} buckets",
            self.id,
            self.map_tasks(),
            self.reduce_tasks()
        );
    }

    pub fn split(&self, id: SplitId) -> Option<&Split> {
        self.splits.get(id as usize)
    }

    pub fn bucket(&self, id: BucketId) -> Option<&Bucket> {
        self.buckets.get(id as usize)
    }

    /// What the worker is doing for this job.
    pub fn worker_state(&self, worker: WorkerID) -> WorkerState {
        if let Some(split) = self.splits.iter().find(|s| s.assigned_to == Some(worker)) {
            return WorkerState::Mapping(split.id);
        }
        if let Some(bucket) = self.buckets.iter().find(|b| b.assigned_to == Some(worker)) {
            return WorkerState::Reducing(bucket.id);
        }

        WorkerState::Free
    }

    /// Workers holding a split or bucket assignment.
    pub fn assigned_workers(&self) -> impl Iterator<Item = WorkerID> + '_ {
        self.splits
            .iter()
            .filter_map(Split::assigned_to)
            .chain(self.buckets.iter().filter_map(Bucket::assigned_to))
    }

    /// A split nobody holds and nobody is mapping.
    pub fn next_unassigned_split(&self) -> Option<SplitId> {
        self.splits
            .iter()
            .find(|s| !s.is_mapped() && s.assigned_to.is_none())
            .map(|s| s.id)
    }

    pub fn assign_split(&mut self, split: SplitId, worker: WorkerID) {
        if let Some(s) = self.splits.get_mut(split as usize) {
            debug!("Job {}: split {} -> worker {}", self.id, split, worker);
            s.assigned_to = Some(worker);
        }
    }

    /// Record that `worker` mapped `split`. False for an unknown split.
    pub fn complete_split(&mut self, split: SplitId, worker: WorkerID) -> bool {
        let Some(s) = self.splits.get_mut(split as usize) else {
            return false;
        };

        s.holders.insert(worker);
        if s.assigned_to == Some(worker) {
            s.assigned_to = None;
        }
        debug!("Job {}: split {} mapped by worker {}", self.id, split, worker);

        true
    }

    /// Workers that can serve the output of `split`.
    pub fn can_provide_split(&self, split: SplitId) -> impl Iterator<Item = WorkerID> + '_ {
        self.splits
            .get(split as usize)
            .into_iter()
            .flat_map(|s| s.holders())
    }

    pub fn all_splits_mapped(&self) -> bool {
        self.splits.iter().all(Split::is_mapped)
    }

    pub fn next_unassigned_bucket(&self) -> Option<BucketId> {
        self.buckets
            .iter()
            .find(|b| !b.reduced && b.assigned_to.is_none())
            .map(|b| b.id)
    }

    pub fn assign_bucket(&mut self, bucket: BucketId, worker: WorkerID) {
        if let Some(b) = self.buckets.get_mut(bucket as usize) {
            debug!("Job {}: bucket {} -> worker {}", self.id, bucket, worker);
            b.assigned_to = Some(worker);
        }
    }

    /// Record that `worker` reduced `bucket`. False for an unknown bucket.
    pub fn complete_bucket(&mut self, bucket: BucketId, worker: WorkerID) -> bool {
        let Some(b) = self.buckets.get_mut(bucket as usize) else {
            return false;
        };

        b.reduced = true;
        if b.assigned_to == Some(worker) {
            b.assigned_to = None;
        }
        debug!("Job {}: bucket {} reduced by worker {}", self.id, bucket, worker);

        true
    }

    pub fn all_buckets_reduced(&self) -> bool {
        self.buckets.iter().all(Bucket::is_reduced)
    }

    /// Forget everything tied to a worker that has left: its assignments go
    /// back to the pool and its map output is no longer available.
    ///
    /// Returns how many splits and buckets were affected.
    pub fn release_worker(&mut self, worker: WorkerID) -> usize {
        let mut released = self.reclaim_assignments(|w| w == worker);

        for split in self.splits.iter_mut() {
            if split.holders.remove(&worker) && split.holders.is_empty() {
                info!("Job {}: split {} lost its only holder {}", self.id, split.id, worker);
                released += 1;
            }
        }

        released
    }

    /// Return to the pool every assignment whose worker `is_gone`.
    pub fn reclaim_assignments(&mut self, mut is_gone: impl FnMut(WorkerID) -> bool) -> usize {
        let mut reclaimed = 0;

        for split in self.splits.iter_mut() {
            if let Some(worker) = split.assigned_to.filter(|w| is_gone(*w)) {
                info!("Job {}: reclaiming split {} from worker {}", self.id, split.id, worker);
                split.assigned_to = None;
                reclaimed += 1;
            }
        }
        for bucket in self.buckets.iter_mut() {
            if let Some(worker) = bucket.assigned_to.filter(|w| is_gone(*w)) {
                info!("Job {}: reclaiming bucket {} from worker {}", self.id, bucket.id, worker);
                bucket.assigned_to = None;
                reclaimed += 1;
            }
        }

        reclaimed
    }

    /// Move to the next phase if the current one is complete. Returns the new
    /// state if it changed.
    pub fn advance_state(&mut self) -> Option<JobState> {
        let before = self.state;

        loop {
            let next = match self.state {
                JobState::Mapping if self.all_splits_mapped() => JobState::Reducing,
                JobState::Reducing if self.all_buckets_reduced() => JobState::Finished,
                _ => break,
            };
            info!("Job {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }

        (self.state != before).then_some(self.state)
    }

    /// (mapped splits, reduced buckets)
    pub fn progress(&self) -> (usize, usize) {
        (
            self.splits.iter().filter(|s| s.is_mapped()).count(),
            self.buckets.iter().filter(|b| b.is_reduced()).count(),
        )
    }
}

/// Point in time view of a job, for callers outside the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub id: JobId,
    pub state: JobState,
    pub started: bool,
    pub map_tasks: u32,
    pub reduce_tasks: u32,
    pub splits_mapped: usize,
    pub buckets_reduced: usize,
}

impl From<&Job> for JobReport {
    fn from(job: &Job) -> Self {
        let (splits_mapped, buckets_reduced) = job.progress();

        Self {
            id: job.id,
            state: job.state,
            started: job.started,
            map_tasks: job.map_tasks(),
            reduce_tasks: job.reduce_tasks(),
            splits_mapped,
            buckets_reduced,
        }
    }
}

#[derive(Debug, Default)]
/// Job queue.
///
/// Jobs are kept in order to maintain history. At most one job, the one
/// before the current index, is active.
pub struct JobQueue {
    /// Job contexts.
    jobs: VecDeque<Job>,

    /// Index of the next job to start.
    current_index: usize,

    next_job_id: JobId,
}

impl JobQueue {
    pub fn new() -> Self {
        JobQueue::default()
    }

    /// The number of jobs which have been queued (including finished ones).
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.number_of_jobs_pending() == 0
    }

    /// Jobs not started yet.
    pub fn number_of_jobs_pending(&self) -> usize {
        self.len() - self.current_index
    }

    /// Create a job with a fresh ID and queue it.
    pub fn create_job(&mut self, config: JobConfig) -> JobId {
        let id = self.next_job_id;
        self.next_job_id += 1;
        self.push_job(Job::new(id, config));
        id
    }

    /// Push new job.
    pub fn push_job(&mut self, job: Job) {
        self.next_job_id = self.next_job_id.max(job.id() + 1);
        self.jobs.push_back(job);
    }

    /// Make the next queued job the active one.
    pub fn pop_job(&mut self) -> Option<&mut Job> {
        let index = self.current_index;
        if index >= self.jobs.len() {
            return None;
        }

        self.current_index += 1;
        self.jobs.get_mut(index)
    }

    /// Return the active job.
    pub fn peek_job(&self) -> Option<&Job> {
        self.current_index
            .checked_sub(1)
            .and_then(|index| self.jobs.get(index))
    }

    pub fn peek_job_mut(&mut self) -> Option<&mut Job> {
        self.current_index
            .checked_sub(1)
            .and_then(|index| self.jobs.get_mut(index))
    }

    pub fn get_job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id() == id)
    }

    /// Get the entries of all jobs.
    pub fn get_all_jobs(&self) -> &VecDeque<Job> {
        &self.jobs
    }
}
