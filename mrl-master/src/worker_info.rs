use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use common::clock::Clock;
use common::{BucketId, SplitId, DEAD};
use tracing::debug;

use crate::jobs::Job;
use crate::outbound::Outbound;

pub type WorkerVersion = u16;
pub type WorkerIndex = u16;

/// Connection identity of a worker.
///
/// The low 16 bits index a slot in the registry, the high 16 bits count how
/// many times that slot has been reused, so a stale ID never matches the
/// worker that took over its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerID(u32);

impl WorkerID {
    pub fn new(index: WorkerIndex, version: WorkerVersion) -> Self {
        WorkerID(((version as u32) << 16) | (index as u32))
    }

    pub fn index(self) -> WorkerIndex {
        self.0 as WorkerIndex
    }

    pub fn version(self) -> WorkerVersion {
        (self.0 >> 16) as WorkerVersion
    }

    fn next_version(self) -> Self {
        WorkerID::new(self.index(), self.version().wrapping_add(1))
    }
}

impl fmt::Display for WorkerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.version())
    }
}

#[derive(Debug)]
pub struct WorkerIDVendor {
    valid_workers: Vec<bool>,
    reusable_workers: Vec<WorkerID>,
    active_worker_version: Vec<WorkerVersion>,
}

impl Default for WorkerIDVendor {
    fn default() -> Self {
        Self {
            valid_workers: Vec::with_capacity(100),
            reusable_workers: Vec::with_capacity(100),
            active_worker_version: Vec::with_capacity(100),
        }
    }
}

impl WorkerIDVendor {
    pub fn new() -> Self {
        WorkerIDVendor::default()
    }

    /// Hand out an ID, reusing a released slot with a bumped version if
    /// there is one.
    pub fn create_worker(&mut self) -> WorkerID {
        if let Some(reusable) = self.reusable_workers.pop() {
            let id = reusable.next_version();
            let index = id.index() as usize;

            self.valid_workers[index] = true;
            self.active_worker_version[index] = id.version();

            id
        } else {
            let index = self.valid_workers.len() as WorkerIndex;
            self.valid_workers.push(true);
            self.active_worker_version.push(0);

            WorkerID::new(index, 0)
        }
    }

    /// Check whether the worker ID is valid.
    ///
    /// Worker ID is valid when the index is valid, and it
    /// is the most up-to-date version.
    pub fn worker_valid(&self, id: WorkerID) -> bool {
        let index = id.index() as usize;

        self.valid_workers.get(index).copied().unwrap_or(false)
            && self.active_worker_version[index] == id.version()
    }

    /// Invalidate the ID, allowing its slot to be reused with a new version.
    pub fn delete_worker(&mut self, id: WorkerID) {
        if !self.worker_valid(id) {
            return;
        }

        self.valid_workers[id.index() as usize] = false;
        self.reusable_workers.push(id);
    }
}

/// What a worker is doing for the active job.
#[derive(Debug, Clone, PartialEq, Copy)]
pub enum WorkerState {
    Free,
    Mapping(SplitId),
    Reducing(BucketId),
}

/// One connected worker.
///
/// Liveness timestamps are atomics so that [`Worker::disconnect`] takes
/// effect without the master's lock.
pub struct Worker {
    id: WorkerID,
    out: Arc<dyn Outbound>,
    clock: Arc<dyn Clock>,

    /// Last time anything was heard from the worker.
    last_heartbeat: AtomicI64,

    /// Last time the worker reported task progress.
    last_progress: AtomicI64,

    /// Where peers reach this worker, learnt from its messages.
    socket_url: Mutex<Option<String>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("last_heartbeat", &self.last_heartbeat())
            .field("last_progress", &self.last_progress())
            .field("socket_url", &self.socket_url())
            .finish()
    }
}

impl Worker {
    /// A worker starts out dead until its connection is up.
    pub fn new(id: WorkerID, out: Arc<dyn Outbound>, clock: Arc<dyn Clock>) -> Self {
        Self {
            id,
            out,
            clock,
            last_heartbeat: AtomicI64::new(DEAD),
            last_progress: AtomicI64::new(DEAD),
            socket_url: Mutex::new(None),
        }
    }

    pub fn id(&self) -> WorkerID {
        self.id
    }

    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.out
    }

    pub fn last_heartbeat(&self) -> i64 {
        self.last_heartbeat.load(Ordering::SeqCst)
    }

    pub fn last_progress(&self) -> i64 {
        self.last_progress.load(Ordering::SeqCst)
    }

    pub fn record_heartbeat(&self) {
        self.last_heartbeat.store(self.clock.now(), Ordering::SeqCst);
    }

    pub fn record_progress(&self) {
        self.last_progress.store(self.clock.now(), Ordering::SeqCst);
    }

    /// Both timestamps to now.
    pub fn mark_alive(&self) {
        let now = self.clock.now();
        self.last_heartbeat.store(now, Ordering::SeqCst);
        self.last_progress.store(now, Ordering::SeqCst);
    }

    /// Make sure nobody relies on this worker anymore.
    pub fn mark_dead(&self) {
        self.last_heartbeat.store(DEAD, Ordering::SeqCst);
        self.last_progress.store(DEAD, Ordering::SeqCst);
    }

    /// Mark dead, then close the connection.
    pub fn disconnect(&self) {
        self.mark_dead();
        debug!("Disconnecting worker {}", self.id);
        self.out.disconnect();
    }

    /// Alive and heard from within the job's heartbeat timeout.
    pub fn is_available(&self, job: &Job) -> bool {
        if self.is_dead(job) {
            return false;
        }

        self.clock.now() - self.last_heartbeat() < job.heartbeat_timeout()
    }

    /// No progress reported within the job's acknowledge timeout.
    pub fn is_dead(&self, job: &Job) -> bool {
        let last_progress = self.last_progress();

        last_progress == DEAD || self.clock.now() - last_progress > job.acknowledge_timeout()
    }

    pub fn set_socket_url(&self, url: String) {
        let mut socket_url = self.socket_url.lock().unwrap_or_else(PoisonError::into_inner);
        *socket_url = Some(url);
    }

    pub fn socket_url(&self) -> Option<String> {
        self.socket_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
