use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::clock::Clock;
use common::JobId;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::delivery::DeliveryRegistry;
use crate::error::{MasterError, Result};
use crate::jobs::{Job, JobConfig, JobQueue, JobReport, JobState};
use crate::message::{Action, Instruction, MasterContext, Message, ReduceStatus};
use crate::outbound::Outbound;
use crate::worker_info::{Worker, WorkerID, WorkerState};
use crate::worker_registry::WorkerRegistry;

/// What handling one worker message produced.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Answer for the worker that sent the message.
    pub reply: Option<Instruction>,

    /// Assignments for other idle workers.
    pub broadcast: Vec<(Arc<Worker>, Instruction)>,
}

/// Everything guarded by the master's lock.
#[derive(Debug, Default)]
pub struct MasterState {
    jobs: JobQueue,
    registry: WorkerRegistry,

    /// Where the next fan-out starts looking for idle workers.
    rr_cursor: usize,
}

/// The scheduler. Owns the jobs and the connected workers.
pub struct Master {
    state: Mutex<MasterState>,
    clock: Arc<dyn Clock>,
    delivery: Arc<DeliveryRegistry<WorkerID>>,
}

impl Master {
    pub fn new(clock: Arc<dyn Clock>, delivery: Arc<DeliveryRegistry<WorkerID>>) -> Self {
        Self {
            state: Mutex::new(MasterState::default()),
            clock,
            delivery,
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().await
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn delivery(&self) -> &Arc<DeliveryRegistry<WorkerID>> {
        &self.delivery
    }

    pub async fn queue_job(&self, config: JobConfig) -> JobId {
        let id = self.lock().await.jobs.create_job(config);
        info!("Queued job {}", id);
        id
    }

    /// Activate the next queued job and hand out its first splits.
    pub async fn start_next_job(&self) -> Result<JobId> {
        let (id, broadcast) = {
            let mut state = self.lock().await;

            if let Some(active) = state.jobs.peek_job().filter(|job| !job.is_finished()) {
                return Err(MasterError::JobAlreadyRunning(active.id()));
            }

            let job = state.jobs.pop_job().ok_or(MasterError::NoJobQueued)?;
            job.start();
            job.advance_state();
            let id = job.id();

            (id, state.dispatch_idle(None))
        };

        self.deliver(broadcast);
        Ok(id)
    }

    /// A worker for a fresh connection, not registered yet.
    pub async fn new_worker(&self, out: Arc<dyn Outbound>) -> Arc<Worker> {
        let id = self.lock().await.registry.allocate_id();
        Arc::new(Worker::new(id, out, self.clock.clone()))
    }

    pub async fn add_worker(&self, worker: Arc<Worker>) -> Result<()> {
        self.lock().await.registry.register_worker(worker)
    }

    /// Deregister a worker. Its assignments and map output go back to the
    /// pool and are handed to other idle workers.
    pub async fn remove_worker(&self, id: WorkerID) -> Result<()> {
        let broadcast = {
            let mut state = self.lock().await;
            state.registry.delete_worker(id)?;
            self.delivery.stop(&id);

            let released = state
                .running_job_mut()
                .map_or(0, |job| job.release_worker(id));

            if released > 0 {
                state.dispatch_idle(None)
            } else {
                Vec::new()
            }
        };

        self.deliver(broadcast);
        Ok(())
    }

    pub async fn active_job(&self) -> Option<JobReport> {
        self.lock().await.active_job().map(JobReport::from)
    }

    pub async fn job_report(&self, id: JobId) -> Option<JobReport> {
        self.lock().await.get_job_by_id(id).map(JobReport::from)
    }

    pub async fn worker_by_url(&self, url: &str) -> Option<Arc<Worker>> {
        self.lock().await.get_worker_by_url(url).cloned()
    }

    /// Take work back from workers that stopped reporting progress.
    pub async fn reap_dead_workers(&self) -> usize {
        let (reclaimed, broadcast) = {
            let mut state = self.lock().await;
            let reclaimed = state.reclaim_lost_work();
            let broadcast = if reclaimed > 0 {
                state.dispatch_idle(None)
            } else {
                Vec::new()
            };
            (reclaimed, broadcast)
        };

        self.deliver(broadcast);
        reclaimed
    }

    /// Queue instructions on each worker's delivery pipeline.
    pub fn deliver(&self, broadcast: Vec<(Arc<Worker>, Instruction)>) {
        for (worker, instruction) in broadcast {
            match instruction.encode() {
                Ok(payload) => {
                    debug!("Sending {} to worker {}", instruction, worker.id());
                    self.delivery.enqueue(
                        worker.id(),
                        payload,
                        worker.outbound().clone(),
                        Duration::ZERO,
                    );
                }
                Err(e) => error!("Dropping {} for worker {}: {}", instruction, worker.id(), e),
            }
        }
    }
}

impl MasterContext for MasterState {
    fn has_job(&self, id: JobId) -> bool {
        self.jobs.get_job(id).is_some()
    }

    fn worker_by_url(&self, url: &str) -> Option<WorkerID> {
        self.registry.get_worker_by_url(url).map(|worker| worker.id())
    }

    fn socket_url_of(&self, id: WorkerID) -> Option<String> {
        self.registry.get_worker(id).and_then(|worker| worker.socket_url())
    }
}

impl MasterState {
    /// The most recently started job, finished or not.
    pub fn active_job(&self) -> Option<&Job> {
        self.jobs.peek_job()
    }

    pub fn get_job_by_id(&self, id: JobId) -> Option<&Job> {
        self.jobs.get_job(id)
    }

    pub fn get_worker_by_url(&self, url: &str) -> Option<&Arc<Worker>> {
        self.registry.get_worker_by_url(url)
    }

    pub fn set_socket_url(&mut self, worker: &Worker, url: String) {
        self.registry.set_socket_url(worker, url);
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.registry.get_workers()
    }

    fn running_job(&self) -> Option<&Job> {
        self.jobs.peek_job().filter(|job| job.is_running())
    }

    fn running_job_mut(&mut self) -> Option<&mut Job> {
        self.jobs.peek_job_mut().filter(|job| job.is_running())
    }

    /// Apply a worker's report to the running job and pick its next task.
    ///
    /// Status for any job other than the running one is ignored. Work held
    /// by dead or departed workers is reclaimed first. If that, or a phase
    /// change, freed up work, idle workers get it through the broadcast.
    pub fn execute_worker_message(&mut self, worker: &Worker, message: &Message) -> Dispatch {
        let id = worker.id();
        let Some(active) = self.running_job().map(Job::id) else {
            return Dispatch::default();
        };

        let current = message.resolve_job(&*self) == Some(active);
        if !current && message.job.is_some() {
            debug!(
                "Worker {} reported on job {:?} while {} is running, ignoring status",
                id, message.job, active
            );
        }

        let reclaimed = self.reclaim_lost_work();

        if current && message.action == Action::ReduceChunk {
            if let Some(ReduceStatus {
                bucket: Some(bucket),
                split: Some(split),
            }) = message.reduce_status
            {
                let unreachable = message.resolve_unreachable(&*self);
                let reply = self.running_job().map(|job| {
                    Instruction::shuffle_location(bucket, split, job, &unreachable, &*self)
                });
                let broadcast = if reclaimed > 0 {
                    self.dispatch_idle(Some(id))
                } else {
                    Vec::new()
                };

                return Dispatch { reply, broadcast };
            }
        }

        let mut transitioned = false;
        if let Some(job) = self.running_job_mut() {
            if current {
                match (message.action, message.map_status, message.reduce_status) {
                    (Action::MapSplit, Some(split), _) => {
                        job.complete_split(split, id);
                    }
                    (
                        Action::ReduceBucket,
                        _,
                        Some(ReduceStatus {
                            bucket: Some(bucket),
                            ..
                        }),
                    ) => {
                        if job.get_state() == JobState::Reducing {
                            job.complete_bucket(bucket, id);
                        } else {
                            debug!("Worker {} reported bucket {} before reduce", id, bucket);
                        }
                    }
                    _ => {}
                }
            }
            transitioned = job.advance_state().is_some();
        }

        let reply = Some(self.next_task(id));
        let broadcast = if transitioned || reclaimed > 0 {
            self.dispatch_idle(Some(id))
        } else {
            Vec::new()
        };

        Dispatch { reply, broadcast }
    }

    /// The worker's current assignment, or a new one.
    ///
    /// Splits come first in both phases: during reduce, an unmapped split is
    /// one whose output was lost and has to be mapped again.
    fn next_task(&mut self, worker: WorkerID) -> Instruction {
        let Some(job) = self.running_job_mut() else {
            return Instruction::pause();
        };

        match job.worker_state(worker) {
            WorkerState::Mapping(split) => return Instruction::map_assignment(split, job),
            WorkerState::Reducing(bucket) => return Instruction::reduce_assignment(bucket, job),
            WorkerState::Free => {}
        }

        if let Some(split) = job.next_unassigned_split() {
            job.assign_split(split, worker);
            return Instruction::map_assignment(split, job);
        }

        if job.get_state() == JobState::Reducing {
            if let Some(bucket) = job.next_unassigned_bucket() {
                job.assign_bucket(bucket, worker);
                return Instruction::reduce_assignment(bucket, job);
            }
        }

        Instruction::pause()
    }

    /// Return to the pool assignments held by dead or deregistered workers.
    fn reclaim_lost_work(&mut self) -> usize {
        let registry = &self.registry;
        let Some(job) = self.jobs.peek_job_mut().filter(|job| job.is_running()) else {
            return 0;
        };

        let gone: BTreeSet<WorkerID> = {
            let job: &Job = job;
            job.assigned_workers()
                .filter(|id| {
                    registry
                        .get_worker(*id)
                        .map_or(true, |worker| worker.is_dead(job))
                })
                .collect()
        };

        if gone.is_empty() {
            return 0;
        }
        job.reclaim_assignments(|id| gone.contains(&id))
    }

    /// Give work to idle, available workers, starting at the round-robin
    /// cursor. Stops at the first worker that would only be told to pause.
    pub fn dispatch_idle(
        &mut self,
        except: Option<WorkerID>,
    ) -> Vec<(Arc<Worker>, Instruction)> {
        let workers: Vec<Arc<Worker>> = self.registry.get_workers().cloned().collect();
        let mut broadcast = Vec::new();
        if workers.is_empty() {
            return broadcast;
        }

        let start = self.rr_cursor % workers.len();
        for offset in 0..workers.len() {
            let position = (start + offset) % workers.len();
            let worker = &workers[position];
            if Some(worker.id()) == except {
                continue;
            }

            let idle = match self.running_job() {
                Some(job) => {
                    worker.is_available(job) && job.worker_state(worker.id()) == WorkerState::Free
                }
                None => break,
            };
            if !idle {
                continue;
            }

            let instruction = self.next_task(worker.id());
            if instruction == Instruction::Idle {
                break;
            }
            self.rr_cursor = position + 1;
            broadcast.push((worker.clone(), instruction));
        }

        broadcast
    }
}
