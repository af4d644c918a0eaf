//! Ordered, per-owner message delivery.
//!
//! Each owner gets one tokio task draining its own FIFO. Owners never block
//! each other, and a slow or broken connection only stalls its own queue.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::outbound::{same_endpoint, Outbound};

struct Task {
    payload: String,
    destination: Arc<dyn Outbound>,

    /// Waited out right before sending.
    delay: Duration,
}

struct Pipeline {
    queue: Mutex<VecDeque<Task>>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Pipeline {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, task: Task) {
        self.queue().push_back(task);
        self.notify.notify_one();
    }

    fn shut(&self) {
        self.queue().clear();
        self.cancel.cancel();
    }
}

struct Pipelines<K> {
    running: Mutex<HashMap<K, Arc<Pipeline>>>,
}

/// Owner key to delivery task.
///
/// Lock order is the owner map first, then a pipeline's queue.
pub struct DeliveryRegistry<K> {
    inner: Arc<Pipelines<K>>,
}

impl<K> Default for DeliveryRegistry<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Pipelines {
                running: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl<K> DeliveryRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        DeliveryRegistry::default()
    }

    /// Queue `payload` for `destination` behind everything `owner` already
    /// has queued. Must be called within a tokio runtime.
    pub fn enqueue(
        &self,
        owner: K,
        payload: String,
        destination: Arc<dyn Outbound>,
        delay: Duration,
    ) {
        let mut running = self.inner.running();
        let pipeline = Pipelines::get_or_spawn(&self.inner, &mut running, owner);
        pipeline.push(Task {
            payload,
            destination,
            delay,
        });
    }

    /// Drop everything queued for `owner` and cancel its task.
    pub fn stop(&self, owner: &K) {
        if let Some(pipeline) = self.inner.running().remove(owner) {
            debug!("Stopping delivery for {:?}", owner);
            pipeline.shut();
        }
    }

    pub fn stop_all(&self) {
        let stopped: Vec<_> = self.inner.running().drain().collect();
        debug!("Stopping {} delivery pipelines", stopped.len());
        for (_, pipeline) in stopped {
            pipeline.shut();
        }
    }

    pub fn is_running(&self, owner: &K) -> bool {
        self.inner.running().contains_key(owner)
    }

    /// Tasks queued for `owner` that its task has not picked up yet.
    pub fn pending(&self, owner: &K) -> usize {
        self.inner
            .running()
            .get(owner)
            .map_or(0, |pipeline| pipeline.queue().len())
    }
}

impl<K> Pipelines<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn running(&self) -> MutexGuard<'_, HashMap<K, Arc<Pipeline>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_spawn(
        this: &Arc<Self>,
        running: &mut HashMap<K, Arc<Pipeline>>,
        owner: K,
    ) -> Arc<Pipeline> {
        running
            .entry(owner.clone())
            .or_insert_with(|| {
                debug!("Starting delivery for {:?}", owner);
                let pipeline = Pipeline::new();
                tokio::spawn(deliver(this.clone(), owner, pipeline.clone()));
                pipeline
            })
            .clone()
    }

    /// Tear down a pipeline whose send to `destination` failed.
    ///
    /// Everything else queued for that destination is dropped. Tasks for other
    /// destinations move to a fresh pipeline for the same owner.
    fn retire(
        this: &Arc<Self>,
        owner: &K,
        pipeline: &Arc<Pipeline>,
        destination: &Arc<dyn Outbound>,
    ) {
        let mut running = this.running();

        let (purged, leftovers): (Vec<Task>, Vec<Task>) = pipeline
            .queue()
            .drain(..)
            .partition(|task| same_endpoint(&task.destination, destination));
        pipeline.cancel.cancel();

        if running.get(owner).is_some_and(|p| Arc::ptr_eq(p, pipeline)) {
            running.remove(owner);
        }

        if !purged.is_empty() {
            warn!("Dropped {} queued messages for a broken connection", purged.len());
        }
        if !leftovers.is_empty() {
            debug!("Handing {} messages of {:?} to a new pipeline", leftovers.len(), owner);
            let fresh = Pipelines::get_or_spawn(this, &mut running, owner.clone());
            for task in leftovers {
                fresh.push(task);
            }
        }
        drop(running);

        destination.disconnect();
    }
}

async fn deliver<K>(pipelines: Arc<Pipelines<K>>, owner: K, pipeline: Arc<Pipeline>)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    loop {
        let next = pipeline.queue().pop_front();

        let Some(task) = next else {
            tokio::select! {
                _ = pipeline.cancel.cancelled() => return,
                _ = pipeline.notify.notified() => {}
            }
            continue;
        };

        if !task.delay.is_zero() {
            tokio::select! {
                _ = pipeline.cancel.cancelled() => return,
                _ = tokio::time::sleep(task.delay) => {}
            }
        }
        if pipeline.cancel.is_cancelled() {
            return;
        }

        if let Err(e) = task.destination.send_message(&task.payload) {
            error!("Delivery for {:?} failed: {}", owner, e);
            Pipelines::retire(&pipelines, &owner, &pipeline, &task.destination);
            return;
        }
    }
}
