use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{MasterError, Result};
use crate::worker_info::*;

/// Registry for workers.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    /// Internal vendor for managing worker ID.
    worker_vendor: WorkerIDVendor,

    /// Registered workers, indexed by the slot of their ID.
    worker_list: Vec<Option<Arc<Worker>>>,

    /// Socket URL to worker, for resolving peers named in messages.
    by_url: HashMap<String, WorkerID>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry::default()
    }

    /// Reserve an ID for a connection that is about to register.
    pub fn allocate_id(&mut self) -> WorkerID {
        self.worker_vendor.create_worker()
    }

    /// Add a worker under the ID it was created with.
    pub fn register_worker(&mut self, worker: Arc<Worker>) -> Result<()> {
        let id = worker.id();

        if !self.worker_vendor.worker_valid(id) {
            return Err(MasterError::IllegalWorkerState {
                id,
                reason: "worker ID is not current",
            });
        }

        let index = id.index() as usize;
        if index >= self.worker_list.len() {
            self.worker_list.resize(index + 1, None);
        }

        let slot = &mut self.worker_list[index];
        if slot.is_some() {
            return Err(MasterError::IllegalWorkerState {
                id,
                reason: "worker already registered",
            });
        }

        if let Some(url) = worker.socket_url() {
            self.by_url.insert(url, id);
        }
        *slot = Some(worker);
        info!("Worker {} registered ({} total)", id, self.len());

        Ok(())
    }

    /// Remove a worker from the registry and release its ID.
    pub fn delete_worker(&mut self, id: WorkerID) -> Result<Arc<Worker>> {
        let worker = match self.worker_list.get_mut(id.index() as usize) {
            Some(slot) if slot.as_ref().is_some_and(|worker| worker.id() == id) => slot.take(),
            _ => None,
        }
        .ok_or(MasterError::IllegalWorkerState {
            id,
            reason: "worker not registered",
        })?;

        self.by_url.retain(|_, owner| *owner != id);
        self.worker_vendor.delete_worker(id);
        info!("Worker {} removed ({} left)", id, self.len());

        Ok(worker)
    }

    /// Record where a worker can be reached, replacing any previous URL.
    pub fn set_socket_url(&mut self, worker: &Worker, url: String) {
        let id = worker.id();
        if worker.socket_url().as_deref() != Some(url.as_str()) {
            debug!("Worker {} reachable at {}", id, url);
            self.by_url.retain(|_, owner| *owner != id);
        }

        if self.get_worker(id).is_some() {
            self.by_url.insert(url.clone(), id);
        }
        worker.set_socket_url(url);
    }

    /// Size of the worker registry.
    pub fn len(&self) -> usize {
        self.get_workers().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered workers in ID slot order.
    pub fn get_workers(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.worker_list.iter().flatten()
    }

    pub fn get_worker(&self, id: WorkerID) -> Option<&Arc<Worker>> {
        self.worker_list
            .get(id.index() as usize)
            .and_then(|slot| slot.as_ref())
            .filter(|worker| worker.id() == id)
    }

    pub fn get_worker_by_url(&self, url: &str) -> Option<&Arc<Worker>> {
        self.by_url.get(url).and_then(|id| self.get_worker(*id))
    }
}
