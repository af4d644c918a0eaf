use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::core::Master;
use crate::jobs::Job;
use crate::message::{Message, MessageType};
use crate::outbound::Outbound;
use crate::worker_info::Worker;

/// One worker connection, as seen by the master.
///
/// The transport calls these hooks in order: [`WorkerSession::on_connect`]
/// once, then any number of messages, then [`WorkerSession::on_disconnect`].
pub struct WorkerSession {
    master: Arc<Master>,
    worker: Arc<Worker>,
}

impl WorkerSession {
    pub async fn open(master: Arc<Master>, out: Arc<dyn Outbound>) -> Self {
        let worker = master.new_worker(out).await;
        Self { master, worker }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub async fn on_connect(&self) {
        self.master.clock().mark_time();
        self.worker.mark_alive();

        if let Err(e) = self.master.add_worker(self.worker.clone()).await {
            error!("Could not register worker {}: {}", self.worker.id(), e);
            self.worker.disconnect();
        }
    }

    pub async fn on_disconnect(&self) {
        self.master.clock().mark_time();
        self.worker.mark_dead();

        if let Err(e) = self.master.remove_worker(self.worker.id()).await {
            warn!("Could not deregister worker {}: {}", self.worker.id(), e);
        }
    }

    /// Handle one text frame and answer it if there is something to say.
    pub async fn on_message(&self, raw: &str) {
        self.master.clock().mark_time();
        let id = self.worker.id();

        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Worker {}: {}", id, e);
                return;
            }
        };

        if message.kind == MessageType::Do {
            error!("Worker {} sent a DO message, dropping it: {}", id, raw);
            return;
        }

        let dispatch = {
            let mut state = self.master.lock().await;

            if let Some(url) = &message.inter_url {
                state.set_socket_url(&self.worker, url.clone());
            }

            if !state.active_job().is_some_and(Job::is_running) {
                self.worker.record_heartbeat();
                if message.is_heartbeat() {
                    warn!("Heartbeat from worker {} but no job is running", id);
                } else {
                    self.worker.record_progress();
                }
                return;
            }

            self.worker.record_heartbeat();
            if message.is_heartbeat() {
                trace!("Heartbeat from worker {}", id);
                return;
            }

            self.worker.record_progress();
            state.execute_worker_message(&self.worker, &message)
        };

        self.master.deliver(dispatch.broadcast);

        let Some(reply) = dispatch.reply else {
            return;
        };
        let text = match reply.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Could not encode reply for worker {}: {}", id, e);
                return;
            }
        };

        debug!("Replying {} to worker {}", reply, id);
        if let Err(e) = self.worker.outbound().send_message(&text) {
            error!("Reply to worker {} failed: {}", id, e);
            if let Err(e) = self.master.remove_worker(id).await {
                warn!("Could not deregister worker {}: {}", id, e);
            }
            self.worker.disconnect();
        }
    }

    /// Workers only ever send text.
    pub fn on_binary(&self, frame: &[u8]) -> ! {
        error!(
            "Worker {} sent a {} byte binary frame",
            self.worker.id(),
            frame.len()
        );
        panic!("binary frames are not part of the worker protocol");
    }

    /// Force the connection closed. The transport reports back through
    /// [`WorkerSession::on_disconnect`].
    pub fn disconnect(&self) {
        self.worker.disconnect();
    }
}
