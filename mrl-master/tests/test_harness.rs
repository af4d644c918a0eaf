//! Drives a master through in-memory worker sessions.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::clock::ManualClock;
use common::JobId;
use mrl_master::delivery::DeliveryRegistry;
use mrl_master::jobs::JobConfig;
use mrl_master::outbound::ChannelOutbound;
use mrl_master::session::WorkerSession;
use mrl_master::worker_info::WorkerID;
use mrl_master::Master;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

pub const START: i64 = 1_000_000;

pub struct TestMaster {
    pub master: Arc<Master>,
    pub clock: Arc<ManualClock>,
    pub delivery: Arc<DeliveryRegistry<WorkerID>>,
}

impl TestMaster {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let delivery = Arc::new(DeliveryRegistry::new());
        let master = Arc::new(Master::new(clock.clone(), delivery.clone()));

        Self {
            master,
            clock,
            delivery,
        }
    }

    /// Queue a job and start it.
    pub async fn start_job(&self, config: JobConfig) -> JobId {
        self.master.queue_job(config).await;
        self.master.start_next_job().await.unwrap()
    }

    /// Open and connect a session, like the transport does on accept.
    pub async fn connect(&self) -> TestWorker {
        let (out, inbox) = ChannelOutbound::new();
        let session = WorkerSession::open(self.master.clone(), out.clone()).await;
        session.on_connect().await;

        TestWorker {
            session,
            out,
            inbox,
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.master.lock().await.workers().count()
    }
}

pub struct TestWorker {
    pub session: WorkerSession,
    pub out: Arc<ChannelOutbound>,
    pub inbox: UnboundedReceiver<String>,
}

impl TestWorker {
    pub fn id(&self) -> WorkerID {
        self.session.worker().id()
    }

    pub async fn send(&self, message: Value) {
        self.session.on_message(&message.to_string()).await;
    }

    /// Next message the master sent to this worker.
    pub async fn next(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
            .await
            .expect("no message from master")
            .expect("connection closed");

        serde_json::from_str(&text).unwrap()
    }

    /// Make sure nothing else is on its way.
    pub async fn assert_silent(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(text) = self.inbox.try_recv() {
            panic!("unexpected message: {}", text);
        }
    }
}

pub fn job_config(map_tasks: u32, reduce_tasks: u32) -> JobConfig {
    JobConfig {
        map_tasks,
        reduce_tasks,
        heartbeat_timeout_ms: 60_000,
        acknowledge_timeout_ms: 60_000 * 60,
        code: "function map(k, v) {}".to_string(),
    }
}

pub fn ack_idle(job: JobId) -> Value {
    json!({"type": "ACK", "payload": {"action": "idle", "jobId": job}})
}

pub fn ack_map(job: JobId, split: u32) -> Value {
    json!({"type": "ACK", "payload": {
        "action": "mapSplit",
        "jobId": job,
        "mapStatus": {"splitId": split},
    }})
}

pub fn ack_reduce(job: JobId, bucket: u32) -> Value {
    json!({"type": "ACK", "payload": {
        "action": "reduceBucket",
        "jobId": job,
        "reduceStatus": {"bucketId": bucket},
    }})
}

pub fn ask_chunk(job: JobId, bucket: u32, split: u32, unreachable: &[&str]) -> Value {
    json!({"type": "ACK", "payload": {
        "action": "reduceChunk",
        "jobId": job,
        "reduceStatus": {"bucketId": bucket, "splitId": split},
        "unreachable": unreachable,
    }})
}

pub fn heartbeat(job: JobId) -> Value {
    json!({"type": "HB", "payload": {"action": "idle", "jobId": job}})
}

pub fn with_url(mut message: Value, url: &str) -> Value {
    message["payload"]["interUrl"] = json!(url);
    message
}

pub fn action(message: &Value) -> &str {
    message["payload"]["action"].as_str().unwrap_or_default()
}

pub fn split_of(message: &Value) -> u64 {
    assert_eq!(action(message), "mapSplit", "{}", message);
    message["payload"]["mapStatus"]["splitId"].as_u64().unwrap()
}

pub fn bucket_of(message: &Value) -> u64 {
    assert_eq!(action(message), "reduceBucket", "{}", message);
    message["payload"]["reduceStatus"]["bucketId"].as_u64().unwrap()
}

pub fn locations_of(message: &Value) -> Vec<String> {
    assert_eq!(action(message), "reduceChunk", "{}", message);
    serde_json::from_value(message["payload"]["reduceStatus"]["locations"].clone()).unwrap()
}

pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}
