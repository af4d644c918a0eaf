//! Messages between the master and its workers.
//!
//! Inbound frames decode into a [`Message`] without touching any shared
//! state. The job and peer references it carries are resolved later, under
//! the master's lock, through a [`MasterContext`]. Outbound frames are built
//! as an [`Instruction`], which copies in everything it needs so it can be
//! encoded after the lock is released.

use std::collections::BTreeSet;
use std::fmt;

use common::protocol::{self, Envelope, JobSummary, Payload};
use common::{BucketId, JobId, SplitId};
use tracing::debug;

use crate::error::MessageError;
use crate::jobs::Job;
use crate::worker_info::WorkerID;

/// What a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Master to worker instruction.
    Do,
    /// Worker to master progress report.
    Ack,
    /// Worker to master heartbeat.
    Hb,
}

impl MessageType {
    fn parse(field: &str) -> Option<Self> {
        match field {
            protocol::TYPE_DO => Some(MessageType::Do),
            protocol::TYPE_ACK => Some(MessageType::Ack),
            protocol::TYPE_HB => Some(MessageType::Hb),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Do => protocol::TYPE_DO,
            MessageType::Ack => protocol::TYPE_ACK,
            MessageType::Hb => protocol::TYPE_HB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    MapSplit,
    ReduceBucket,
    ReduceChunk,
    Idle,
}

impl Action {
    fn parse(field: &str) -> Option<Self> {
        match field {
            protocol::ACTION_MAP_SPLIT => Some(Action::MapSplit),
            protocol::ACTION_REDUCE_BUCKET => Some(Action::ReduceBucket),
            protocol::ACTION_REDUCE_CHUNK => Some(Action::ReduceChunk),
            protocol::ACTION_IDLE => Some(Action::Idle),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::MapSplit => protocol::ACTION_MAP_SPLIT,
            Action::ReduceBucket => protocol::ACTION_REDUCE_BUCKET,
            Action::ReduceChunk => protocol::ACTION_REDUCE_CHUNK,
            Action::Idle => protocol::ACTION_IDLE,
        }
    }
}

/// Reduce progress as reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceStatus {
    pub bucket: Option<BucketId>,

    /// Set when the worker asks where to fetch this split's output.
    pub split: Option<SplitId>,
}

/// The lookups decoding needs from the master.
pub trait MasterContext {
    fn has_job(&self, id: JobId) -> bool;

    fn worker_by_url(&self, url: &str) -> Option<WorkerID>;

    fn socket_url_of(&self, id: WorkerID) -> Option<String>;
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub action: Action,

    /// Job the sender refers to, not yet checked against the master.
    pub job: Option<JobId>,

    /// Split the sender finished mapping.
    pub map_status: Option<SplitId>,

    pub reduce_status: Option<ReduceStatus>,

    /// Socket URLs of peers the sender could not reach.
    pub unreachable: Vec<String>,

    /// Where peers can reach the sender.
    pub inter_url: Option<String>,
}

impl Message {
    /// Parse one JSON frame.
    pub fn decode(raw: &str) -> Result<Message, MessageError> {
        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| MessageError::malformed(e.to_string(), raw))?;

        let payload = envelope
            .payload
            .ok_or_else(|| MessageError::malformed("No payload", raw))?;

        let type_field = envelope
            .kind
            .ok_or_else(|| MessageError::malformed("No type field", raw))?;
        let kind = MessageType::parse(&type_field).ok_or_else(|| {
            MessageError::malformed(format!("Message type '{}' not recognized", type_field), raw)
        })?;

        let action_field = payload
            .action
            .as_deref()
            .ok_or_else(|| MessageError::malformed("No action field in payload", raw))?;
        let action = Action::parse(action_field).ok_or_else(|| {
            MessageError::malformed(
                format!("Message action '{}' not recognized", action_field),
                raw,
            )
        })?;

        let job = match &payload.job_id {
            Some(id) => id.value(),
            None => payload.job.as_ref().and_then(|job| job.job_id.value()),
        };

        let map_status = payload
            .map_status
            .as_ref()
            .and_then(|status| status.split_id.as_ref())
            .and_then(|id| id.value());

        let reduce_status = payload.reduce_status.as_ref().map(|status| ReduceStatus {
            bucket: status.bucket_id.as_ref().and_then(|id| id.value()),
            split: status.split_id.as_ref().and_then(|id| id.value()),
        });

        Ok(Message {
            kind,
            action,
            job,
            map_status,
            reduce_status,
            unreachable: payload.unreachable_urls(),
            inter_url: payload.inter_url,
        })
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == MessageType::Hb
    }

    /// The referenced job, if the master knows it.
    pub fn resolve_job(&self, ctx: &impl MasterContext) -> Option<JobId> {
        self.job.filter(|id| ctx.has_job(*id))
    }

    /// Workers behind the unreachable URLs. Unknown URLs are skipped.
    pub fn resolve_unreachable(&self, ctx: &impl MasterContext) -> BTreeSet<WorkerID> {
        self.unreachable
            .iter()
            .filter_map(|url| {
                let worker = ctx.worker_by_url(url);
                if worker.is_none() {
                    debug!("Unreachable peer {} is not a known worker", url);
                }
                worker
            })
            .collect()
    }
}

/// A message from the master, one variant per intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Nothing to do for now.
    Idle,

    MapSplit {
        job: JobSummary,
        split: SplitId,
    },

    ReduceBucket {
        job: JobSummary,
        bucket: BucketId,
    },

    /// Where to fetch `split`'s output while reducing `bucket`.
    ReduceChunk {
        job: JobSummary,
        bucket: BucketId,
        split: SplitId,
        locations: Vec<String>,
    },
}

impl Instruction {
    /// Job-agnostic idle message.
    pub fn pause() -> Self {
        Instruction::Idle
    }

    pub fn map_assignment(split: SplitId, job: &Job) -> Self {
        Instruction::MapSplit {
            job: job.summary(),
            split,
        }
    }

    pub fn reduce_assignment(bucket: BucketId, job: &Job) -> Self {
        Instruction::ReduceBucket {
            job: job.summary(),
            bucket,
        }
    }

    /// Tell a reducer which peers hold `split`.
    ///
    /// Peers in `unreachable` and peers without a known socket URL are left
    /// out, even if they hold the split.
    pub fn shuffle_location(
        bucket: BucketId,
        split: SplitId,
        job: &Job,
        unreachable: &BTreeSet<WorkerID>,
        ctx: &impl MasterContext,
    ) -> Self {
        let locations = job
            .can_provide_split(split)
            .filter(|worker| !unreachable.contains(worker))
            .filter_map(|worker| ctx.socket_url_of(worker))
            .collect();

        Instruction::ReduceChunk {
            job: job.summary(),
            bucket,
            split,
            locations,
        }
    }

    pub fn kind(&self) -> MessageType {
        MessageType::Do
    }

    pub fn action(&self) -> Action {
        match self {
            Instruction::Idle => Action::Idle,
            Instruction::MapSplit { .. } => Action::MapSplit,
            Instruction::ReduceBucket { .. } => Action::ReduceBucket,
            Instruction::ReduceChunk { .. } => Action::ReduceChunk,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Instruction::Idle => None,
            Instruction::MapSplit { job, .. }
            | Instruction::ReduceBucket { job, .. }
            | Instruction::ReduceChunk { job, .. } => job.job_id.value(),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut payload = Payload {
            action: Some(self.action().as_str().to_string()),
            ..Default::default()
        };

        match self {
            Instruction::Idle => {}
            Instruction::MapSplit { job, split } => {
                payload.job = Some(job.clone());
                payload.map_status = Some(protocol::MapStatus::new(*split));
            }
            Instruction::ReduceBucket { job, bucket } => {
                payload.job = Some(job.clone());
                payload.reduce_status = Some(protocol::ReduceStatus::new(*bucket, None, None));
            }
            Instruction::ReduceChunk {
                job,
                bucket,
                split,
                locations,
            } => {
                payload.job = Some(job.clone());
                payload.reduce_status = Some(protocol::ReduceStatus::new(
                    *bucket,
                    Some(*split),
                    Some(locations.clone()),
                ));
            }
        }

        Envelope {
            kind: Some(self.kind().as_str().to_string()),
            payload: Some(payload),
        }
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(&self.to_envelope())?)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Idle => write!(f, "idle"),
            Instruction::MapSplit { split, .. } => write!(f, "map split {}", split),
            Instruction::ReduceBucket { bucket, .. } => write!(f, "reduce bucket {}", bucket),
            Instruction::ReduceChunk {
                bucket,
                split,
                locations,
                ..
            } => write!(
                f,
                "bucket {} fetch split {} from {} peers",
                bucket,
                split,
                locations.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobConfig;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Context {
        jobs: Vec<JobId>,
        urls: BTreeMap<WorkerID, String>,
    }

    impl MasterContext for Context {
        fn has_job(&self, id: JobId) -> bool {
            self.jobs.contains(&id)
        }

        fn worker_by_url(&self, url: &str) -> Option<WorkerID> {
            self.urls
                .iter()
                .find(|(_, known)| known.as_str() == url)
                .map(|(id, _)| *id)
        }

        fn socket_url_of(&self, id: WorkerID) -> Option<String> {
            self.urls.get(&id).cloned()
        }
    }

    fn w(index: u16) -> WorkerID {
        WorkerID::new(index, 0)
    }

    fn job() -> Job {
        let mut job = Job::new(
            7,
            JobConfig {
                map_tasks: 3,
                reduce_tasks: 2,
                heartbeat_timeout_ms: 60_000,
                acknowledge_timeout_ms: 3_600_000,
                code: "emit(k, v)".to_string(),
            },
        );
        job.start();
        job
    }

    fn malformed_reason(raw: &str) -> String {
        match Message::decode(raw) {
            Err(MessageError::Malformed { reason, raw: kept }) => {
                assert_eq!(kept, raw);
                reason
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn decodes_ack_with_statuses() {
        let raw = json!({
            "type": "ACK",
            "payload": {
                "action": "reduceChunk",
                "jobId": 7,
                "mapStatus": {"splitId": 2},
                "reduceStatus": {"bucketId": 1, "splitId": "0"},
                "interUrl": "ws://10.0.0.3:9000/bsmr",
            }
        })
        .to_string();

        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.kind, MessageType::Ack);
        assert_eq!(msg.action, Action::ReduceChunk);
        assert_eq!(msg.job, Some(7));
        assert_eq!(msg.map_status, Some(2));
        assert_eq!(
            msg.reduce_status,
            Some(ReduceStatus {
                bucket: Some(1),
                split: Some(0)
            })
        );
        assert_eq!(msg.inter_url.as_deref(), Some("ws://10.0.0.3:9000/bsmr"));
        assert!(msg.unreachable.is_empty());
    }

    #[test]
    fn malformed_frames_keep_raw_text() {
        assert!(malformed_reason("not json").contains("expected"));
        assert_eq!(malformed_reason(r#"{"type": "ACK"}"#), "No payload");
        assert_eq!(
            malformed_reason(r#"{"payload": {"action": "idle"}}"#),
            "No type field"
        );
        assert!(malformed_reason(r#"{"type": "UPL", "payload": {"action": "idle"}}"#)
            .contains("'UPL' not recognized"));
        assert_eq!(
            malformed_reason(r#"{"type": "HB", "payload": {}}"#),
            "No action field in payload"
        );
        assert!(malformed_reason(r#"{"type": "ACK", "payload": {"action": "mapTask"}}"#)
            .contains("'mapTask' not recognized"));
    }

    #[test]
    fn do_messages_decode() {
        let msg = Message::decode(r#"{"type": "DO", "payload": {"action": "idle"}}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Do);
        assert!(!msg.is_heartbeat());
    }

    #[test]
    fn unknown_job_resolves_to_none() {
        let ctx = Context {
            jobs: vec![7],
            ..Default::default()
        };
        let ack = |job: JobId| {
            json!({"type": "ACK", "payload": {"action": "idle", "jobId": job}}).to_string()
        };
        let known = Message::decode(&ack(7)).unwrap();
        let unknown = Message::decode(&ack(8)).unwrap();

        assert_eq!(known.resolve_job(&ctx), Some(7));
        assert_eq!(unknown.job, Some(8));
        assert_eq!(unknown.resolve_job(&ctx), None);
    }

    #[test]
    fn unusable_job_id_is_not_malformed() {
        let ctx = Context {
            jobs: vec![1],
            ..Default::default()
        };
        for raw in [
            r#"{"type":"ACK","payload":{"action":"idle","jobId":-1}}"#,
            r#"{"type":"ACK","payload":{"action":"idle","jobId":1.0}}"#,
            r#"{"type":"ACK","payload":{"action":"idle","job":{"jobId":true}}}"#,
        ] {
            let message = Message::decode(raw).unwrap();
            assert_eq!(message.job, None);
            assert_eq!(message.resolve_job(&ctx), None);
        }
    }

    #[test]
    fn unreachable_shapes_resolve_to_same_workers() {
        let mut ctx = Context::default();
        ctx.urls.insert(w(0), "ws://a:1/".into());
        ctx.urls.insert(w(1), "ws://b:2/".into());
        ctx.urls.insert(w(2), "ws://c:3/".into());

        let urls = ["ws://a:1/", "ws://c:3/", "ws://gone:4/"];
        let as_list = json!({"type": "ACK", "payload": {
            "action": "idle",
            "unreachable": urls.to_vec(),
        }});
        let as_map = json!({"type": "ACK", "payload": {"action": "idle", "unreachable": {
            "ws://a:1/": true, "ws://c:3/": true, "ws://gone:4/": true
        }}});
        let as_array = json!({"type": "ACK", "payload": {"action": "idle", "unreachable": [
            "ws://c:3/", 17, "ws://a:1/", "ws://gone:4/"
        ]}});

        let expected: BTreeSet<WorkerID> = [w(0), w(2)].into_iter().collect();
        for raw in [as_list, as_map, as_array] {
            let msg = Message::decode(&raw.to_string()).unwrap();
            assert_eq!(msg.resolve_unreachable(&ctx), expected);
        }
    }

    #[test]
    fn factories_round_trip() {
        let job = job();
        let mut ctx = Context::default();
        ctx.urls.insert(w(0), "ws://a:1/".into());

        let instructions = [
            Instruction::pause(),
            Instruction::map_assignment(2, &job),
            Instruction::reduce_assignment(1, &job),
            Instruction::shuffle_location(1, 0, &job, &BTreeSet::new(), &ctx),
        ];

        for instruction in instructions {
            let decoded = Message::decode(&instruction.encode().unwrap()).unwrap();

            assert_eq!(decoded.kind, instruction.kind());
            assert_eq!(decoded.action, instruction.action());
            assert_eq!(decoded.job, instruction.job_id());

            match &instruction {
                Instruction::Idle => {
                    assert_eq!(decoded.map_status, None);
                    assert_eq!(decoded.reduce_status, None);
                }
                Instruction::MapSplit { split, .. } => {
                    assert_eq!(decoded.map_status, Some(*split));
                    assert_eq!(decoded.reduce_status, None);
                }
                Instruction::ReduceBucket { bucket, .. } => {
                    assert_eq!(
                        decoded.reduce_status,
                        Some(ReduceStatus {
                            bucket: Some(*bucket),
                            split: None
                        })
                    );
                }
                Instruction::ReduceChunk { bucket, split, .. } => {
                    assert_eq!(
                        decoded.reduce_status,
                        Some(ReduceStatus {
                            bucket: Some(*bucket),
                            split: Some(*split)
                        })
                    );
                }
            }
        }
    }

    #[test]
    fn encoding_matches_wire_shape() {
        let job = job();
        let value: serde_json::Value =
            serde_json::from_str(&Instruction::map_assignment(1, &job).encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "DO",
                "payload": {
                    "action": "mapSplit",
                    "mapStatus": {"splitId": 1},
                    "job": {"jobId": 7, "M": 3, "R": 2, "code": "emit(k, v)"}
                }
            })
        );

        let idle: serde_json::Value =
            serde_json::from_str(&Instruction::pause().encode().unwrap()).unwrap();
        assert_eq!(idle, json!({"type": "DO", "payload": {"action": "idle"}}));
    }

    #[test]
    fn shuffle_skips_unreachable_and_urlless_holders() {
        let mut job = job();
        for index in 0..4 {
            job.complete_split(0, w(index));
        }
        job.complete_split(1, w(3));

        let mut ctx = Context::default();
        ctx.urls.insert(w(0), "ws://a:1/".into());
        ctx.urls.insert(w(1), "ws://b:2/".into());
        // w(2) never told us its URL.
        ctx.urls.insert(w(3), "ws://d:4/".into());

        let unreachable: BTreeSet<WorkerID> = [w(1)].into_iter().collect();
        let Instruction::ReduceChunk { locations, .. } =
            Instruction::shuffle_location(0, 0, &job, &unreachable, &ctx)
        else {
            panic!("expected reduceChunk");
        };
        assert_eq!(locations, vec!["ws://a:1/".to_string(), "ws://d:4/".to_string()]);

        let value: serde_json::Value = serde_json::from_str(
            &Instruction::shuffle_location(1, 0, &job, &unreachable, &ctx)
                .encode()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            value["payload"]["reduceStatus"],
            json!({"bucketId": 1, "splitId": 0, "locations": ["ws://a:1/", "ws://d:4/"]})
        );
    }
}
