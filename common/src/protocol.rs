//! The JSON envelope exchanged between the master and its workers.
//!
//! ```text
//! { "type": "DO" | "ACK" | "HB", "payload": { "action": ..., ... } }
//! ```
//!
//! These types mirror the wire shape one to one. Every field is optional, and
//! the master reports what is missing itself rather than failing inside serde.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::{BucketId, JobId, SplitId};

pub const TYPE_DO: &str = "DO";
pub const TYPE_ACK: &str = "ACK";
pub const TYPE_HB: &str = "HB";

pub const ACTION_MAP_SPLIT: &str = "mapSplit";
pub const ACTION_REDUCE_BUCKET: &str = "reduceBucket";
pub const ACTION_REDUCE_CHUNK: &str = "reduceChunk";
pub const ACTION_IDLE: &str = "idle";

/// Top level frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<WireId>,

    /// Job summary. Only the master fills this in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_status: Option<MapStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_status: Option<ReduceStatus>,

    /// Peers the sender could not reach. Workers send either a list of URLs
    /// or an object keyed by URL, see [`Payload::unreachable_urls`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreachable: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_url: Option<String>,
}

impl Payload {
    /// Flatten the `unreachable` field into a list of URLs.
    ///
    /// Entries that are not strings are skipped. A field of any other shape
    /// is logged and treated as empty.
    pub fn unreachable_urls(&self) -> Vec<String> {
        let entries: Vec<&Value> = match &self.unreachable {
            None | Some(Value::Null) => return vec![],
            Some(Value::Array(items)) => items.iter().collect(),
            Some(Value::Object(map)) => {
                return map.keys().cloned().collect();
            }
            Some(other) => {
                error!("Unable to use unreachable field: {}", other);
                return vec![];
            }
        };

        entries
            .into_iter()
            .filter_map(|entry| match entry {
                Value::String(url) => Some(url.clone()),
                other => {
                    warn!("Skipping non-string unreachable entry: {}", other);
                    None
                }
            })
            .collect()
    }
}

/// A numeric identifier as sent by a worker: a JSON number or a numeric
/// string. The master always writes numbers. Any other value is kept so the
/// envelope still parses, and resolves to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Number(u64),
    Text(String),
    Other(Value),
}

impl WireId {
    /// The identifier, if it is a non-negative integer that fits.
    pub fn value(&self) -> Option<u32> {
        match self {
            WireId::Number(n) => u32::try_from(*n).ok(),
            WireId::Text(s) => s.trim().parse().ok(),
            WireId::Other(_) => None,
        }
    }
}

impl From<u32> for WireId {
    fn from(id: u32) -> Self {
        WireId::Number(id as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    #[serde(rename = "jobId")]
    pub job_id: WireId,

    #[serde(rename = "M", default)]
    pub map_tasks: u32,

    #[serde(rename = "R", default)]
    pub reduce_tasks: u32,

    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_id: Option<WireId>,
}

impl MapStatus {
    pub fn new(split: SplitId) -> Self {
        Self {
            split_id: Some(split.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReduceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<WireId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_id: Option<WireId>,

    /// Socket URLs of peers holding `split_id`. Outbound only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<String>>,
}

impl ReduceStatus {
    pub fn new(bucket: BucketId, split: Option<SplitId>, locations: Option<Vec<String>>) -> Self {
        Self {
            bucket_id: Some(bucket.into()),
            split_id: split.map(WireId::from),
            locations,
        }
    }
}

impl JobSummary {
    pub fn new(job_id: JobId, map_tasks: u32, reduce_tasks: u32, code: String) -> Self {
        Self {
            job_id: job_id.into(),
            map_tasks,
            reduce_tasks,
            code,
        }
    }
}
