use thiserror::Error;

use common::JobId;

use crate::worker_info::WorkerID;

/// Conflicts in the master's job or worker bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    #[error("Job {0} is still running")]
    JobAlreadyRunning(JobId),

    #[error("No job queued")]
    NoJobQueued,

    #[error("Worker {id} in illegal state: {reason}")]
    IllegalWorkerState { id: WorkerID, reason: &'static str },
}

/// A frame that could not be turned into a message.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed message ({reason}): {raw}")]
    Malformed { reason: String, raw: String },

    #[error("Could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl MessageError {
    pub(crate) fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        MessageError::Malformed {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

/// Sending on a connection failed. Fatal for that connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, MasterError>;
