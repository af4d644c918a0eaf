//! Shared building blocks for the MapReduce master and its workers.
//!
//! A master hands out map "splits" and reduce "buckets" to workers that come
//! and go over long lived connections. Everything both sides need to agree on
//! lives here: the time source used for liveness, the JSON envelope spoken on
//! the wire, and the byte ranges that make up each split of a dataset.

pub mod clock;
pub mod protocol;
pub mod split;

/////////////////////////////////////////////////////////////////////////////
// Identifiers
/////////////////////////////////////////////////////////////////////////////

/// Identifies a job. Allocated by the master when a job is queued.
pub type JobId = u32;

/// Identifies a map split, `0..M` for a job with `M` map tasks.
pub type SplitId = u32;

/// Identifies a reduce bucket, `0..R` for a job with `R` reduce tasks.
pub type BucketId = u32;

/// Timestamp value meaning "dead / unknown".
pub const DEAD: i64 = -1;
