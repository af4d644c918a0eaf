//! MapReduce master: hands out map splits and reduce buckets of one job at a
//! time to workers connected over long-lived sockets.

pub mod args;
pub mod core;
pub mod delivery;
pub mod error;
pub mod jobs;
pub mod message;
pub mod outbound;
pub mod server;
pub mod session;
pub mod worker_info;
pub mod worker_registry;

pub use crate::core::{Dispatch, Master, MasterState};
pub use crate::error::{MasterError, MessageError, TransportError};
