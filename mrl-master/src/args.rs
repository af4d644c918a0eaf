use std::path::PathBuf;

use clap::Parser;

use crate::jobs::JobConfig;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The port for workers to connect to.
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Number of map splits per job.
    #[arg(short, long, default_value = "3")]
    pub map_tasks: u32,

    /// Number of reduce buckets per job.
    #[arg(short, long, default_value = "3")]
    pub reduce_tasks: u32,

    /// Workers not heard from for this long get no new work.
    #[arg(long, default_value = "60000")]
    pub heartbeat_timeout_ms: i64,

    /// Workers without progress for this long lose their work.
    #[arg(long, default_value = "3600000")]
    pub ack_timeout_ms: i64,

    /// File with the job code shipped to workers.
    #[arg(short, long)]
    pub code: Option<PathBuf>,

    /// How often to look for dead workers.
    #[arg(long, default_value = "5000")]
    pub reap_interval_ms: u64,
}

impl Args {
    /// Configuration for every job queued from the console.
    pub fn job_config(&self, code: String) -> JobConfig {
        JobConfig {
            map_tasks: self.map_tasks,
            reduce_tasks: self.reduce_tasks,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            acknowledge_timeout_ms: self.ack_timeout_ms,
            code,
        }
    }
}
