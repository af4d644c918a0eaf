use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use common::clock::{Clock, MonotonicClock};
use mrl_master::args::Args;
use mrl_master::delivery::DeliveryRegistry;
use mrl_master::jobs::JobConfig;
use mrl_master::{server, Master, MasterError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Every line on stdin queues a job and tries to start it.
async fn read_console(master: Arc<Master>, config: JobConfig) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                error!("Reading console failed: {}", e);
                break;
            }
        }

        let id = master.queue_job(config.clone()).await;
        match master.start_next_job().await {
            Ok(started) => info!("Started job {}", started),
            Err(MasterError::JobAlreadyRunning(running)) => {
                warn!("Still running job {}, job {} stays queued", running, id)
            }
            Err(e) => error!("Could not start job {}: {}", id, e),
        }
    }

    debug!("Console closed");
}

async fn reap_dead_workers(master: Arc<Master>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let reclaimed = master.reap_dead_workers().await;
                if reclaimed > 0 {
                    info!("Reclaimed {} tasks from dead workers", reclaimed);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let code = match &args.code {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read job code from {}", path.display()))?,
        None => String::new(),
    };

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let delivery = Arc::new(DeliveryRegistry::new());
    let master = Arc::new(Master::new(clock, delivery.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Master listening on {}", addr);

    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(listener, master.clone(), shutdown.clone()));
    tokio::spawn(reap_dead_workers(
        master.clone(),
        Duration::from_millis(args.reap_interval_ms.max(1)),
        shutdown.clone(),
    ));
    tokio::spawn(read_console(master.clone(), args.job_config(code)));

    let result = signal::ctrl_c().await;
    shutdown.cancel();
    delivery.stop_all();

    match result {
        Ok(()) => {
            info!("Master exited...");
            Ok(())
        }
        Err(err) => {
            error!("Fatal error encountered {}", err);
            Err(err).context("Unable to listen for shutdown signal")
        }
    }
}
