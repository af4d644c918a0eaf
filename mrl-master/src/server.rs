//! Line-delimited JSON over TCP.
//!
//! Every connection is one worker. Each line read is one message; every
//! message the master sends is written as one line.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::Master;
use crate::outbound::ChannelOutbound;
use crate::session::WorkerSession;

/// Accept workers until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, master: Arc<Master>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Connection from {}", peer);
                tokio::spawn(handle_connection(stream, master.clone()));
            }
            Err(e) => warn!("Failed to accept connection: {}", e),
        }
    }

    info!("Stopped accepting workers");
}

async fn handle_connection(stream: TcpStream, master: Arc<Master>) {
    let (read_half, write_half) = stream.into_split();
    let (out, outgoing) = ChannelOutbound::new();
    let closed = out.closed().clone();

    let session = WorkerSession::open(master, out).await;
    session.on_connect().await;
    let id = session.worker().id();

    let writer = tokio::spawn(write_lines(write_half, outgoing, closed.clone()));

    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => match std::str::from_utf8(&line) {
                Ok(text) if text.trim().is_empty() => {}
                Ok(text) => session.on_message(text.trim()).await,
                Err(e) => warn!("Dropping line from worker {} that is not UTF-8: {}", id, e),
            },
            Err(e) => {
                warn!("Reading from worker {} failed: {}", id, e);
                break;
            }
        }
    }

    closed.cancel();
    let _ = writer.await;
    session.on_disconnect().await;
    debug!("Worker {} connection closed", id);
}

async fn write_lines(
    mut write_half: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = outgoing.recv() => next,
        };
        let Some(text) = next else {
            break;
        };

        let mut frame = text.into_bytes();
        frame.push(b'\n');
        if let Err(e) = write_half.write_all(&frame).await {
            warn!("Writing to worker failed: {}", e);
            break;
        }
    }

    closed.cancel();
    let _ = write_half.shutdown().await;
}
