mod test_harness;

use std::time::Duration;

use mrl_master::server;
use serde_json::Value;
use test_harness::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

async fn read_message<R>(lines: &mut tokio::io::Lines<R>) -> Value
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("no line from master")
        .unwrap()
        .expect("connection closed");

    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_worker_over_tcp() {
    let tm = TestMaster::new();
    let job = tm.start_job(job_config(1, 1)).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server::serve(listener, tm.master.clone(), shutdown.clone()));

    let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(format!("{}\n", ack_idle(job)).as_bytes())
        .await
        .unwrap();
    assert_eq!(split_of(&read_message(&mut lines).await), 0);

    // Garbage and blank lines are dropped without closing the connection.
    write_half.write_all(b"garbage\n\n").await.unwrap();
    write_half
        .write_all(format!("{}\n", ack_map(job, 0)).as_bytes())
        .await
        .unwrap();
    assert_eq!(bucket_of(&read_message(&mut lines).await), 0);
    assert_eq!(tm.worker_count().await, 1);

    drop(write_half);
    drop(lines);
    let master = tm.master.clone();
    assert!(
        wait_for(
            || {
                let master = master.clone();
                async move { master.lock().await.workers().count() == 0 }
            },
            Duration::from_secs(2),
        )
        .await,
        "worker was not deregistered after hanging up"
    );

    shutdown.cancel();
    server.await.unwrap();
}

#[tokio::test]
async fn test_master_closes_socket_on_disconnect() {
    let tm = TestMaster::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(listener, tm.master.clone(), shutdown.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = BufReader::new(stream).lines();

    let master = tm.master.clone();
    assert!(
        wait_for(
            || {
                let master = master.clone();
                async move { master.lock().await.workers().count() == 1 }
            },
            Duration::from_secs(2),
        )
        .await
    );

    let worker = tm.master.lock().await.workers().next().cloned().unwrap();
    worker.disconnect();

    let closed = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("socket stayed open");
    assert!(matches!(closed, Ok(None)));
    assert!(
        wait_for(
            || {
                let master = master.clone();
                async move { master.lock().await.workers().count() == 0 }
            },
            Duration::from_secs(2),
        )
        .await
    );

    shutdown.cancel();
}
