use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::forwarder::throttle::TokenBucket;
use crate::mux::{MuxSession, Substream};
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{log_stream_error, StreamKind, Supervisor};

const COPY_CHUNK: usize = 16 * 1024;

/// TCP exposer forwarder (spec.md §4.5.1): for every substream the peer
/// opens, dial the local service with bounded retry and pipe bytes in both
/// directions, throttling only the socket→substream leg.
pub async fn run(mux: Arc<MuxSession>, config: Arc<Config>, supervisor: Arc<Supervisor>, mut shutdown: ShutdownSignal) {
    loop {
        let substream = tokio::select! {
            accepted = mux.accept() => match accepted {
                Ok(s) => s,
                Err(_) => return,
            },
            _ = shutdown.wait() => return,
        };

        if !supervisor.try_admit(StreamKind::Tcp) {
            drop(substream);
            continue;
        }

        let config = config.clone();
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            handle_stream(substream, config, supervisor.clone()).await;
            supervisor.release(StreamKind::Tcp);
        });
    }
}

async fn handle_stream(mut substream: Substream, config: Arc<Config>, supervisor: Arc<Supervisor>) {
    let mut attempts = 0;
    let socket = loop {
        match TcpStream::connect(("127.0.0.1", config.exposed_port)).await {
            Ok(socket) => break socket,
            Err(err) => {
                attempts += 1;
                if attempts >= config.tcp_connect_retries {
                    log_stream_error(&crate::error::StreamError::DialRetriesExhausted, config.expected_warnings);
                    let _ = substream.shutdown().await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(config.tcp_retry_delay_ms)).await;
                let _ = err; // retried
            }
        }
    };
    let _ = socket.set_nodelay(true);

    let (mut socket_rd, mut socket_wr) = socket.into_split();
    let (mut sub_rd, mut sub_wr) = tokio::io::split(substream);

    let metrics = &supervisor.metrics;
    let upstream = async {
        let mut buf = BytesMut::zeroed(COPY_CHUNK);
        loop {
            let n = match sub_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            metrics.add_bytes_down(n as u64);
            if socket_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = socket_wr.shutdown().await;
    };

    let downstream = async {
        let mut bucket = TokenBucket::new(config.kbps);
        let mut buf = BytesMut::zeroed(COPY_CHUNK);
        loop {
            let n = match socket_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            bucket.admit(n).await;
            metrics.add_bytes_up(n as u64);
            if sub_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = sub_wr.shutdown().await;
    };

    tokio::join!(upstream, downstream);
}
