use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::warn;

use crate::config::Config;
use crate::forwarder::throttle::TokenBucket;
use crate::mux::MuxSession;
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{StreamKind, Supervisor};

const COPY_CHUNK: usize = 16 * 1024;

/// TCP accessor forwarder (spec.md §4.5.2): accept local connections on
/// `listenPort`, open one substream per connection, and pipe bytes through a
/// throttle on the local→substream leg.
pub async fn run(mux: Arc<MuxSession>, config: Arc<Config>, supervisor: Arc<Supervisor>, mut shutdown: ShutdownSignal) {
    let listener = match TcpListener::bind(("127.0.0.1", config.listen_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(%err, port = config.listen_port, "failed to bind accessor TCP listener");
            return;
        }
    };

    loop {
        let (socket, _peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "accept failed on accessor listener");
                    continue;
                }
            },
            _ = shutdown.wait() => return,
        };

        if !supervisor.try_admit(StreamKind::Tcp) {
            drop(socket); // refused at local accept, no tunnel resource allocated
            continue;
        }

        let mux = mux.clone();
        let config = config.clone();
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            handle_connection(socket, mux, config, supervisor.clone()).await;
            supervisor.release(StreamKind::Tcp);
        });
    }
}

async fn handle_connection(socket: tokio::net::TcpStream, mux: Arc<MuxSession>, config: Arc<Config>, supervisor: Arc<Supervisor>) {
    let _ = socket.set_nodelay(true);
    let substream = match mux.open().await {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to open substream for accepted connection");
            return;
        }
    };

    let (mut socket_rd, mut socket_wr) = socket.into_split();
    let (mut sub_rd, mut sub_wr) = tokio::io::split(substream);

    let metrics = &supervisor.metrics;
    let upstream = async {
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

    let downstream = async {
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

    tokio::join!(upstream, downstream);
}
