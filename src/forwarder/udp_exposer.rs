use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::warn;

use crate::config::Config;
use crate::forwarder::throttle::TokenBucket;
use crate::mux::{MuxSession, Substream};
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{StreamKind, Supervisor};

const MAX_DATAGRAM: usize = 64 * 1024;

/// UDP exposer forwarder (spec.md §4.5.3): each inbound substream gets its
/// own ephemeral loopback UDP socket. One substream write == one datagram,
/// both ways; no framing beyond the mux's own frame boundaries.
pub async fn run(mux: Arc<MuxSession>, config: Arc<Config>, supervisor: Arc<Supervisor>, mut shutdown: ShutdownSignal) {
    loop {
        let substream = tokio::select! {
            accepted = mux.accept() => match accepted {
                Ok(s) => s,
                Err(_) => return,
            },
            _ = shutdown.wait() => return,
        };

        if !supervisor.try_admit(StreamKind::Udp) {
            drop(substream);
            continue;
        }

        let config = config.clone();
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            handle_flow(substream, config, supervisor.clone()).await;
            supervisor.release(StreamKind::Udp);
        });
    }
}

async fn handle_flow(mut substream: Substream, config: Arc<Config>, supervisor: Arc<Supervisor>) {
    let socket = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(%err, "failed to bind ephemeral UDP socket for exposer flow");
            return;
        }
    };
    if let Err(err) = socket.connect(("127.0.0.1", config.exposed_port)).await {
        warn!(%err, port = config.exposed_port, "failed to connect ephemeral UDP socket");
        return;
    }

    let metrics = &supervisor.metrics;
    let mut bucket = TokenBucket::new(config.kbps);
    let mut recv_buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            datagram = substream.recv_datagram() => {
                match datagram {
                    Some(payload) => {
                        bucket.admit(payload.len()).await;
                        metrics.add_bytes_down(payload.len() as u64);
                        if socket.send(&payload).await.is_err() {
                            break;
                        }
                    }
                    None => break, // substream closed
                }
            }
            received = socket.recv(&mut recv_buf) => {
                match received {
                    Ok(n) => {
                        metrics.add_bytes_up(n as u64);
                        if substream.send_datagram(Bytes::copy_from_slice(&recv_buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}
