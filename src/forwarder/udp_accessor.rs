use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::warn;

use crate::config::Config;
use crate::forwarder::throttle::TokenBucket;
use crate::mux::MuxSession;
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{StreamKind, Supervisor};

const MAX_DATAGRAM: usize = 64 * 1024;

/// UDP accessor forwarder (spec.md §4.5.4). Opens exactly one substream on
/// handshake completion and binds one local UDP socket on `listenPort`.
///
/// Deviates from the literal spec text in one place: incoming substream
/// datagrams are replied to the most recently observed local client address
/// rather than back to `listenPort` itself, per the corrected behavior
/// spec.md §9 recommends (tracked as the remaining open question there).
pub async fn run(mux: Arc<MuxSession>, config: Arc<Config>, supervisor: Arc<Supervisor>, mut shutdown: ShutdownSignal) {
    if !supervisor.try_admit(StreamKind::Udp) {
        warn!("stream budget exceeded, accessor UDP flow not started");
        return;
    }

    let mut substream = match mux.open().await {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to open accessor UDP substream");
            supervisor.release(StreamKind::Udp);
            return;
        }
    };

    let socket = match UdpSocket::bind(("127.0.0.1", config.listen_port)).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(%err, port = config.listen_port, "failed to bind accessor UDP listener");
            supervisor.release(StreamKind::Udp);
            return;
        }
    };

    let mut last_peer: Option<SocketAddr> = None;
    let metrics = &supervisor.metrics;
    let mut bucket = TokenBucket::new(config.kbps);
    let mut recv_buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut recv_buf) => {
                match received {
                    Ok((n, from)) => {
                        last_peer = Some(from);
                        bucket.admit(n).await;
                        metrics.add_bytes_up(n as u64);
                        if substream.send_datagram(Bytes::copy_from_slice(&recv_buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            datagram = substream.recv_datagram() => {
                match datagram {
                    Some(payload) => {
                        if let Some(dest) = last_peer {
                            metrics.add_bytes_down(payload.len() as u64);
                            let _ = socket.send_to(&payload, dest).await;
                        }
                    }
                    None => break, // substream closed
                }
            }
            _ = shutdown.wait() => break,
        }
    }

    supervisor.metrics.set_connected_to_host(false);
    supervisor.release(StreamKind::Udp);
}
