use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::config::{Config, Protocol};
use crate::error::{BridgeError, StreamError};
use crate::metrics::Metrics;
use crate::rejected_cache::RejectedPeerCache;
use crate::shutdown::Shutdown;

/// Which protocol a substream was admitted under, so `Supervisor::release`
/// can decrement the matching gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Udp,
}

/// Process-wide admission gate enforcing `tcpStreams + udpStreams +
/// |activeStreams| <= maxStreams` (spec.md §3 "Invariants"). Since every
/// admitted stream is counted exactly once, in exactly one of the two
/// gauges, the combined occupancy *is* `|activeStreams|`; a single counter
/// behind one lock makes the check-and-increment atomic.
struct Admission {
    occupied: usize,
    max: usize,
}

pub struct Supervisor {
    admission: Mutex<Admission>,
    pub metrics: Metrics,
    pub rejected: RejectedPeerCache,
    pub shutdown: Shutdown,
    reconnect_epoch: Arc<AtomicU64>,
    connected: AtomicBool,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            admission: Mutex::new(Admission {
                occupied: 0,
                max: config.max_streams,
            }),
            metrics: Metrics::default(),
            rejected: RejectedPeerCache::new(),
            shutdown: Shutdown::new(),
            reconnect_epoch: Arc::new(AtomicU64::new(0)),
            connected: AtomicBool::new(false),
        }
    }

    /// Accessor-only single-peer guard (spec.md §9: a second peer reaching
    /// `HELLO:exposer` while one is already connected is rejected with
    /// "already connected" rather than silently dropped). Separate from
    /// `Metrics.connected_to_host`, which is a status-reporting gauge only.
    pub fn try_claim_connected(&self) -> bool {
        self.connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release_connected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Atomic check-and-increment admission (spec.md §4.5.1/§4.5.2
    /// "Admission: if stream budget exceeded, destroy substream and
    /// return"). Returns false without side effects if the budget is full.
    pub fn try_admit(&self, kind: StreamKind) -> bool {
        let mut admission = self.admission.lock().expect("admission lock poisoned");
        if admission.occupied >= admission.max {
            return false;
        }
        admission.occupied += 1;
        drop(admission);
        match kind {
            StreamKind::Tcp => self.metrics.inc_tcp_streams(),
            StreamKind::Udp => self.metrics.inc_udp_streams(),
        }
        true
    }

    pub fn release(&self, kind: StreamKind) {
        let mut admission = self.admission.lock().expect("admission lock poisoned");
        admission.occupied = admission.occupied.saturating_sub(1);
        drop(admission);
        match kind {
            StreamKind::Tcp => self.metrics.dec_tcp_streams(),
            StreamKind::Udp => self.metrics.dec_udp_streams(),
        }
    }

    /// One-shot loopback dial performed before joining the overlay (spec.md
    /// §4.6: "if exposer and protocol includes TCP, perform a one-shot
    /// loopback TCP connect to `exposedPort`; fail fast if nothing
    /// listens").
    pub async fn run_startup_probe(config: &Config) -> Result<(), BridgeError> {
        if config.role != crate::config::Role::Exposer {
            return Ok(());
        }
        if !matches!(config.protocol, Protocol::Tcp | Protocol::Both) {
            return Ok(());
        }
        let addr = format!("127.0.0.1:{}", config.exposed_port);
        match TcpStream::connect(&addr).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(%err, port = config.exposed_port, "startup probe failed");
                Err(BridgeError::StartupProbe {
                    proto: "tcp",
                    port: config.exposed_port,
                })
            }
        }
    }

    /// Schedules exactly one rejoin 5s after an overlay `close` event,
    /// regardless of how many `close` events fire within that window
    /// (spec.md §8 "Idempotent rejoin"). Each call bumps an epoch counter;
    /// only the task holding the latest epoch actually rejoins.
    pub fn schedule_rejoin<F>(&self, rejoin: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let epoch = self.reconnect_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.reconnect_epoch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if current.load(Ordering::SeqCst) == epoch {
                rejoin();
            } else {
                info!("superseded rejoin timer fired, skipping");
            }
        });
    }
}

/// Logs a stream-level error, applying spec.md §7.6's benign-disconnect
/// suppression: benign diagnostics log at `debug` unless `expected_warnings`
/// (the `--warnings` flag) is set, in which case they're surfaced as `warn`
/// like any other stream error.
pub fn log_stream_error(err: &StreamError, expected_warnings: bool) {
    let msg = err.to_string();
    if crate::error::is_benign_disconnect(&msg) && !expected_warnings {
        tracing::debug!(%err, "benign stream disconnect");
    } else {
        warn!(%err, "stream error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;

    fn test_config(max_streams: usize) -> Config {
        Config {
            role: Role::Accessor,
            bridge_id: "alpha123".into(),
            protocol: Protocol::Tcp,
            exposed_port: 7001,
            listen_port: 17001,
            secret: String::new(),
            max_streams,
            kbps: 0,
            tcp_connect_retries: 5,
            tcp_retry_delay_ms: 500,
            handshake_timeout_ms: 10_000,
            expected_warnings: false,
            verbose: false,
            json: false,
            status_port: 0,
        }
    }

    #[test]
    fn admission_respects_max_streams() {
        let supervisor = Supervisor::new(&test_config(2));
        assert!(supervisor.try_admit(StreamKind::Tcp));
        assert!(supervisor.try_admit(StreamKind::Udp));
        assert!(!supervisor.try_admit(StreamKind::Tcp));

        supervisor.release(StreamKind::Tcp);
        assert!(supervisor.try_admit(StreamKind::Tcp));
    }

    #[test]
    fn metrics_track_admitted_streams() {
        let supervisor = Supervisor::new(&test_config(5));
        supervisor.try_admit(StreamKind::Tcp);
        supervisor.try_admit(StreamKind::Udp);
        assert_eq!(supervisor.metrics.tcp_streams(), 1);
        assert_eq!(supervisor.metrics.udp_streams(), 1);
        supervisor.release(StreamKind::Tcp);
        assert_eq!(supervisor.metrics.tcp_streams(), 0);
    }
}
