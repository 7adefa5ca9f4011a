use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counters and gauges (spec.md §3 "Metrics counters").
///
/// Only the forwarder and supervisor write to these; the status endpoint
/// (spec.md §6) only reads.
pub struct Metrics {
    start: Instant,
    p2p_connections: AtomicU64,
    tcp_streams: AtomicU64,
    udp_streams: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    connected_to_host: AtomicBool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            p2p_connections: AtomicU64::new(0),
            tcp_streams: AtomicU64::new(0),
            udp_streams: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            connected_to_host: AtomicBool::new(false),
        }
    }
}

impl Metrics {
    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn inc_p2p_connections(&self) {
        self.p2p_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tcp_streams(&self) {
        self.tcp_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_tcp_streams(&self) {
        self.tcp_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_udp_streams(&self) {
        self.udp_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_udp_streams(&self) {
        self.udp_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_connected_to_host(&self, connected: bool) {
        self.connected_to_host.store(connected, Ordering::Relaxed);
    }

    pub fn connected_to_host(&self) -> bool {
        self.connected_to_host.load(Ordering::Relaxed)
    }

    pub fn tcp_streams(&self) -> u64 {
        self.tcp_streams.load(Ordering::Relaxed)
    }

    pub fn udp_streams(&self) -> u64 {
        self.udp_streams.load(Ordering::Relaxed)
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn p2p_connections(&self) -> u64 {
        self.p2p_connections.load(Ordering::Relaxed)
    }
}
