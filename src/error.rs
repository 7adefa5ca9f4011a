use thiserror::Error;

/// Top-level error taxonomy, following spec.md §7.
///
/// Each variant maps to one of the seven error classes; only the first three
/// are fatal to the process (they terminate `main` with a non-zero exit).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("startup probe failed: local {proto} service on port {port} is not reachable")]
    StartupProbe { proto: &'static str, port: u16 },

    #[error("discovery overlay failed fatally: {0}")]
    OverlayFatal(anyhow::Error),

    #[error("uncaught error: {0}")]
    Fatal(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("accessor role cannot use protocol=both")]
    AccessorProtocolBoth,
    #[error("maxStreams must be >= 1")]
    InvalidMaxStreams,
    #[error("bridgeId must not be empty")]
    EmptyBridgeId,
    #[error("invalid protocol value: {0}")]
    InvalidProtocol(String),
    #[error("invalid role value: {0}")]
    InvalidRole(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Link-level rejection, carried out of the handshake FSM (spec.md §4.4, §4.6).
///
/// `blocking` controls whether the peer-key is memoized in the rejected-peer
/// cache (spec.md §3 "Rejected-peer cache").
#[derive(Debug, Clone)]
pub struct RejectReason {
    pub reason: &'static str,
    pub blocking: bool,
}

impl RejectReason {
    pub fn blocking(reason: &'static str) -> Self {
        Self { reason, blocking: true }
    }

    pub fn non_blocking(reason: &'static str) -> Self {
        Self { reason, blocking: false }
    }
}

/// Stream-level error (spec.md §7 class 5): closes the affected substream(s)
/// only, never the owning link.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("local dial retries exhausted")]
    DialRetriesExhausted,
    #[error("stream budget exceeded")]
    BudgetExceeded,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mux error: {0}")]
    Mux(#[from] crate::mux::MuxError),
}

/// Returns true if the error message matches one of the benign, expected
/// disconnect diagnostics (spec.md §7.6), which are logged at `debug` unless
/// `--warnings` is set.
pub fn is_benign_disconnect(msg: &str) -> bool {
    const BENIGN: &[&str] = &[
        "reset by peer",
        "channel destroyed",
        "readable stream closed before ending",
        "ECONNRESET",
    ];
    BENIGN.iter().any(|needle| msg.contains(needle))
}
