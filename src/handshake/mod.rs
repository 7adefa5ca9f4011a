use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::Framed;
use tracing::warn;

use crate::codec::{HandshakeLine, Line, LineCodec, LineCodecError};
use crate::config::{Config, Protocol, Role};
use crate::error::RejectReason;
use crate::mux::MuxSession;
use crate::rejected_cache::RejectedPeerCache;
use crate::transport::BoxedChannel;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of one peer link's handshake (spec.md §4.4).
pub enum HandshakeOutcome {
    Ready { mux: MuxSession, protocol: Protocol },
    Rejected(RejectReason),
}

#[derive(Debug, Serialize, Deserialize)]
struct NegotiateRequest {
    protocol: String,
    #[serde(rename = "clientChal", skip_serializing_if = "Option::is_none")]
    client_chal: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NegotiateReply {
    protocol: String,
    #[serde(rename = "hostAuth", skip_serializing_if = "Option::is_none")]
    host_auth: Option<String>,
}

fn hmac_hex(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

fn random_nonce_hex() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Reads one line, bounded by a single overall `deadline` shared across every
/// read in the handshake (spec.md §4.4 Timeouts: "a single timer of
/// `handshakeTimeoutMs` arms at channel-connect" — not a fresh budget per
/// read, or a peer trickling one line just under the limit each time could
/// stretch the whole exchange to a multiple of `handshakeTimeoutMs`).
async fn read_line<T>(framed: &mut Framed<T, LineCodec>, deadline: Instant) -> Result<HandshakeLine, RejectReason>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    use futures::StreamExt;
    match timeout_at(deadline, framed.next()).await {
        Ok(Some(Ok(line))) => Ok(HandshakeLine::parse(line.as_str())),
        Ok(Some(Err(LineCodecError::TooLong))) => Err(RejectReason::non_blocking("handshake line too long")),
        Ok(Some(Err(_))) => Err(RejectReason::non_blocking("handshake line malformed")),
        Ok(None) => Err(RejectReason::non_blocking("channel closed during handshake")),
        Err(_) => Err(RejectReason::non_blocking("handshake timed out")),
    }
}

async fn write_line<T>(framed: &mut Framed<T, LineCodec>, line: impl Into<String>) -> Result<(), RejectReason>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    use futures::SinkExt;
    framed
        .send(Line(line.into()))
        .await
        .map_err(|_| RejectReason::non_blocking("write failed during handshake"))
}

/// Drives the exposer side of the FSM (spec.md §4.4 "States and transitions
/// on the exposer side").
pub async fn run_exposer(
    channel: BoxedChannel,
    config: &Config,
    peer_key: &str,
    rejected: &RejectedPeerCache,
) -> HandshakeOutcome {
    let deadline = Instant::now() + Duration::from_millis(config.handshake_timeout_ms);
    let mut framed = Framed::new(channel, LineCodec);

    if write_line(&mut framed, HandshakeLine::HelloExposer.to_string())
        .await
        .is_err()
    {
        return HandshakeOutcome::Rejected(RejectReason::non_blocking("write failed"));
    }

    let first = match read_line(&mut framed, deadline).await {
        Ok(line) => line,
        Err(reason) => return reject(reason, peer_key, rejected),
    };

    match first {
        HandshakeLine::HelloExposer => {
            reject(RejectReason::blocking("host-host conflict"), peer_key, rejected)
        }
        HandshakeLine::HelloAccessor => {
            if !config.secret.is_empty() {
                let nonce_hex = random_nonce_hex();
                if write_line(&mut framed, HandshakeLine::Challenge(nonce_hex.clone()).to_string())
                    .await
                    .is_err()
                {
                    return reject(RejectReason::non_blocking("write failed"), peer_key, rejected);
                }
                let reply = match read_line(&mut framed, deadline).await {
                    Ok(line) => line,
                    Err(reason) => return reject(reason, peer_key, rejected),
                };
                let expected = hmac_hex(&config.secret, nonce_hex.as_bytes());
                match reply {
                    HandshakeLine::Auth(h) if h == expected => {}
                    _ => return reject(RejectReason::non_blocking("auth failed"), peer_key, rejected),
                }
            }

            if write_line(&mut framed, HandshakeLine::Ok.to_string()).await.is_err() {
                return reject(RejectReason::non_blocking("write failed"), peer_key, rejected);
            }

            negotiate_exposer(framed, config, deadline, peer_key, rejected).await
        }
        _ => reject(RejectReason::non_blocking("unexpected line"), peer_key, rejected),
    }
}

async fn negotiate_exposer(
    mut framed: Framed<BoxedChannel, LineCodec>,
    config: &Config,
    deadline: Instant,
    peer_key: &str,
    rejected: &RejectedPeerCache,
) -> HandshakeOutcome {
    let negotiate_line = match read_line(&mut framed, deadline).await {
        Ok(line) => line,
        Err(reason) => return reject(reason, peer_key, rejected),
    };
    let HandshakeLine::Json(json) = negotiate_line else {
        return reject(RejectReason::non_blocking("expected negotiate JSON"), peer_key, rejected);
    };
    let request: NegotiateRequest = match serde_json::from_str(&json) {
        Ok(req) => req,
        Err(_) => return reject(RejectReason::non_blocking("malformed negotiate JSON"), peer_key, rejected),
    };
    let offered: Protocol = match request.protocol.parse() {
        Ok(p) => p,
        Err(_) => return reject(RejectReason::non_blocking("invalid protocol"), peer_key, rejected),
    };
    if !config.protocol.accepts(offered) {
        return reject(RejectReason::non_blocking("protocol mismatch"), peer_key, rejected);
    }

    let host_auth = match (&request.client_chal, config.secret.is_empty()) {
        (Some(client_chal), false) => Some(hmac_hex(&config.secret, client_chal.as_bytes())),
        _ => None,
    };
    let reply = NegotiateReply {
        protocol: request.protocol.clone(),
        host_auth,
    };
    let reply_json = serde_json::to_string(&reply).expect("reply serializes");
    if let Err(reason) = write_line(&mut framed, reply_json).await {
        return reject(reason, peer_key, rejected);
    }

    let channel = framed.into_inner();
    HandshakeOutcome::Ready {
        mux: MuxSession::new(channel, Role::Exposer),
        protocol: offered,
    }
}

/// Drives the accessor side of the FSM (spec.md §4.4 "States and transitions
/// on the accessor side").
pub async fn run_accessor(channel: BoxedChannel, config: &Config) -> HandshakeOutcome {
    let deadline = Instant::now() + Duration::from_millis(config.handshake_timeout_ms);
    let mut framed = Framed::new(channel, LineCodec);

    if write_line(&mut framed, HandshakeLine::HelloAccessor.to_string())
        .await
        .is_err()
    {
        return HandshakeOutcome::Rejected(RejectReason::non_blocking("write failed"));
    }

    let first = match read_line(&mut framed, deadline).await {
        Ok(line) => line,
        Err(reason) => return HandshakeOutcome::Rejected(reason),
    };

    match first {
        HandshakeLine::HelloAccessor => {
            HandshakeOutcome::Rejected(RejectReason::non_blocking("client-client conflict"))
        }
        HandshakeLine::HelloExposer => {
            let second = match read_line(&mut framed, deadline).await {
                Ok(line) => line,
                Err(reason) => return HandshakeOutcome::Rejected(reason),
            };

            if let HandshakeLine::Challenge(nonce_hex) = &second {
                if config.secret.is_empty() {
                    return HandshakeOutcome::Rejected(RejectReason::non_blocking("auth not configured"));
                }
                let auth = hmac_hex(&config.secret, nonce_hex.as_bytes());
                if write_line(&mut framed, HandshakeLine::Auth(auth).to_string())
                    .await
                    .is_err()
                {
                    return HandshakeOutcome::Rejected(RejectReason::non_blocking("write failed"));
                }
                // Consume the host's OK; its exact content is not re-validated.
                if let Err(reason) = read_line(&mut framed, deadline).await {
                    return HandshakeOutcome::Rejected(reason);
                }
            }

            negotiate_accessor(framed, config, deadline).await
        }
        _ => HandshakeOutcome::Rejected(RejectReason::non_blocking("unexpected line")),
    }
}

async fn negotiate_accessor(
    mut framed: Framed<BoxedChannel, LineCodec>,
    config: &Config,
    deadline: Instant,
) -> HandshakeOutcome {
    let protocol_str = match config.protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Both => unreachable!("Config::validate forbids accessor + protocol=both"),
    };
    let client_chal = if config.secret.is_empty() {
        None
    } else {
        Some(random_nonce_hex())
    };
    let request = NegotiateRequest {
        protocol: protocol_str.to_string(),
        client_chal: client_chal.clone(),
    };
    let request_json = serde_json::to_string(&request).expect("request serializes");
    if let Err(reason) = write_line(&mut framed, request_json).await {
        return HandshakeOutcome::Rejected(reason);
    }

    let reply_line = match read_line(&mut framed, deadline).await {
        Ok(line) => line,
        Err(reason) => return HandshakeOutcome::Rejected(reason),
    };
    let HandshakeLine::Json(json) = reply_line else {
        return HandshakeOutcome::Rejected(RejectReason::non_blocking("expected reply JSON"));
    };
    let reply: NegotiateReply = match serde_json::from_str(&json) {
        Ok(reply) => reply,
        Err(_) => return HandshakeOutcome::Rejected(RejectReason::non_blocking("malformed reply JSON")),
    };
    if reply.protocol != protocol_str {
        return HandshakeOutcome::Rejected(RejectReason::non_blocking("protocol mismatch"));
    }
    if let Some(client_chal) = &client_chal {
        let expected = hmac_hex(&config.secret, client_chal.as_bytes());
        if reply.host_auth.as_deref() != Some(expected.as_str()) {
            return HandshakeOutcome::Rejected(RejectReason::non_blocking("auth failed"));
        }
    }

    let channel = framed.into_inner();
    HandshakeOutcome::Ready {
        mux: MuxSession::new(channel, Role::Accessor),
        protocol: config.protocol,
    }
}

fn reject(reason: RejectReason, peer_key: &str, rejected: &RejectedPeerCache) -> HandshakeOutcome {
    warn!(reason = reason.reason, blocking = reason.blocking, peer = peer_key, "rejecting peer link");
    if reason.blocking {
        rejected.insert(peer_key.to_string());
    }
    HandshakeOutcome::Rejected(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role as ConfigRole;
    use tokio::io::duplex;

    fn base_config(role: ConfigRole, protocol: Protocol, secret: &str) -> Config {
        Config {
            role,
            bridge_id: "alpha123".into(),
            protocol,
            exposed_port: 7001,
            listen_port: 17001,
            secret: secret.to_string(),
            max_streams: 256,
            kbps: 0,
            tcp_connect_retries: 5,
            tcp_retry_delay_ms: 500,
            handshake_timeout_ms: 2_000,
            expected_warnings: false,
            verbose: false,
            json: false,
            status_port: 0,
        }
    }

    #[tokio::test]
    async fn reaches_ready_without_a_secret() {
        let (exposer_end, accessor_end) = duplex(8192);
        let rejected = RejectedPeerCache::new();
        let exposer_config = base_config(ConfigRole::Exposer, Protocol::Tcp, "");
        let accessor_config = base_config(ConfigRole::Accessor, Protocol::Tcp, "");

        let exposer_fut = run_exposer(Box::new(exposer_end), &exposer_config, "peer-a", &rejected);
        let accessor_fut = run_accessor(Box::new(accessor_end), &accessor_config);
        let (exposer_outcome, accessor_outcome) = tokio::join!(exposer_fut, accessor_fut);

        assert!(matches!(exposer_outcome, HandshakeOutcome::Ready { protocol: Protocol::Tcp, .. }));
        assert!(matches!(accessor_outcome, HandshakeOutcome::Ready { protocol: Protocol::Tcp, .. }));
    }

    #[tokio::test]
    async fn matching_secret_reaches_ready() {
        let (exposer_end, accessor_end) = duplex(8192);
        let rejected = RejectedPeerCache::new();
        let exposer_config = base_config(ConfigRole::Exposer, Protocol::Tcp, "s3cret");
        let accessor_config = base_config(ConfigRole::Accessor, Protocol::Tcp, "s3cret");

        let exposer_fut = run_exposer(Box::new(exposer_end), &exposer_config, "peer-a", &rejected);
        let accessor_fut = run_accessor(Box::new(accessor_end), &accessor_config);
        let (exposer_outcome, accessor_outcome) = tokio::join!(exposer_fut, accessor_fut);

        assert!(matches!(exposer_outcome, HandshakeOutcome::Ready { .. }));
        assert!(matches!(accessor_outcome, HandshakeOutcome::Ready { .. }));
    }

    #[tokio::test]
    async fn mismatched_secret_is_rejected() {
        let (exposer_end, accessor_end) = duplex(8192);
        let rejected = RejectedPeerCache::new();
        let exposer_config = base_config(ConfigRole::Exposer, Protocol::Tcp, "s3cret");
        let accessor_config = base_config(ConfigRole::Accessor, Protocol::Tcp, "wrong");

        let exposer_fut = run_exposer(Box::new(exposer_end), &exposer_config, "peer-a", &rejected);
        let accessor_fut = run_accessor(Box::new(accessor_end), &accessor_config);
        let (exposer_outcome, _accessor_outcome) = tokio::join!(exposer_fut, accessor_fut);

        assert!(matches!(exposer_outcome, HandshakeOutcome::Rejected(_)));
        assert!(!rejected.is_rejected("peer-a")); // auth failure is non-blocking
    }

    #[tokio::test]
    async fn exposer_conflict_is_blocking() {
        let (a_end, b_end) = duplex(8192);
        let rejected = RejectedPeerCache::new();
        let config_a = base_config(ConfigRole::Exposer, Protocol::Tcp, "");
        let config_b = base_config(ConfigRole::Exposer, Protocol::Tcp, "");

        let a_fut = run_exposer(Box::new(a_end), &config_a, "peer-a", &rejected);
        let b_fut = run_exposer(Box::new(b_end), &config_b, "peer-b", &rejected);
        let (a_outcome, _b_outcome) = tokio::join!(a_fut, b_fut);

        assert!(matches!(a_outcome, HandshakeOutcome::Rejected(_)));
        assert!(rejected.is_rejected("peer-a") || rejected.is_rejected("peer-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_line_shares_one_deadline_across_calls() {
        use tokio::io::AsyncWriteExt;

        let (mut writer, reader) = duplex(8192);
        let deadline = Instant::now() + Duration::from_millis(300);
        let mut framed = Framed::new(reader, LineCodec);

        tokio::time::advance(Duration::from_millis(100)).await;
        writer.write_all(b"HELLO:exposer\n").await.unwrap();
        let first = read_line(&mut framed, deadline).await.expect("first read");
        assert_eq!(first, HandshakeLine::HelloExposer);

        // A lone per-read budget would restart from here and easily make
        // this read; the shared deadline must not.
        tokio::time::advance(Duration::from_millis(250)).await;
        let second = read_line(&mut framed, deadline).await;
        assert!(second.is_err());
    }
}
