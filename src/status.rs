use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::shutdown::ShutdownSignal;
use crate::supervisor::Supervisor;

#[derive(Serialize)]
struct StatusBody {
    #[serde(rename = "uptimeSec")]
    uptime_sec: u64,
    mode: &'static str,
    #[serde(rename = "bridgeId")]
    bridge_id: String,
    protocol: &'static str,
    #[serde(rename = "listenPort")]
    listen_port: u16,
    #[serde(rename = "remotePort")]
    remote_port: u16,
    #[serde(rename = "p2pConnections")]
    p2p_connections: u64,
    #[serde(rename = "tcpStreams")]
    tcp_streams: u64,
    #[serde(rename = "udpStreams")]
    udp_streams: u64,
    #[serde(rename = "bytesUp")]
    bytes_up: u64,
    #[serde(rename = "bytesDown")]
    bytes_down: u64,
    #[serde(rename = "connectedToHost")]
    connected_to_host: bool,
    #[serde(rename = "maxStreams")]
    max_streams: usize,
    kbps: u64,
}

struct StatusState {
    config: Config,
    supervisor: Arc<Supervisor>,
}

async fn get_status(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let metrics = &state.supervisor.metrics;
    let body = StatusBody {
        uptime_sec: metrics.uptime_secs(),
        mode: match state.config.role {
            crate::config::Role::Exposer => "exposer",
            crate::config::Role::Accessor => "accessor",
        },
        bridge_id: state.config.bridge_id.clone(),
        protocol: match state.config.protocol {
            crate::config::Protocol::Tcp => "tcp",
            crate::config::Protocol::Udp => "udp",
            crate::config::Protocol::Both => "both",
        },
        listen_port: state.config.listen_port,
        remote_port: state.config.exposed_port,
        p2p_connections: metrics.p2p_connections(),
        tcp_streams: metrics.tcp_streams(),
        udp_streams: metrics.udp_streams(),
        bytes_up: metrics.bytes_up(),
        bytes_down: metrics.bytes_down(),
        connected_to_host: metrics.connected_to_host(),
        max_streams: state.config.max_streams,
        kbps: state.config.kbps,
    };
    Json(body)
}

async fn not_found() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

/// Serves the read-only `/status` endpoint on loopback (spec.md §6). A no-op
/// if `config.status_port == 0`.
pub async fn serve(config: Config, supervisor: Arc<Supervisor>, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
    if config.status_port == 0 {
        return Ok(());
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], config.status_port));
    let state = Arc::new(StatusState { config, supervisor });

    let app = Router::new()
        .route("/status", get(get_status))
        .fallback(not_found)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(|err| {
            warn!(%err, "status endpoint terminated unexpectedly");
            err
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, Role};

    fn test_config() -> Config {
        Config {
            role: Role::Exposer,
            bridge_id: "alpha123".into(),
            protocol: Protocol::Tcp,
            exposed_port: 7001,
            listen_port: 17001,
            secret: String::new(),
            max_streams: 256,
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

    #[tokio::test]
    async fn status_body_reflects_metrics() {
        let config = test_config();
        let supervisor = Arc::new(Supervisor::new(&config));
        supervisor.metrics.inc_tcp_streams();
        supervisor.metrics.set_connected_to_host(true);

        let state = Arc::new(StatusState { config, supervisor });
        let response = get_status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
