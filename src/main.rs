mod cli;
mod codec;
mod config;
mod error;
mod forwarder;
mod handshake;
mod logging;
mod metrics;
mod mux;
mod rejected_cache;
mod shutdown;
mod status;
mod supervisor;
mod topic;
mod transport;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use libp2p::identity::Keypair;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::config::{Config, Role};
use crate::error::BridgeError;
use crate::handshake::HandshakeOutcome;
use crate::supervisor::Supervisor;
use crate::topic::Topic;
use crate::transport::{TransportAdapter, TransportEvent};

fn main() -> ExitCode {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    match rt.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), BridgeError> {
    let cli = Cli::parse();
    let config = cli.into_config()?;
    logging::init(&config);

    info!(role = ?config.role, bridge_id = %config.bridge_id, protocol = ?config.protocol, "starting natbridge");

    Supervisor::run_startup_probe(&config).await?;

    let config = Arc::new(config);
    let supervisor = Arc::new(Supervisor::new(&config));

    let status_task = tokio::spawn(status::serve(
        (*config).clone(),
        supervisor.clone(),
        supervisor.shutdown.to_signal(),
    ));

    let keypair = Keypair::generate_ed25519();
    let transport = Arc::new(
        TransportAdapter::new(keypair).map_err(BridgeError::OverlayFatal)?,
    );

    let topic = Topic::derive(&config.bridge_id);
    let announce = config.role == Role::Exposer;
    transport
        .join(topic, announce)
        .map_err(BridgeError::OverlayFatal)?;

    let ctrlc_supervisor = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            ctrlc_supervisor.shutdown.trigger();
        }
    });

    // Per-link tasks are tracked in a JoinSet rather than bare `tokio::spawn`
    // so a panicking link is observed and logged instead of silently leaking
    // (spec.md §9 supplemented: bounded task supervision).
    let mut link_tasks: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();

    let mut main_shutdown = supervisor.shutdown.to_signal();
    loop {
        tokio::select! {
            event = transport.next_event() => {
                match event {
                    Some(TransportEvent::Connection { peer, channel }) => {
                        if supervisor.rejected.is_rejected(&peer) {
                            debug_rejected(&peer);
                            continue;
                        }
                        supervisor.metrics.inc_p2p_connections();
                        link_tasks.spawn(link_future(peer, channel, config.clone(), supervisor.clone()));
                    }
                    Some(TransportEvent::Closed) => {
                        warn!("discovery overlay connection closed, scheduling rejoin");
                        supervisor.metrics.set_connected_to_host(false);
                        let transport = transport.clone();
                        supervisor.schedule_rejoin(move || {
                            if let Err(err) = transport.join(topic, announce) {
                                warn!(%err, "rejoin failed");
                            }
                        });
                    }
                    None => {
                        return Err(BridgeError::OverlayFatal(anyhow::anyhow!(
                            "discovery overlay driver task exited"
                        )));
                    }
                }
            }
            Some(result) = link_tasks.join_next(), if !link_tasks.is_empty() => {
                if let Err(err) = result {
                    if err.is_panic() {
                        error!(%err, "link task panicked");
                    }
                }
            }
            _ = main_shutdown.wait() => {
                info!("shutdown signal received, stopping");
                break;
            }
        }
    }

    drain_link_tasks(&mut link_tasks).await;
    status_task.abort();
    Ok(())
}

/// Graceful drain window (spec.md §5 "Cancellation", §8 scenario 7): give
/// in-flight links up to 3s to end their substreams on their own (each
/// forwarder's accept loop has already stopped admitting new streams once
/// the shutdown signal fired) before force-aborting whatever remains.
async fn drain_link_tasks(link_tasks: &mut tokio::task::JoinSet<()>) {
    const SWARM_DESTROY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);
    let drained = tokio::time::timeout(SWARM_DESTROY_TIMEOUT, async {
        while link_tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("graceful drain window elapsed, force-closing remaining links");
    }
    link_tasks.shutdown().await;
}

fn debug_rejected(peer: &str) {
    tracing::debug!(%peer, "dropping connection from previously-rejected peer");
}

async fn link_future(
    peer: String,
    channel: crate::transport::BoxedChannel,
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
) {
    let outcome = match config.role {
        Role::Exposer => handshake::run_exposer(channel, &config, &peer, &supervisor.rejected).await,
        Role::Accessor => handshake::run_accessor(channel, &config).await,
    };

    match outcome {
        HandshakeOutcome::Ready { mux, protocol } => {
            let mux = Arc::new(mux);
            let shutdown = supervisor.shutdown.to_signal();

            if config.role == Role::Accessor {
                if !supervisor.try_claim_connected() {
                    warn!(%peer, "rejecting additional peer: already connected to a host");
                    return;
                }
                supervisor.metrics.set_connected_to_host(true);
                forwarder::install(config.role, protocol, mux, config.clone(), supervisor.clone(), shutdown).await;
                supervisor.metrics.set_connected_to_host(false);
                supervisor.release_connected();
            } else {
                forwarder::install(config.role, protocol, mux, config.clone(), supervisor.clone(), shutdown).await;
            }
            // Link torn down; the overlay stays joined so a future peer can reconnect.
        }
        HandshakeOutcome::Rejected(_) => {}
    }
}
