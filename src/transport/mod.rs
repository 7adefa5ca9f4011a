use std::time::Duration;

use futures::StreamExt;
use libp2p::kad::store::MemoryStore;
use libp2p::kad::{self, GetProvidersOk, QueryResult};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, noise, ping, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_stream as stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};

use crate::topic::Topic;

/// Protocol name negotiated for the single per-peer substream that carries
/// the handshake and, afterwards, mux frames (spec.md §1: "a bidirectional
/// reliable byte-oriented authenticated channel per peer").
const PROTOCOL: StreamProtocol = StreamProtocol::new("/nat-bridge/1.0.0");

/// Stand-in for the spec's "remote address:port" peer-key (spec.md §3
/// "Peer link"): libp2p identifies peers by `PeerId`, not socket address, so
/// the rejected-peer cache and link bookkeeping key on this instead.
pub type PeerKey = String;

/// The raw per-peer channel handed to the handshake FSM. Boxed because the
/// concrete `libp2p_stream::Stream` type is opaque to callers above this
/// module.
pub type BoxedChannel = Box<dyn AsyncReadWrite>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

#[derive(NetworkBehaviour)]
struct Behaviour {
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    stream: stream::Behaviour,
    /// Keeps long-idle forwarding sessions (no substream traffic for
    /// `idle_connection_timeout`) from being reaped by the swarm.
    ping: ping::Behaviour,
}

pub enum TransportEvent {
    Connection { peer: PeerKey, channel: BoxedChannel },
    Closed,
}

enum Command {
    Join { topic: Topic, announce: bool },
    Close,
}

/// Thin contract around the discovery/transport library (spec.md §4.1).
/// Exposer publishes a Kademlia provider record under the bridge topic and
/// accepts inbound `/nat-bridge/1.0.0` streams; accessor looks up providers
/// and dials one stream per candidate.
pub struct TransportAdapter {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl TransportAdapter {
    pub fn new(keypair: libp2p::identity::Keypair) -> anyhow::Result<Self> {
        let local_peer_id = PeerId::from(keypair.public());
        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| {
                let kad_config = kad::Config::default();
                let kad = kad::Behaviour::with_config(
                    local_peer_id,
                    MemoryStore::new(local_peer_id),
                    kad_config,
                );
                let identify = identify::Behaviour::new(identify::Config::new(
                    "/nat-bridge/id/1.0.0".to_string(),
                    key.public(),
                ));
                let stream = stream::Behaviour::new();
                let ping = ping::Behaviour::default();
                Ok(Behaviour { kad, identify, stream, ping })
            })?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        swarm.listen_on("/ip4/0.0.0.0/tcp/0".parse::<Multiaddr>()?)?;

        let mut control = swarm.behaviour().stream.new_control();
        let incoming = control
            .accept(PROTOCOL)
            .map_err(|err| anyhow::anyhow!("protocol already registered: {err:?}"))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(driver_loop(swarm, control, incoming, cmd_rx, event_tx));

        Ok(Self {
            cmd_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
        })
    }

    /// Enters the overlay for `topic`. `announce=true` (exposer) starts
    /// providing; `announce=false` (accessor) performs a one-shot lookup.
    pub fn join(&self, topic: Topic, announce: bool) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::Join { topic, announce })
            .map_err(|_| anyhow::anyhow!("transport driver task has exited"))
    }

    pub fn close(&self) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::Close)
            .map_err(|_| anyhow::anyhow!("transport driver task has exited"))
    }

    pub async fn next_event(&self) -> Option<TransportEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }
}

async fn driver_loop(
    mut swarm: Swarm<Behaviour>,
    mut control: stream::Control,
    mut incoming: stream::IncomingStreams,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        tokio::select! {
            event = swarm.select_next_some() => handle_swarm_event(event, &mut control, &event_tx),
            inbound = incoming.next() => {
                match inbound {
                    Some((peer, channel)) => {
                        debug!(%peer, "accepted inbound substream");
                        let _ = event_tx.send(TransportEvent::Connection {
                            peer: peer.to_string(),
                            channel: Box::new(channel.compat()),
                        });
                    }
                    None => {
                        warn!("inbound substream listener ended");
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Join { topic, announce }) => {
                        let key = kad::RecordKey::new(&topic.as_bytes().to_vec());
                        if announce {
                            if let Err(err) = swarm.behaviour_mut().kad.start_providing(key) {
                                warn!(%err, "failed to start providing bridge topic");
                            }
                        } else {
                            swarm.behaviour_mut().kad.get_providers(key);
                        }
                    }
                    Some(Command::Close) => {
                        info!("transport adapter closing");
                        let _ = event_tx.send(TransportEvent::Closed);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

fn handle_swarm_event(
    event: SwarmEvent<BehaviourEvent>,
    control: &mut stream::Control,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) {
    match event {
        SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
            result: QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })),
            ..
        })) => {
            for peer in providers {
                let mut control = control.clone();
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    match control.open_stream(peer, PROTOCOL).await {
                        Ok(channel) => {
                            debug!(%peer, "opened outbound substream to discovered provider");
                            let _ = event_tx.send(TransportEvent::Connection {
                                peer: peer.to_string(),
                                channel: Box::new(channel.compat()),
                            });
                        }
                        Err(err) => warn!(%peer, %err, "failed to open substream to provider"),
                    }
                });
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { peer_id, .. })) => {
            debug!(%peer_id, "identified peer");
        }
        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
            debug!(%peer_id, ?cause, "connection closed");
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            warn!(?peer_id, %error, "outgoing connection failed");
        }
        _ => {}
    }
}
