mod frame;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::config::Role;
use frame::{MuxCodec, RawFrame};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("mux channel closed")]
    ChannelClosed,
    #[error("substream {0} not open")]
    UnknownStream(u32),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Commands sent from a `Substream` handle (or `MuxSession::open`) to the
/// driver task that owns the raw peer channel.
enum Command {
    Open {
        id: u32,
        resp: oneshot::Sender<Result<Substream, MuxError>>,
    },
    Write {
        id: u32,
        payload: Bytes,
    },
    Close {
        id: u32,
    },
}

/// Multiplexes independent logical substreams over one peer channel
/// (spec.md §4.3 "Mux Layer"). Only the driver task touches the raw channel;
/// every substream talks to it through an unbounded command queue, which is
/// the single serialization point the spec requires ("no concurrent writers
/// on the raw channel").
pub struct MuxSession {
    next_id: AtomicU32,
    cmd_tx: mpsc::UnboundedSender<Command>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Substream>>,
}

impl MuxSession {
    /// Spawns the driver task over `channel` and returns a handle. `role`
    /// determines outbound stream-id parity: exposer allocates even ids,
    /// accessor odd, mirroring yamux's client/server split so both sides
    /// could in principle open streams without colliding.
    pub fn new<T>(channel: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let framed = Framed::new(channel, MuxCodec);

        tokio::spawn(driver_loop(framed, cmd_rx, cmd_tx.clone(), accept_tx));

        let start_id = match role {
            Role::Exposer => 0,
            Role::Accessor => 1,
        };

        Self {
            next_id: AtomicU32::new(start_id),
            cmd_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Opens a new outbound substream (spec.md §4.3 `Open()`).
    pub async fn open(&self) -> Result<Substream, MuxError> {
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open { id, resp: resp_tx })
            .map_err(|_| MuxError::ChannelClosed)?;
        resp_rx.await.map_err(|_| MuxError::ChannelClosed)?
    }

    /// Awaits the next inbound substream opened by the peer (spec.md §4.3
    /// `OnOpen(cb)`).
    pub async fn accept(&self) -> Result<Substream, MuxError> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(MuxError::ChannelClosed)
    }
}

struct StreamEntry {
    data_tx: mpsc::UnboundedSender<Bytes>,
}

async fn driver_loop<T>(
    mut framed: Framed<T, MuxCodec>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    accept_tx: mpsc::UnboundedSender<Substream>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut streams: HashMap<u32, StreamEntry> = HashMap::new();

    loop {
        tokio::select! {
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(raw)) => handle_inbound(raw, &mut streams, &cmd_tx, &accept_tx),
                    Some(Err(err)) => {
                        debug!(%err, "mux channel read error, tearing down session");
                        break;
                    }
                    None => {
                        trace!("mux channel closed by peer");
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Open { id, resp }) => {
                        let (substream, data_tx) = Substream::new(id, cmd_tx.clone());
                        let sent = framed.send(RawFrame::open(id)).await;
                        if let Err(err) = sent {
                            let _ = resp.send(Err(MuxError::Io(err)));
                            continue;
                        }
                        streams.insert(id, StreamEntry { data_tx });
                        let _ = resp.send(Ok(substream));
                    }
                    Some(Command::Write { id, payload }) => {
                        if let Err(err) = framed.send(RawFrame::data(id, payload)).await {
                            debug!(%err, stream_id = id, "mux write failed");
                        }
                    }
                    Some(Command::Close { id }) => {
                        streams.remove(&id);
                        if let Err(err) = framed.send(RawFrame::close(id)).await {
                            debug!(%err, stream_id = id, "mux close-frame write failed");
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Channel close: every open substream observes EOF (spec.md §4.3).
    streams.clear();
}

fn handle_inbound(
    raw: RawFrame,
    streams: &mut HashMap<u32, StreamEntry>,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    accept_tx: &mpsc::UnboundedSender<Substream>,
) {
    if raw.is_open() {
        let (substream, data_tx) = Substream::new(raw.stream_id, cmd_tx.clone());
        streams.insert(raw.stream_id, StreamEntry { data_tx });
        if accept_tx.send(substream).is_err() {
            trace!(stream_id = raw.stream_id, "accept queue dropped, discarding inbound stream");
        }
        return;
    }
    if raw.is_data() {
        if let Some(entry) = streams.get(&raw.stream_id) {
            let _ = entry.data_tx.send(raw.payload);
        } else {
            trace!(stream_id = raw.stream_id, "data frame for unknown stream");
        }
        return;
    }
    if raw.is_close() {
        streams.remove(&raw.stream_id);
    }
}

/// One logical bidirectional byte stream inside a `MuxSession` (spec.md §3
/// "Substream"). Implements `AsyncRead`/`AsyncWrite` for TCP use, and
/// `recv_datagram`/`send_datagram` for UDP use where frame boundaries must
/// survive rather than be coalesced into a byte stream.
pub struct Substream {
    id: u32,
    cmd_tx: mpsc::UnboundedSender<Command>,
    inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
}

impl Substream {
    /// Builds a `Substream` and returns the sender half separately: the
    /// driver keeps that sender in its `StreamEntry` as the *only* producer
    /// for this stream's inbound channel, so dropping the entry (peer CLOSE
    /// frame, or channel teardown) drops the last sender and `inbound_rx`
    /// observes EOF. `Substream` itself must never hold a clone of it.
    fn new(id: u32, cmd_tx: mpsc::UnboundedSender<Command>) -> (Self, mpsc::UnboundedSender<Bytes>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let substream = Self {
            id,
            cmd_tx,
            inbound_rx,
            pending: BytesMut::new(),
        };
        (substream, inbound_tx)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Receives exactly one peer write as one `Bytes` chunk, preserving
    /// datagram boundaries (spec.md §4.5.3 UDP exposer, §4.5.4 UDP accessor).
    pub async fn recv_datagram(&mut self) -> Option<Bytes> {
        self.inbound_rx.recv().await
    }

    /// Sends `data` as exactly one mux frame / one peer write.
    pub fn send_datagram(&self, data: Bytes) -> Result<(), MuxError> {
        self.cmd_tx
            .send(Command::Write { id: self.id, payload: data })
            .map_err(|_| MuxError::ChannelClosed)
    }
}

impl Drop for Substream {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Close { id: self.id });
    }
}

impl AsyncRead for Substream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.pending.is_empty() {
            let take = self.pending.len().min(buf.remaining());
            let chunk = self.pending.split_to(take);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        match self.inbound_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let take = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..take]);
                if take < chunk.len() {
                    self.pending.extend_from_slice(&chunk[take..]);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())), // EOF
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Substream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let payload = Bytes::copy_from_slice(buf);
        let len = payload.len();
        self.cmd_tx
            .send(Command::Write { id: self.id, payload })
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mux session closed"))?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let _ = self.cmd_tx.send(Command::Close { id: self.id });
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn opens_and_exchanges_data_over_a_duplex_pair() {
        let (exposer_end, accessor_end) = duplex(4096);
        let exposer = MuxSession::new(exposer_end, Role::Exposer);
        let accessor = MuxSession::new(accessor_end, Role::Accessor);

        let mut opened = accessor.open().await.expect("open");
        let mut accepted = exposer.accept().await.expect("accept");

        opened.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        opened.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn datagram_boundaries_are_preserved() {
        let (exposer_end, accessor_end) = duplex(4096);
        let exposer = MuxSession::new(exposer_end, Role::Exposer);
        let accessor = MuxSession::new(accessor_end, Role::Accessor);

        let opened = accessor.open().await.expect("open");
        let mut accepted = exposer.accept().await.expect("accept");

        opened.send_datagram(Bytes::from_static(b"one")).unwrap();
        opened.send_datagram(Bytes::from_static(b"two")).unwrap();

        let first = accepted.recv_datagram().await.unwrap();
        let second = accepted.recv_datagram().await.unwrap();
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two");
    }
}
