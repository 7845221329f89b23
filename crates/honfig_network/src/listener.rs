//! The local TCP acceptor that supervised game-server children connect back
//! to. Each accepted connection is tied to an instance by the game port in
//! its first [`ServerAnnounce`] packet; everything after that is decoded and
//! pushed onto the instance's bounded queue in arrival order.
//!
//! [`ServerAnnounce`]: honfig_protocol::game::ServerAnnounce

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use honfig_protocol::{Decode, FrameDecoder, GamePacket};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::queue::PacketSender;
use crate::READ_BUF_SIZE;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
}

/// How a bound connection ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disconnect {
    /// The peer closed the stream between frames, or the socket errored.
    Closed,
    /// A malformed frame: zero length, or EOF in the middle of a frame.
    Malformed,
}

/// The listener's view of the instance fleet. Implemented by the instance
/// manager.
pub trait InstanceRegistry: Send + Sync + 'static {
    /// Resolves the instance that owns `game_port`, returning its id and the
    /// sending half of its packet queue.
    fn route_for_port(&self, game_port: u32) -> Option<(u32, PacketSender)>;

    /// Reports that a bound connection ended.
    fn connection_closed(&self, instance_id: u32, disconnect: Disconnect);
}

#[derive(Copy, Clone, Debug)]
pub struct ListenerSettings {
    /// How long packets received before the announce are buffered.
    pub announce_timeout: Duration,
    /// How long `stop` waits for in-flight connections before aborting them.
    pub drain_timeout: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            announce_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// A running acceptor on the manager port.
pub struct GameListener {
    local_addr: SocketAddr,
    token: CancellationToken,
    settings: ListenerSettings,
    accept_task: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl GameListener {
    /// Binds `addr` and begins accepting. The returned listener stops when
    /// [`stop`](Self::stop) is called or `parent` is cancelled.
    pub async fn start(
        addr: SocketAddr,
        registry: Arc<dyn InstanceRegistry>,
        settings: ListenerSettings,
        parent: &CancellationToken,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            addr,
            source,
        })?;

        let token = parent.child_token();
        let connections = Arc::new(Mutex::new(Vec::new()));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry,
            settings,
            token.clone(),
            connections.clone(),
        ));

        debug!(%local_addr, "game listener started");

        Ok(Self {
            local_addr,
            token,
            settings,
            accept_task,
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, then drains in-flight connections within the drain
    /// deadline before force-closing them.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.accept_task.await;

        let handles = std::mem::take(&mut *self.connections.lock());
        let deadline = Instant::now() + self.settings.drain_timeout;

        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                // Deadline passed with the connection still alive.
                warn!("connection did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<dyn InstanceRegistry>,
    settings: ListenerSettings,
    token: CancellationToken,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            res = listener.accept() => match res {
                Ok((stream, remote_addr)) => {
                    trace!(%remote_addr, "game server connected");
                    let handle = tokio::spawn(handle_connection(
                        stream,
                        remote_addr,
                        registry.clone(),
                        settings,
                        token.clone(),
                    ));

                    let mut conns = connections.lock();
                    conns.retain(|h: &JoinHandle<()>| !h.is_finished());
                    conns.push(handle);
                }
                Err(e) => {
                    error!("failed to accept game server connection: {e}");
                }
            },
        }
    }
}

enum ReadOutcome {
    Frame(GamePacket),
    Eof,
    Malformed,
    Cancelled,
}

async fn handle_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    registry: Arc<dyn InstanceRegistry>,
    settings: ListenerSettings,
    token: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {e}");
    }

    let mut dec = FrameDecoder::new();
    let mut bound: Option<(u32, PacketSender)> = None;
    let mut pending: Vec<(Instant, GamePacket)> = Vec::new();

    let disconnect = loop {
        let pkt = match next_packet(&mut stream, &mut dec, &token).await {
            ReadOutcome::Frame(pkt) => pkt,
            ReadOutcome::Eof => {
                break if dec.has_partial_frame() {
                    Disconnect::Malformed
                } else {
                    Disconnect::Closed
                };
            }
            ReadOutcome::Malformed => break Disconnect::Malformed,
            ReadOutcome::Cancelled => break Disconnect::Closed,
        };

        expire_pending(&mut pending, settings.announce_timeout);

        match (&bound, pkt) {
            (None, GamePacket::ServerAnnounce(announce)) => {
                let Some((id, sender)) = registry.route_for_port(announce.port) else {
                    warn!(
                        %remote_addr,
                        port = announce.port,
                        "announce for a port no instance owns, dropping connection"
                    );
                    return;
                };

                for (_, buffered) in pending.drain(..) {
                    sender.push(buffered);
                }
                sender.push(announce.into());
                bound = Some((id, sender));
            }
            (None, pkt) => {
                trace!(%remote_addr, pkt = pkt.packet_name(), "buffering pre-announce packet");
                pending.push((Instant::now(), pkt));
            }
            (Some((_, sender)), pkt) => {
                sender.push(pkt);
            }
        }
    };

    if let Some((id, _)) = bound {
        registry.connection_closed(id, disconnect);
    } else if !pending.is_empty() {
        warn!(
            %remote_addr,
            count = pending.len(),
            "dropping packets from a connection that never announced"
        );
    }
}

/// Drops buffered pre-announce packets that outlived the announce window.
fn expire_pending(pending: &mut Vec<(Instant, GamePacket)>, timeout: Duration) {
    let before = pending.len();
    pending.retain(|(at, _)| at.elapsed() < timeout);

    let expired = before - pending.len();
    if expired > 0 {
        warn!(expired, "dropped pre-announce packets older than {timeout:?}");
    }
}

async fn next_packet(
    stream: &mut TcpStream,
    dec: &mut FrameDecoder,
    token: &CancellationToken,
) -> ReadOutcome {
    loop {
        match dec.try_next_frame() {
            Ok(Some(frame)) => {
                let mut r = &frame[..];
                match GamePacket::decode(&mut r) {
                    Ok(pkt) => return ReadOutcome::Frame(pkt),
                    Err(e) => {
                        warn!("failed to decode game packet: {e:#}");
                        return ReadOutcome::Malformed;
                    }
                }
            }
            Ok(None) => {
                dec.reserve(READ_BUF_SIZE);
                let mut buf = dec.take_capacity();

                tokio::select! {
                    () = token.cancelled() => return ReadOutcome::Cancelled,
                    res = stream.read_buf(&mut buf) => match res {
                        Ok(0) => return ReadOutcome::Eof,
                        Ok(_) => dec.queue_bytes(buf),
                        Err(e) => {
                            debug!("error reading from game server: {e}");
                            return ReadOutcome::Eof;
                        }
                    },
                }
            }
            Err(e) => {
                warn!("malformed frame: {e:#}");
                return ReadOutcome::Malformed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use honfig_protocol::game::{LobbyClosed, ServerAnnounce};
    use honfig_protocol::{encode_frame, ChatPacket, Encode};
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::queue::packet_queue;

    struct OnePortRegistry {
        port: u32,
        sender: PacketSender,
        closed: Mutex<Vec<(u32, Disconnect)>>,
    }

    impl InstanceRegistry for OnePortRegistry {
        fn route_for_port(&self, game_port: u32) -> Option<(u32, PacketSender)> {
            (game_port == self.port).then(|| (1, self.sender.clone()))
        }

        fn connection_closed(&self, instance_id: u32, disconnect: Disconnect) {
            self.closed.lock().push((instance_id, disconnect));
        }
    }

    async fn start_listener(
        port: u32,
    ) -> (
        GameListener,
        Arc<OnePortRegistry>,
        flume::Receiver<GamePacket>,
    ) {
        let (sender, rx) = packet_queue(16);
        let registry = Arc::new(OnePortRegistry {
            port,
            sender,
            closed: Mutex::new(Vec::new()),
        });

        let listener = GameListener::start(
            "127.0.0.1:0".parse().unwrap(),
            registry.clone(),
            ListenerSettings::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        (listener, registry, rx)
    }

    #[tokio::test]
    async fn binds_by_announce_and_routes_in_order() {
        let (listener, _registry, rx) = start_listener(10001).await;

        let mut conn = TcpStream::connect(listener.local_addr()).await.unwrap();
        conn.write_all(&encode_frame(&GamePacket::from(ServerAnnounce { port: 10001 })).unwrap())
            .await
            .unwrap();
        conn.write_all(&encode_frame(&GamePacket::from(LobbyClosed)).unwrap())
            .await
            .unwrap();
        conn.flush().await.unwrap();

        assert_eq!(
            rx.recv_async().await.unwrap(),
            ServerAnnounce { port: 10001 }.into()
        );
        assert_eq!(rx.recv_async().await.unwrap(), LobbyClosed.into());

        listener.stop().await;
    }

    #[tokio::test]
    async fn pre_announce_packets_flush_after_binding() {
        let (listener, _registry, rx) = start_listener(10001).await;

        let mut conn = TcpStream::connect(listener.local_addr()).await.unwrap();
        conn.write_all(&encode_frame(&GamePacket::from(LobbyClosed)).unwrap())
            .await
            .unwrap();
        conn.write_all(&encode_frame(&GamePacket::from(ServerAnnounce { port: 10001 })).unwrap())
            .await
            .unwrap();
        conn.flush().await.unwrap();

        // Buffered packet first (arrival order), then the announce itself.
        assert_eq!(rx.recv_async().await.unwrap(), LobbyClosed.into());
        assert_eq!(
            rx.recv_async().await.unwrap(),
            ServerAnnounce { port: 10001 }.into()
        );

        listener.stop().await;
    }

    #[tokio::test]
    async fn malformed_frame_reports_crash() {
        let (listener, registry, rx) = start_listener(10001).await;

        let mut conn = TcpStream::connect(listener.local_addr()).await.unwrap();
        conn.write_all(&encode_frame(&GamePacket::from(ServerAnnounce { port: 10001 })).unwrap())
            .await
            .unwrap();
        // Zero-length frame.
        conn.write_all(&[0x00, 0x00]).await.unwrap();
        conn.flush().await.unwrap();

        let _ = rx.recv_async().await.unwrap();

        // The connection task observes the malformed frame and reports it.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if registry.closed.lock().as_slice() == [(1, Disconnect::Malformed)] {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        listener.stop().await;
    }

    #[tokio::test]
    async fn unknown_port_drops_connection() {
        let (listener, _registry, rx) = start_listener(10001).await;

        let mut conn = TcpStream::connect(listener.local_addr()).await.unwrap();
        conn.write_all(&encode_frame(&GamePacket::from(ServerAnnounce { port: 4444 })).unwrap())
            .await
            .unwrap();
        conn.flush().await.unwrap();

        // The listener hangs up; nothing is routed.
        let mut buf = [0_u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), conn.read_buf(&mut &mut buf[..]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(rx.is_empty());

        listener.stop().await;
    }

    #[tokio::test]
    async fn chat_frames_are_not_game_frames() {
        // A chat packet on the game wire decodes as an unknown game id and
        // counts as malformed.
        let frame = encode_frame(&ChatPacket::from(honfig_protocol::chat::Keepalive)).unwrap();
        let mut r = &frame[2..];
        assert!(GamePacket::decode(&mut r).is_err());

        let mut buf = vec![];
        GamePacket::from(ServerAnnounce { port: 1 })
            .encode(&mut buf)
            .unwrap();
        assert_eq!(buf[0], 0x40);
    }
}
