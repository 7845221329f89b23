//! The manager's single outbound session to the upstream chat server.
//!
//! Lifecycle: [`connect`] establishes the socket and starts the read loop,
//! [`handshake`] sends `0x1600`, and the `0x1700` acceptance triggers the
//! stored `0x1602` registration and the keepalive task. One `0x0400`
//! shutdown notice tears the session down; reconnecting afterwards is the
//! owner's decision, signalled through [`ChatCallbacks::on_disconnected`].
//!
//! [`connect`]: ChatSession::connect
//! [`handshake`]: ChatSession::handshake

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use honfig_protocol::chat::{HandshakeRequest, ReplayRequest, ReplayStatus, ServerInfo, UploadStatus};
use honfig_protocol::{encode_frame, ChatPacket, Decode, FrameDecoder, CHAT_PROTOCOL_VERSION};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::READ_BUF_SIZE;

/// The 2-byte session terminator written on disconnect, best-effort.
const SESSION_TERMINATOR: [u8; 2] = 0x0003_u16.to_le_bytes();

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to chat server: {0}")]
    Connect(#[source] io::Error),
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: ChatSessionState,
        actual: ChatSessionState,
    },
    #[error("session is not connected")]
    NotConnected,
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] anyhow::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChatSessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Registered,
    ShuttingDown,
}

/// Whether the keepalive's length prefix and packet type go out as two
/// 2-byte writes (the upstream-observed form) or one 4-byte write. The bytes
/// on the wire are identical either way.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum KeepaliveMode {
    #[default]
    TwoWrites,
    Coalesced,
}

#[derive(Copy, Clone, Debug)]
pub struct KeepaliveSettings {
    pub period: Duration,
    pub mode: KeepaliveMode,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(15),
            mode: KeepaliveMode::default(),
        }
    }
}

/// Hooks the owning service registers on the session. Reconnection policy
/// lives behind these, not in the session itself.
#[async_trait]
pub trait ChatCallbacks: Send + Sync + 'static {
    /// The read loop ended: EOF, I/O error, or a `0x0400` shutdown notice.
    async fn on_disconnected(&self) {}

    /// The chat service asked for a replay on `0x1704`.
    async fn on_replay_request(&self, request: ReplayRequest) {
        let _ = request;
    }
}

/// No-op callbacks for tests and bare sessions.
pub struct NoCallbacks;

#[async_trait]
impl ChatCallbacks for NoCallbacks {}

pub struct ChatSession {
    state: parking_lot::Mutex<ChatSessionState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    registration: parking_lot::Mutex<Option<ServerInfo>>,
    callbacks: Arc<dyn ChatCallbacks>,
    keepalive: KeepaliveSettings,
    /// Token for the current connection's tasks; replaced on every connect.
    conn_token: parking_lot::Mutex<CancellationToken>,
    weak: Weak<ChatSession>,
}

impl ChatSession {
    pub fn new(callbacks: Arc<dyn ChatCallbacks>, keepalive: KeepaliveSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            state: parking_lot::Mutex::new(ChatSessionState::Disconnected),
            writer: tokio::sync::Mutex::new(None),
            registration: parking_lot::Mutex::new(None),
            callbacks,
            keepalive,
            conn_token: parking_lot::Mutex::new(CancellationToken::new()),
            weak: weak.clone(),
        })
    }

    pub fn state(&self) -> ChatSessionState {
        *self.state.lock()
    }

    /// Stores the `0x1602` record sent automatically once the handshake is
    /// accepted.
    pub fn set_registration(&self, info: ServerInfo) {
        *self.registration.lock() = Some(info);
    }

    /// Establishes the TCP session. Valid only while `Disconnected`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if *state != ChatSessionState::Disconnected {
                return Err(SessionError::InvalidState {
                    expected: ChatSessionState::Disconnected,
                    actual: *state,
                });
            }
            *state = ChatSessionState::Connecting;
        }

        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.lock() = ChatSessionState::Disconnected;
                return Err(SessionError::Connect(e));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {e}");
        }

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let token = CancellationToken::new();
        *self.conn_token.lock() = token.clone();

        let this = self.weak.upgrade().ok_or(SessionError::NotConnected)?;
        tokio::spawn(this.read_loop(reader, token));

        *self.state.lock() = ChatSessionState::Handshaking;
        info!(host, port, "connected to chat server");
        Ok(())
    }

    /// Sends the `0x1600` handshake. The acceptance is handled by the read
    /// loop.
    pub async fn handshake(&self, server_id: u32, session_id: &str) -> Result<(), SessionError> {
        let state = self.state();
        if state != ChatSessionState::Handshaking {
            return Err(SessionError::InvalidState {
                expected: ChatSessionState::Handshaking,
                actual: state,
            });
        }

        self.write_packet(&ChatPacket::from(HandshakeRequest {
            server_id,
            session_id: session_id.to_owned(),
            protocol_version: CHAT_PROTOCOL_VERSION,
        }))
        .await
    }

    /// Reports replay-upload progress on `0x1603`. Outside `Registered` this
    /// is a warning and a no-op.
    pub async fn send_replay_status(
        &self,
        match_id: u32,
        account_id: u32,
        status: UploadStatus,
        download_link: Option<&str>,
    ) {
        if self.state() != ChatSessionState::Registered {
            warn!(
                match_id,
                ?status,
                "dropping replay status, session is not registered"
            );
            return;
        }

        let pkt = ChatPacket::from(ReplayStatus {
            match_id,
            account_id,
            status,
            download_link: download_link.map(str::to_owned),
        });

        if let Err(e) = self.write_packet(&pkt).await {
            warn!("failed to send replay status: {e}");
        }
    }

    /// Re-sends the registration with the shutting-down flag set, so the
    /// chat server stops routing players here. Only meaningful while
    /// `Registered`.
    pub async fn announce_shutdown(&self) {
        if self.state() != ChatSessionState::Registered {
            return;
        }
        let info = self.registration.lock().clone();
        let Some(mut info) = info else { return };
        info.running_flag = ServerInfo::SHUTTING_DOWN;

        if let Err(e) = self.write_packet(&ChatPacket::from(info)).await {
            debug!("shutdown announcement failed: {e}");
        }
    }

    /// Tears the session down: best-effort terminator write, task
    /// cancellation, socket close. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.shutdown(false).await;
    }

    async fn shutdown(&self, notify: bool) {
        {
            let mut state = self.state.lock();
            if *state == ChatSessionState::Disconnected {
                return;
            }
            *state = ChatSessionState::ShuttingDown;
        }

        self.conn_token.lock().cancel();

        let mut writer = self.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write_all(&SESSION_TERMINATOR).await {
                debug!("terminator write failed: {e}");
            }
        }
        *writer = None;

        *self.state.lock() = ChatSessionState::Disconnected;
        info!("chat session disconnected");

        if notify {
            self.callbacks.on_disconnected().await;
        }
    }

    async fn write_packet(&self, pkt: &ChatPacket) -> Result<(), SessionError> {
        let bytes = encode_frame(pkt)?;

        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(SessionError::NotConnected)?;
        w.write_all(&bytes).await?;
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, token: CancellationToken) {
        let mut dec = FrameDecoder::new();

        loop {
            let frame = loop {
                match dec.try_next_frame() {
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {
                        dec.reserve(READ_BUF_SIZE);
                        let mut buf = dec.take_capacity();

                        tokio::select! {
                            () = token.cancelled() => return,
                            res = reader.read_buf(&mut buf) => match res {
                                Ok(0) => {
                                    debug!("chat server closed the connection");
                                    self.shutdown(true).await;
                                    return;
                                }
                                Ok(_) => dec.queue_bytes(buf),
                                Err(e) => {
                                    warn!("error reading from chat server: {e}");
                                    self.shutdown(true).await;
                                    return;
                                }
                            },
                        }
                    }
                    Err(e) => {
                        warn!("malformed chat frame: {e:#}");
                        self.shutdown(true).await;
                        return;
                    }
                }
            };

            let mut r = &frame[..];
            match ChatPacket::decode(&mut r) {
                Ok(pkt) => {
                    if self.clone().handle_packet(pkt).await {
                        return;
                    }
                }
                // Unknown ids are tolerated; the chat service grows packets.
                Err(e) => debug!("ignoring undecodable chat packet: {e:#}"),
            }
        }
    }

    /// Returns `true` when the read loop must stop.
    async fn handle_packet(self: Arc<Self>, pkt: ChatPacket) -> bool {
        match pkt {
            ChatPacket::HandshakeAccepted(_) => {
                {
                    let mut state = self.state.lock();
                    if *state != ChatSessionState::Handshaking {
                        warn!(state = ?*state, "unexpected handshake acceptance");
                        return false;
                    }
                    *state = ChatSessionState::Registered;
                }
                info!("chat handshake accepted");

                let registration = self.registration.lock().clone();
                match registration {
                    Some(info) => {
                        if let Err(e) = self.write_packet(&ChatPacket::from(info)).await {
                            warn!("failed to send server info: {e}");
                        }
                    }
                    None => warn!("no registration payload stored, skipping server info"),
                }

                let token = self.conn_token.lock().clone();
                tokio::spawn(self.clone().keepalive_loop(token));
            }
            ChatPacket::Policies(p) => {
                trace!(len = p.data.len(), "chat policies received");
            }
            ChatPacket::ReplayRequest(req) => {
                debug!(match_id = req.match_id, "replay requested over chat");
                self.callbacks.on_replay_request(req).await;
            }
            ChatPacket::KeepaliveAck(_) => {
                trace!("keepalive acknowledged");
            }
            ChatPacket::ShutdownNotice(_) => {
                info!("chat server sent shutdown notice");
                self.shutdown(true).await;
                return true;
            }
            other => {
                warn!(pkt = other.packet_name(), "unexpected packet from chat server");
            }
        }

        false
    }

    async fn keepalive_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.keepalive.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            if self.state() != ChatSessionState::Registered {
                return;
            }

            let mut writer = self.writer.lock().await;
            let Some(w) = writer.as_mut() else { return };

            // The wire form of an empty 0x2A00 frame: length then type.
            let res = match self.keepalive.mode {
                KeepaliveMode::TwoWrites => match w.write_all(&[0x02, 0x00]).await {
                    Ok(()) => w.write_all(&[0x00, 0x2A]).await,
                    Err(e) => Err(e),
                },
                KeepaliveMode::Coalesced => w.write_all(&[0x02, 0x00, 0x00, 0x2A]).await,
            };

            if let Err(e) = res {
                debug!("keepalive write failed: {e}");
                return;
            }
        }
    }
}
