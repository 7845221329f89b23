//! Packets exchanged with the upstream chat server. The payload leads with a
//! 2-byte little-endian packet type.

use std::io::Write;

use anyhow::bail;

use crate::{decode_or_default, packet_set, Decode, Encode};

packet_set! {
    /// Everything either side of the manager↔chat session may send.
    ChatPacket: u16 {
        0x1600 = HandshakeRequest,
        0x1602 = ServerInfo,
        0x1603 = ReplayStatus,
        0x1700 = HandshakeAccepted,
        0x1703 = Policies,
        0x1704 = ReplayRequest,
        0x2A00 = Keepalive,
        0x2A01 = KeepaliveAck,
        0x0400 = ShutdownNotice,
    }
}

/// `0x1600` — opens the session. Answered by [`HandshakeAccepted`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub server_id: u32,
    pub session_id: String,
    pub protocol_version: u32,
}

impl Encode for HandshakeRequest {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.server_id.encode(&mut w)?;
        self.session_id.encode(&mut w)?;
        self.protocol_version.encode(w)
    }
}

impl Decode for HandshakeRequest {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            server_id: u32::decode(r)?,
            session_id: String::decode(r)?,
            protocol_version: u32::decode(r)?,
        })
    }
}

/// `0x1602` — the manager's registration record, sent once after the
/// handshake is accepted and again whenever the running state flips.
///
/// Wire-exact quirks the peer depends on: `login` ends in `:`, `name` ends
/// in ` 0`, and `running_flag` is `0x00` while serving and `0x01` while
/// shutting down. Build values with [`ServerInfo::for_registration`] to get
/// the suffixes right.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_id: u32,
    pub login: String,
    pub region: String,
    pub name: String,
    pub version: String,
    pub ip: String,
    pub udp_ping_port: u16,
    pub running_flag: u8,
}

impl ServerInfo {
    /// Running-state flag values.
    pub const SERVING: u8 = 0x00;
    pub const SHUTTING_DOWN: u8 = 0x01;

    /// Builds a registration record from unsuffixed values.
    pub fn for_registration(
        server_id: u32,
        login: &str,
        region: &str,
        name: &str,
        version: &str,
        ip: &str,
        udp_ping_port: u16,
    ) -> Self {
        Self {
            server_id,
            login: format!("{login}:"),
            region: region.to_owned(),
            name: format!("{name} 0"),
            version: version.to_owned(),
            ip: ip.to_owned(),
            udp_ping_port,
            running_flag: Self::SERVING,
        }
    }
}

impl Encode for ServerInfo {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.server_id.encode(&mut w)?;
        self.login.encode(&mut w)?;
        self.region.encode(&mut w)?;
        self.name.encode(&mut w)?;
        self.version.encode(&mut w)?;
        self.ip.encode(&mut w)?;
        self.udp_ping_port.encode(&mut w)?;
        self.running_flag.encode(w)
    }
}

impl Decode for ServerInfo {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            server_id: u32::decode(r)?,
            login: String::decode(r)?,
            region: String::decode(r)?,
            name: String::decode(r)?,
            version: String::decode(r)?,
            ip: String::decode(r)?,
            udp_ping_port: u16::decode(r)?,
            running_flag: u8::decode(r)?,
        })
    }
}

/// Progress states of a replay upload, reported on `0x1603`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UploadStatus {
    NotFound = 0x01,
    AlreadyUploaded = 0x02,
    InQueue = 0x03,
    Uploading = 0x04,
    HaveReplay = 0x05,
    UploadingNow = 0x06,
    UploadComplete = 0x07,
}

impl UploadStatus {
    /// Whether the `0x1603` wire form carries a download link for this
    /// status. An empty link still encodes its terminating NUL.
    pub fn carries_link(self) -> bool {
        matches!(self, Self::UploadComplete | Self::AlreadyUploaded)
    }
}

impl Encode for UploadStatus {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        (*self as u8).encode(w)
    }
}

impl Decode for UploadStatus {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(match u8::decode(r)? {
            0x01 => Self::NotFound,
            0x02 => Self::AlreadyUploaded,
            0x03 => Self::InQueue,
            0x04 => Self::Uploading,
            0x05 => Self::HaveReplay,
            0x06 => Self::UploadingNow,
            0x07 => Self::UploadComplete,
            other => bail!("unknown replay upload status {other:#04x}"),
        })
    }
}

/// `0x1603` — one step of a replay upload's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayStatus {
    pub match_id: u32,
    pub account_id: u32,
    pub status: UploadStatus,
    /// Present on the wire iff [`UploadStatus::carries_link`].
    pub download_link: Option<String>,
}

impl Encode for ReplayStatus {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.match_id.encode(&mut w)?;
        self.account_id.encode(&mut w)?;
        self.status.encode(&mut w)?;
        if self.status.carries_link() {
            self.download_link.as_deref().unwrap_or("").encode(w)?;
        }
        Ok(())
    }
}

impl Decode for ReplayStatus {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let match_id = u32::decode(r)?;
        let account_id = u32::decode(r)?;
        let status = UploadStatus::decode(r)?;
        let download_link = if status.carries_link() {
            Some(decode_or_default(r)?)
        } else {
            None
        };
        Ok(Self {
            match_id,
            account_id,
            status,
            download_link,
        })
    }
}

/// `0x1700` — the chat server admitted the manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandshakeAccepted;

impl Encode for HandshakeAccepted {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode for HandshakeAccepted {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// `0x1703` — informational policy blob. Retained raw; no documented layout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Policies {
    pub data: Vec<u8>,
}

impl Encode for Policies {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(&self.data)?)
    }
}

impl Decode for Policies {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let data = r.to_vec();
        *r = &[];
        Ok(Self { data })
    }
}

/// `0x1704` — the chat service asks for a replay to be made available.
/// Everything after `match_id` is optional on the wire and decodes as
/// zero/empty when absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayRequest {
    pub pad: u16,
    pub account_id: u32,
    pub match_id: u32,
    pub extension: String,
    pub file_host: String,
    pub directory: String,
    pub upload_to_ftb: bool,
    pub upload_to_s3: bool,
    pub download_link: String,
}

impl Encode for ReplayRequest {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.pad.encode(&mut w)?;
        self.account_id.encode(&mut w)?;
        self.match_id.encode(&mut w)?;
        self.extension.encode(&mut w)?;
        self.file_host.encode(&mut w)?;
        self.directory.encode(&mut w)?;
        self.upload_to_ftb.encode(&mut w)?;
        self.upload_to_s3.encode(&mut w)?;
        self.download_link.encode(w)
    }
}

impl Decode for ReplayRequest {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            pad: u16::decode(r)?,
            account_id: u32::decode(r)?,
            match_id: u32::decode(r)?,
            extension: decode_or_default(r)?,
            file_host: decode_or_default(r)?,
            directory: decode_or_default(r)?,
            upload_to_ftb: decode_or_default(r)?,
            upload_to_s3: decode_or_default(r)?,
            download_link: decode_or_default(r)?,
        })
    }
}

/// `0x2A00` — session heartbeat, sent every 15 s while registered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Keepalive;

impl Encode for Keepalive {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode for Keepalive {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// `0x2A01` — heartbeat acknowledgement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeepaliveAck;

impl Encode for KeepaliveAck {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode for KeepaliveAck {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// `0x0400` — the chat server is going away; the session must shut down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShutdownNotice;

impl Encode for ShutdownNotice {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode for ShutdownNotice {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}
