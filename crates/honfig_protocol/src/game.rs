//! Packets sent by a supervised game-server child to the manager
//! (`0x40`–`0x4A`). The payload leads with a single-byte packet type.

use std::io::Write;
use std::sync::OnceLock;

use anyhow::ensure;
use regex::bytes::Regex;

use crate::{decode_or_default, packet_set, Decode, Encode};

packet_set! {
    /// Everything a game-server child may send over its manager connection.
    GamePacket: u8 {
        0x40 = ServerAnnounce,
        0x41 = ServerClosed,
        0x42 = ServerStatus,
        0x43 = LongFrame,
        0x44 = LobbyCreated,
        0x45 = LobbyClosed,
        0x47 = ServerConnection,
        0x49 = CowAnnounce,
        0x4A = ReplayUpdate,
    }
}

/// `0x40` — the child's first packet, reporting the game port it bound.
/// The listener uses it to tie the connection to an instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServerAnnounce {
    pub port: u32,
}

impl Encode for ServerAnnounce {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.port.encode(w)
    }
}

impl Decode for ServerAnnounce {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            port: u32::decode(r)?,
        })
    }
}

/// `0x41` — the child is shutting down in an orderly fashion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServerClosed;

impl Encode for ServerClosed {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode for ServerClosed {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// Offsets within the fixed `0x42` status header. The header is 54 bytes;
/// anything beyond it is the player block.
pub const STATUS_HEADER_LEN: usize = 54;
const UPTIME_OFFSET: usize = 1;
const CPU_OFFSET: usize = 5;
const NUM_CLIENTS_OFFSET: usize = 9;
const MATCH_STARTED_OFFSET: usize = 10;
const GAME_PHASE_OFFSET: usize = 40;
const PLAYER_COUNT_OFFSET: usize = 53;

/// `0x42` — periodic status report.
///
/// The header layout is a compatibility contract frozen by the upstream
/// ecosystem: `status @0`, `uptime_s @1`, `cpu_x100 @5`, `num_clients @9`,
/// `match_started @10`, `game_phase @40`, `player_count @53`. Player records
/// in the tail are located by scanning for dotted-IPv4 literals; each match
/// is preceded by the player's `i32` account id and followed by `name` and
/// `location` strings and three ping stats.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub status: u8,
    pub uptime_s: u32,
    pub cpu_x100: u32,
    pub num_clients: u8,
    pub match_started: bool,
    pub game_phase: u8,
    pub players: Vec<PlayerInfo>,
}

/// One record from the `0x42` player block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerInfo {
    pub account_id: i32,
    pub name: String,
    pub location: String,
    pub ip: String,
    pub min_ping: u16,
    pub avg_ping: u16,
    pub max_ping: u16,
}

fn ipv4_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").expect("static pattern compiles")
    })
}

impl Encode for ServerStatus {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        let mut header = [0_u8; STATUS_HEADER_LEN];
        header[0] = self.status;
        header[UPTIME_OFFSET..UPTIME_OFFSET + 4].copy_from_slice(&self.uptime_s.to_le_bytes());
        header[CPU_OFFSET..CPU_OFFSET + 4].copy_from_slice(&self.cpu_x100.to_le_bytes());
        header[NUM_CLIENTS_OFFSET] = self.num_clients;
        header[MATCH_STARTED_OFFSET] = u8::from(self.match_started);
        header[GAME_PHASE_OFFSET] = self.game_phase;
        ensure!(self.players.len() <= u8::MAX as usize, "too many players");
        header[PLAYER_COUNT_OFFSET] = self.players.len() as u8;
        w.write_all(&header)?;

        for p in &self.players {
            p.account_id.encode(&mut w)?;
            p.ip.encode(&mut w)?;
            p.name.encode(&mut w)?;
            p.location.encode(&mut w)?;
            p.min_ping.encode(&mut w)?;
            p.avg_ping.encode(&mut w)?;
            p.max_ping.encode(&mut w)?;
        }

        Ok(())
    }
}

impl Decode for ServerStatus {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let body = *r;
        ensure!(
            body.len() >= STATUS_HEADER_LEN,
            "status header is {} bytes, expected at least {STATUS_HEADER_LEN}",
            body.len()
        );

        let player_count = body[PLAYER_COUNT_OFFSET] as usize;
        let players = if body.len() > STATUS_HEADER_LEN {
            scan_players(body, player_count)
        } else {
            Vec::new()
        };

        *r = &[];
        Ok(Self {
            status: body[0],
            uptime_s: u32::from_le_bytes(body[UPTIME_OFFSET..UPTIME_OFFSET + 4].try_into()?),
            cpu_x100: u32::from_le_bytes(body[CPU_OFFSET..CPU_OFFSET + 4].try_into()?),
            num_clients: body[NUM_CLIENTS_OFFSET],
            match_started: body[MATCH_STARTED_OFFSET] != 0,
            game_phase: body[GAME_PHASE_OFFSET],
            players,
        })
    }
}

/// Walks the player block by scanning for dotted-IPv4 literals. Records that
/// run past the end of the packet are skipped, never an error.
fn scan_players(body: &[u8], count: usize) -> Vec<PlayerInfo> {
    let mut players = Vec::with_capacity(count.min(16));

    for m in ipv4_literal().find_iter(&body[STATUS_HEADER_LEN..]) {
        if players.len() >= count {
            break;
        }

        let ip_start = STATUS_HEADER_LEN + m.start();
        // The account id is the i32 ending immediately before the literal.
        if ip_start < STATUS_HEADER_LEN + 4 {
            continue;
        }

        if let Some(p) = read_player(body, ip_start) {
            players.push(p);
        }
    }

    players
}

fn read_player(body: &[u8], ip_start: usize) -> Option<PlayerInfo> {
    let account_id = i32::from_le_bytes(body.get(ip_start - 4..ip_start)?.try_into().ok()?);

    let mut r = body.get(ip_start..)?;
    let ip = String::decode(&mut r).ok()?;
    let name = String::decode(&mut r).ok()?;
    let location = String::decode(&mut r).ok()?;
    let min_ping = u16::decode(&mut r).ok()?;
    let avg_ping = u16::decode(&mut r).ok()?;
    let max_ping = u16::decode(&mut r).ok()?;

    Some(PlayerInfo {
        account_id,
        name,
        location,
        ip,
        min_ping,
        avg_ping,
        max_ping,
    })
}

/// `0x43` — the child's frame loop fell behind by `skipped_ms`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LongFrame {
    pub skipped_ms: u16,
}

impl Encode for LongFrame {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.skipped_ms.encode(w)
    }
}

impl Decode for LongFrame {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            skipped_ms: u16::decode(r)?,
        })
    }
}

/// `0x44` — a lobby opened on the instance. Strings the child omits decode
/// as empty rather than erroring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LobbyCreated {
    pub match_id: i32,
    pub map: String,
    pub name: String,
    pub mode: String,
}

impl Encode for LobbyCreated {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.match_id.encode(&mut w)?;
        0_u8.encode(&mut w)?;
        self.map.encode(&mut w)?;
        self.name.encode(&mut w)?;
        self.mode.encode(w)
    }
}

impl Decode for LobbyCreated {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let match_id = i32::decode(r)?;
        let _gap: u8 = decode_or_default(r)?;
        Ok(Self {
            match_id,
            map: decode_or_default(r)?,
            name: decode_or_default(r)?,
            mode: decode_or_default(r)?,
        })
    }
}

/// `0x45` — the current lobby closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LobbyClosed;

impl Encode for LobbyClosed {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode for LobbyClosed {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// `0x47` — the child established its manager control link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServerConnection;

impl Encode for ServerConnection {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode for ServerConnection {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// `0x49` — fork-master status echo carrying the forked worker's port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CowAnnounce {
    pub port: u16,
}

impl Encode for CowAnnounce {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.port.encode(w)
    }
}

impl Decode for CowAnnounce {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            port: u16::decode(r)?,
        })
    }
}

/// `0x4A` — opaque replay-upload progress blob, forwarded to the replay
/// coordinator without interpretation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayUpdate {
    pub data: Vec<u8>,
}

impl Encode for ReplayUpdate {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(&self.data)?)
    }
}

impl Decode for ReplayUpdate {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let data = r.to_vec();
        *r = &[];
        Ok(Self { data })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip(pkt: GamePacket) {
        let mut buf = vec![];
        pkt.encode(&mut buf).unwrap();
        let mut r = buf.as_slice();
        assert_eq!(pkt, GamePacket::decode(&mut r).unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn all_game_packets_round_trip() {
        round_trip(ServerAnnounce { port: 10001 }.into());
        round_trip(ServerClosed.into());
        round_trip(LongFrame { skipped_ms: 250 }.into());
        round_trip(
            LobbyCreated {
                match_id: 99,
                map: "caldavar".to_owned(),
                name: "T".to_owned(),
                mode: "normal".to_owned(),
            }
            .into(),
        );
        round_trip(LobbyClosed.into());
        round_trip(ServerConnection.into());
        round_trip(CowAnnounce { port: 10501 }.into());
        round_trip(
            ReplayUpdate {
                data: vec![1, 2, 3],
            }
            .into(),
        );
        round_trip(
            ServerStatus {
                status: 1,
                uptime_s: 3600,
                cpu_x100: 1250,
                num_clients: 2,
                match_started: true,
                game_phase: 5,
                players: vec![
                    PlayerInfo {
                        account_id: 1337,
                        name: "alice".to_owned(),
                        location: "NEWERTH".to_owned(),
                        ip: "10.0.0.1".to_owned(),
                        min_ping: 10,
                        avg_ping: 20,
                        max_ping: 30,
                    },
                    PlayerInfo {
                        account_id: -1,
                        name: "bob".to_owned(),
                        location: String::new(),
                        ip: "192.168.1.44".to_owned(),
                        min_ping: 0,
                        avg_ping: 55,
                        max_ping: 120,
                    },
                ],
            }
            .into(),
        );
    }

    #[test]
    fn unknown_packet_id_is_an_error() {
        let mut r: &[u8] = &[0x7F, 0x00];
        assert!(GamePacket::decode(&mut r).is_err());
    }

    #[test]
    fn bare_status_header_has_no_players() {
        let mut body = vec![0_u8; STATUS_HEADER_LEN];
        body[0] = 3;
        body[UPTIME_OFFSET] = 60;
        body[NUM_CLIENTS_OFFSET] = 4;
        body[GAME_PHASE_OFFSET] = 6;

        let mut r = body.as_slice();
        let status = ServerStatus::decode(&mut r).unwrap();
        assert_eq!(status.status, 3);
        assert_eq!(status.uptime_s, 60);
        assert_eq!(status.num_clients, 4);
        assert_eq!(status.game_phase, 6);
        assert!(status.players.is_empty());
    }

    /// Freezes the observed player-record byte layout: `i32 account_id`
    /// directly before the dotted-IPv4 literal, then `ip`/`name`/`location`
    /// strings, then three `u16` ping stats.
    #[test]
    fn player_record_byte_layout() {
        let mut body = vec![0_u8; STATUS_HEADER_LEN];
        body[PLAYER_COUNT_OFFSET] = 1;

        body.extend_from_slice(&4242_i32.to_le_bytes());
        body.extend_from_slice(b"172.16.0.9\0");
        body.extend_from_slice(b"carl\0");
        body.extend_from_slice(b"USE\0");
        body.extend_from_slice(&[15, 0, 25, 0, 40, 0]);

        let mut r = body.as_slice();
        let status = ServerStatus::decode(&mut r).unwrap();
        assert_eq!(
            status.players,
            vec![PlayerInfo {
                account_id: 4242,
                name: "carl".to_owned(),
                location: "USE".to_owned(),
                ip: "172.16.0.9".to_owned(),
                min_ping: 15,
                avg_ping: 25,
                max_ping: 40,
            }]
        );
    }

    #[test]
    fn truncated_player_record_is_skipped() {
        let mut body = vec![0_u8; STATUS_HEADER_LEN];
        body[PLAYER_COUNT_OFFSET] = 1;
        body.extend_from_slice(&7_i32.to_le_bytes());
        body.extend_from_slice(b"10.1.1.1\0tru");

        let mut r = body.as_slice();
        let status = ServerStatus::decode(&mut r).unwrap();
        assert!(status.players.is_empty());
    }

    #[test]
    fn lobby_created_with_missing_strings() {
        let mut r: &[u8] = &99_i32.to_le_bytes();
        let lobby = LobbyCreated::decode(&mut r).unwrap();
        assert_eq!(lobby.match_id, 99);
        assert_eq!(lobby.map, "");
        assert_eq!(lobby.name, "");
        assert_eq!(lobby.mode, "");

        let mut buf = 7_i32.to_le_bytes().to_vec();
        buf.push(0);
        buf.extend_from_slice(b"caldavar\0");
        let mut r = buf.as_slice();
        let lobby = LobbyCreated::decode(&mut r).unwrap();
        assert_eq!(lobby.map, "caldavar");
        assert_eq!(lobby.name, "");
        assert_eq!(lobby.mode, "");
    }
}
