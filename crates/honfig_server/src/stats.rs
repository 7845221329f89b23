//! Match-statistics sink interface. The SQL store behind it lives outside
//! this core; everything here is the typed write surface plus an in-memory
//! recorder that doubles as the test double and the default sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;

use crate::event::{EventHandler, GameEvent, GameEventKind};

/// One row of the `matches` table.
#[derive(Clone, Debug, Serialize)]
pub struct MatchRecord {
    pub match_id: i32,
    pub server_id: u32,
    pub server_name: String,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub winner: Option<String>,
    pub game_mode: Option<String>,
    pub map: Option<String>,
    pub player_count: u32,
    pub players_json: String,
}

/// Aggregate row of the `server_stats` table.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ServerStats {
    pub total_matches: u64,
    pub total_players: u64,
    pub last_match_at: Option<SystemTime>,
}

/// Write-only persistence surface for match statistics.
pub trait MatchStatsSink: Send + Sync {
    fn match_started(&self, record: MatchRecord);
    fn match_ended(&self, match_id: i32, server_id: u32, duration: Duration);
}

/// Keeps the rows in memory.
#[derive(Default)]
pub struct MemoryStats {
    inner: Mutex<MemoryStatsInner>,
}

#[derive(Default)]
struct MemoryStatsInner {
    matches: Vec<MatchRecord>,
    servers: HashMap<u32, ServerStats>,
}

impl MemoryStats {
    pub fn matches(&self) -> Vec<MatchRecord> {
        self.inner.lock().matches.clone()
    }

    pub fn server_stats(&self, server_id: u32) -> Option<ServerStats> {
        self.inner.lock().servers.get(&server_id).cloned()
    }
}

impl MatchStatsSink for MemoryStats {
    fn match_started(&self, record: MatchRecord) {
        let mut inner = self.inner.lock();

        let server = inner.servers.entry(record.server_id).or_default();
        server.total_matches += 1;
        server.total_players += u64::from(record.player_count);
        server.last_match_at = Some(record.start_time);

        inner.matches.push(record);
    }

    fn match_ended(&self, match_id: i32, server_id: u32, _duration: Duration) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner
            .matches
            .iter_mut()
            .rev()
            .find(|m| m.match_id == match_id && m.server_id == server_id)
        {
            record.end_time = Some(SystemTime::now());
        }
    }
}

/// Bridges the event bus into a stats sink: match lifecycle events become
/// row writes.
pub struct StatsHandler {
    sink: Arc<dyn MatchStatsSink>,
}

impl StatsHandler {
    pub fn new(sink: Arc<dyn MatchStatsSink>) -> Self {
        Self { sink }
    }
}

impl EventHandler for StatsHandler {
    fn can_handle(&self, kind: &GameEventKind) -> bool {
        matches!(
            kind,
            GameEventKind::MatchStarted { .. } | GameEventKind::MatchEnded { .. }
        )
    }

    fn handle(&self, event: &GameEvent) {
        let server_id = event.server_id.unwrap_or(0);
        match &event.kind {
            GameEventKind::MatchStarted {
                match_id,
                map,
                name,
                mode,
            } => {
                self.sink.match_started(MatchRecord {
                    match_id: *match_id,
                    server_id,
                    server_name: name.clone(),
                    start_time: event.timestamp,
                    end_time: None,
                    winner: None,
                    game_mode: Some(mode.clone()),
                    map: Some(map.clone()),
                    player_count: 0,
                    players_json: "[]".to_owned(),
                });
            }
            GameEventKind::MatchEnded { match_id, duration } => {
                self.sink.match_ended(*match_id, server_id, *duration);
            }
            _ => {}
        }
    }
}
