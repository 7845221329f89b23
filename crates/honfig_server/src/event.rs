//! In-process event dispatch with a bounded history.
//!
//! Every subsystem publishes [`GameEvent`]s here; handlers subscribe with a
//! capability filter. Dispatch is synchronous and sequential per event so
//! any single handler observes program order, and handler panics are
//! contained.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::error;

/// Maximum number of events retained; the oldest are evicted first.
pub const HISTORY_CAP: usize = 500;

/// The typed payload of an event.
#[derive(Clone, Debug, PartialEq)]
pub enum GameEventKind {
    ServerStarted,
    ServerStopped,
    ServerCrashed {
        exit_code: Option<i32>,
    },
    MatchStarted {
        match_id: i32,
        map: String,
        name: String,
        mode: String,
    },
    MatchEnded {
        match_id: i32,
        duration: Duration,
    },
    PlayerSnapshot {
        count: u8,
    },
    ReplayRequested {
        match_id: u32,
        account_id: u32,
    },
    ReplayUploaded {
        match_id: u32,
    },
    InstanceAdded,
    InstanceRemoved,
}

impl GameEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerStarted => "ServerStarted",
            Self::ServerStopped => "ServerStopped",
            Self::ServerCrashed { .. } => "ServerCrashed",
            Self::MatchStarted { .. } => "MatchStarted",
            Self::MatchEnded { .. } => "MatchEnded",
            Self::PlayerSnapshot { .. } => "PlayerSnapshot",
            Self::ReplayRequested { .. } => "ReplayRequested",
            Self::ReplayUploaded { .. } => "ReplayUploaded",
            Self::InstanceAdded => "InstanceAdded",
            Self::InstanceRemoved => "InstanceRemoved",
        }
    }

    /// Raw dictionary view of the payload, for debug surfaces and sinks that
    /// need wire-compatible loose typing.
    pub fn payload(&self) -> Value {
        match self {
            Self::ServerCrashed { exit_code } => json!({ "exitCode": exit_code }),
            Self::MatchStarted {
                match_id,
                map,
                name,
                mode,
            } => json!({ "matchId": match_id, "map": map, "name": name, "mode": mode }),
            Self::MatchEnded { match_id, duration } => {
                json!({ "matchId": match_id, "durationSeconds": duration.as_secs() })
            }
            Self::PlayerSnapshot { count } => json!({ "count": count }),
            Self::ReplayRequested {
                match_id,
                account_id,
            } => json!({ "matchId": match_id, "accountId": account_id }),
            Self::ReplayUploaded { match_id } => json!({ "matchId": match_id }),
            _ => json!({}),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GameEvent {
    /// Monotonic sequence number, unique per bus.
    pub id: u64,
    /// The instance this event concerns, when there is one.
    pub server_id: Option<u32>,
    pub timestamp: SystemTime,
    pub kind: GameEventKind,
}

/// A subscriber on the bus. `can_handle` is the capability filter;
/// `handle` runs synchronously inside `dispatch`.
pub trait EventHandler: Send + Sync {
    fn can_handle(&self, kind: &GameEventKind) -> bool {
        let _ = kind;
        true
    }

    fn handle(&self, event: &GameEvent);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub dispatched: u64,
    pub evicted: u64,
    pub history_len: usize,
    pub by_kind: HashMap<&'static str, u64>,
}

#[derive(Default)]
pub struct EventBus {
    history: Mutex<VecDeque<GameEvent>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    seq: AtomicU64,
    evicted: AtomicU64,
    by_kind: Mutex<HashMap<&'static str, u64>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Publishes an event: appends it to the history, then runs every
    /// accepting handler in registration order. Fire-and-forget for the
    /// caller; handler panics are logged, never propagated.
    pub fn dispatch(&self, server_id: Option<u32>, kind: GameEventKind) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = GameEvent {
            id,
            server_id,
            timestamp: SystemTime::now(),
            kind,
        };

        *self.by_kind.lock().entry(event.kind.name()).or_insert(0) += 1;

        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_CAP {
                history.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(event.clone());
        }

        let handlers = self.handlers.read().clone();
        for handler in &handlers {
            if !handler.can_handle(&event.kind) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| handler.handle(&event))).is_err() {
                error!(event = event.kind.name(), "event handler panicked");
            }
        }

        id
    }

    /// The `n` most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<GameEvent> {
        let history = self.history.lock();
        history.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn by_kind(&self, name: &str, n: usize) -> Vec<GameEvent> {
        let history = self.history.lock();
        let mut events: Vec<GameEvent> = history
            .iter()
            .rev()
            .filter(|e| e.kind.name() == name)
            .take(n)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    pub fn by_server(&self, server_id: u32, n: usize) -> Vec<GameEvent> {
        let history = self.history.lock();
        let mut events: Vec<GameEvent> = history
            .iter()
            .rev()
            .filter(|e| e.server_id == Some(server_id))
            .take(n)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            dispatched: self.seq.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            history_len: self.history.lock().len(),
            by_kind: self.by_kind.lock().clone(),
        }
    }
}
