//! One supervised game-server child and its lifecycle state machine.
//!
//! Transitions are driven by exactly three sources: manager commands,
//! packets delivered by the game listener, and process-exit notifications
//! from the OS wait. All three funnel through the instance's single state
//! lock, so transitions are linearised per instance.

use std::sync::{Arc, Weak};
use std::time::Duration;

use honfig_network::{packet_queue, Disconnect, PacketSender, DEFAULT_QUEUE_DEPTH};
use honfig_protocol::game::{CowAnnounce, LobbyCreated, ServerAnnounce, ServerStatus};
use honfig_protocol::GamePacket;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::event::{EventBus, GameEventKind};
use crate::spawn::{LaunchSpec, ProcessSpawner};

/// Hard cap on reported clients per instance.
pub const MAX_CLIENTS: u8 = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Offline,
    Starting,
    Ready,
    Occupied,
    Idle,
    Draining,
    Stopping,
    Crashed,
    Unknown,
}

/// Whether `from → to` is an edge of the lifecycle graph.
pub fn transition_allowed(from: InstanceState, to: InstanceState) -> bool {
    use InstanceState::*;

    matches!(
        (from, to),
        (Offline, Starting)
            | (Starting, Ready)
            | (Starting, Crashed)
            | (Ready, Occupied)
            | (Ready, Stopping)
            | (Ready, Offline)
            | (Ready, Crashed)
            | (Occupied, Idle)
            | (Occupied, Draining)
            | (Occupied, Stopping)
            | (Occupied, Offline)
            | (Occupied, Crashed)
            | (Idle, Occupied)
            | (Idle, Stopping)
            | (Idle, Offline)
            | (Idle, Crashed)
            | (Draining, Stopping)
            | (Draining, Crashed)
            | (Stopping, Offline)
            | (Stopping, Crashed)
            | (Crashed, Starting)
            | (Crashed, Offline)
            | (Unknown, _)
    )
}

impl InstanceState {
    /// Static label for state-violation errors.
    fn transition_label(self) -> &'static str {
        match self {
            Self::Offline => "transition to Offline",
            Self::Starting => "transition to Starting",
            Self::Ready => "transition to Ready",
            Self::Occupied => "transition to Occupied",
            Self::Idle => "transition to Idle",
            Self::Draining => "transition to Draining",
            Self::Stopping => "transition to Stopping",
            Self::Crashed => "transition to Crashed",
            Self::Unknown => "transition to Unknown",
        }
    }
}

/// The lobby currently open on an instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LobbyInfo {
    pub match_id: i32,
    pub map: String,
    pub name: String,
    pub mode: String,
}

impl From<&LobbyCreated> for LobbyInfo {
    fn from(pkt: &LobbyCreated) -> Self {
        Self {
            match_id: pkt.match_id,
            map: pkt.map.clone(),
            name: pkt.name.clone(),
            mode: pkt.mode.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InstanceSettings {
    /// `Starting → Crashed` deadline.
    pub startup_timeout: Duration,
    /// How long a draining instance waits for its lobby to close.
    pub drain_timeout: Duration,
    pub restart_on_crash: bool,
    pub restart_between_games: bool,
    pub restart_backoff_start: Duration,
    pub restart_backoff_cap: Duration,
    /// Shared gate bounding how many instances may be `Starting` at once.
    pub start_gate: Arc<Semaphore>,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(180),
            drain_timeout: Duration::from_secs(900),
            restart_on_crash: true,
            restart_between_games: false,
            restart_backoff_start: Duration::from_secs(5),
            restart_backoff_cap: Duration::from_secs(60),
            start_gate: Arc::new(Semaphore::new(5)),
        }
    }
}

/// Read-only view of an instance, refreshed after every mutation.
#[derive(Clone, Debug)]
pub struct InstanceSnapshot {
    pub id: u32,
    pub game_port: u16,
    pub voice_port: u16,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub num_clients: u8,
    pub uptime_s: u32,
    pub cpu_x100: u32,
    pub game_phase: u8,
    pub lobby: Option<LobbyInfo>,
    /// Whether the child's manager control link (`0x47`) came up.
    pub control_link: bool,
    pub cow_port: Option<u16>,
    pub dropped_frames: u64,
}

struct Inner {
    state: InstanceState,
    /// Bumps on every spawn; timers and waiters from older spawns no-op.
    epoch: u64,
    pid: Option<u32>,
    kill_token: Option<CancellationToken>,
    start_permit: Option<OwnedSemaphorePermit>,
    started_at: Option<Instant>,
    status: Option<ServerStatus>,
    lobby: Option<LobbyInfo>,
    match_started_at: Option<Instant>,
    backoff: Duration,
    pending_restart: bool,
    control_link: bool,
    cow_port: Option<u16>,
}

pub struct Instance {
    id: u32,
    game_port: u16,
    voice_port: u16,
    launch: LaunchSpec,
    settings: InstanceSettings,
    bus: Arc<EventBus>,
    spawner: Arc<dyn ProcessSpawner>,
    sender: PacketSender,
    replay_tap: parking_lot::Mutex<Option<flume::Sender<(u32, Vec<u8>)>>>,
    snapshot: parking_lot::RwLock<InstanceSnapshot>,
    inner: tokio::sync::Mutex<Inner>,
    token: CancellationToken,
    weak: Weak<Instance>,
}

impl Instance {
    pub fn new(
        id: u32,
        game_port: u16,
        voice_port: u16,
        launch: LaunchSpec,
        settings: InstanceSettings,
        bus: Arc<EventBus>,
        spawner: Arc<dyn ProcessSpawner>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (sender, rx) = packet_queue(DEFAULT_QUEUE_DEPTH);
        let backoff = settings.restart_backoff_start;

        let instance = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            id,
            game_port,
            voice_port,
            launch,
            settings,
            bus,
            spawner,
            sender: sender.clone(),
            replay_tap: parking_lot::Mutex::new(None),
            snapshot: parking_lot::RwLock::new(InstanceSnapshot {
                id,
                game_port,
                voice_port,
                state: InstanceState::Offline,
                pid: None,
                started_at: None,
                num_clients: 0,
                uptime_s: 0,
                cpu_x100: 0,
                game_phase: 0,
                lobby: None,
                control_link: false,
                cow_port: None,
                dropped_frames: 0,
            }),
            inner: tokio::sync::Mutex::new(Inner {
                state: InstanceState::Offline,
                epoch: 0,
                pid: None,
                kill_token: None,
                start_permit: None,
                started_at: None,
                status: None,
                lobby: None,
                match_started_at: None,
                backoff,
                pending_restart: false,
                control_link: false,
                cow_port: None,
            }),
            token: parent.child_token(),
            weak: weak.clone(),
        });

        tokio::spawn(instance.clone().dispatch_loop(rx));
        instance
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn game_port(&self) -> u16 {
        self.game_port
    }

    pub fn voice_port(&self) -> u16 {
        self.voice_port
    }

    /// The sending half of this instance's packet queue, handed to the
    /// listener when a connection announces this instance's port.
    pub fn packet_sender(&self) -> PacketSender {
        self.sender.clone()
    }

    /// Wires the destination for opaque `0x4A` replay-update blobs.
    pub fn set_replay_tap(&self, tap: flume::Sender<(u32, Vec<u8>)>) {
        *self.replay_tap.lock() = Some(tap);
    }

    pub fn state(&self) -> InstanceState {
        self.snapshot.read().state
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        self.snapshot.read().clone()
    }

    /// Tears the instance down: cancels its tasks and kills any child.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Spawns the child process. Queues on the shared start gate first, so
    /// at most `svr_max_start_at_once` instances are `Starting` at a time.
    ///
    /// Returns a manually boxed future (rather than using `async fn`) to
    /// give it an explicit `Send` bound in its signature: `start` and
    /// `launch_locked` are mutually referenced through tasks spawned deep
    /// inside each other, which otherwise sends rustc's opaque-type
    /// inference for `async fn` into an unresolvable cycle.
    pub fn start(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(u16, Option<u32>), Error>> + Send + '_>>
    {
        Box::pin(async move {
            let permit = self
                .settings
                .start_gate
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Timeout("start gate closed"))?;

            let mut inner = self.inner.lock().await;
            match inner.state {
                InstanceState::Offline | InstanceState::Crashed => {}
                state => return Err(Error::StateViolation { op: "start", state }),
            }

            inner.start_permit = Some(permit);
            let res = self.launch_locked(&mut inner).await;
            if res.is_err() {
                inner.start_permit = None;
            }
            self.store_snapshot(&inner);
            res?;

            Ok((self.game_port, inner.pid))
        })
    }

    /// Requests an orderly stop. A no-op when already offline or already on
    /// the way down; an occupied instance drains instead of dying mid-match.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let res = self.stop_locked(&mut inner);
        self.store_snapshot(&inner);
        res
    }

    fn stop_locked(&self, inner: &mut Inner) -> Result<(), Error> {
        match inner.state {
            InstanceState::Offline
            | InstanceState::Stopping
            | InstanceState::Draining
            | InstanceState::Crashed => Ok(()),
            InstanceState::Ready | InstanceState::Idle => {
                self.set_state(inner, InstanceState::Stopping)?;
                self.kill_child(inner);
                Ok(())
            }
            InstanceState::Occupied => self.begin_drain(inner),
            state @ (InstanceState::Starting | InstanceState::Unknown) => {
                Err(Error::StateViolation { op: "stop", state })
            }
        }
    }

    /// Graceful removal of an occupied instance: wait for the lobby to
    /// close, then stop.
    pub async fn drain(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let res = match inner.state {
            InstanceState::Occupied => self.begin_drain(&mut inner),
            InstanceState::Draining => Ok(()),
            state => Err(Error::StateViolation { op: "drain", state }),
        };
        self.store_snapshot(&inner);
        res
    }

    /// Stop followed by start once the process is gone.
    pub async fn restart(&self) -> Result<(), Error> {
        let start_directly = {
            let inner = self.inner.lock().await;
            matches!(
                inner.state,
                InstanceState::Offline | InstanceState::Crashed
            )
        };

        if start_directly {
            return self.start().await.map(|_| ());
        }

        self.inner.lock().await.pending_restart = true;
        let res = self.stop().await;
        if res.is_err() {
            self.inner.lock().await.pending_restart = false;
        }
        res
    }

    /// Admin teardown path: kills the child regardless of state. Skips the
    /// lifecycle graph deliberately.
    pub async fn force_kill(&self) {
        let mut inner = self.inner.lock().await;
        if inner.kill_token.is_some() {
            if inner.state != InstanceState::Stopping {
                warn!(id = self.id, state = ?inner.state, "force-stopping instance");
                inner.state = InstanceState::Stopping;
            }
            self.kill_child(&inner);
        } else if !matches!(
            inner.state,
            InstanceState::Offline | InstanceState::Crashed
        ) {
            inner.state = InstanceState::Offline;
        }
        self.store_snapshot(&inner);
    }

    /// The listener lost this instance's connection.
    pub async fn connection_closed(&self, disconnect: Disconnect) {
        let mut inner = self.inner.lock().await;
        match disconnect {
            Disconnect::Closed => {
                debug!(id = self.id, "game server connection closed");
            }
            Disconnect::Malformed => {
                if matches!(
                    inner.state,
                    InstanceState::Starting
                        | InstanceState::Ready
                        | InstanceState::Occupied
                        | InstanceState::Idle
                        | InstanceState::Draining
                ) {
                    warn!(id = self.id, "malformed traffic from child, treating as crashed");
                    if let Err(e) = self.enter_crashed(&mut inner, None) {
                        warn!(id = self.id, "crash transition rejected: {e}");
                    }
                }
            }
        }
        self.store_snapshot(&inner);
    }

    async fn dispatch_loop(self: Arc<Self>, rx: flume::Receiver<GamePacket>) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => return,
                res = rx.recv_async() => match res {
                    Ok(pkt) => self.handle_packet(pkt).await,
                    Err(_) => return,
                },
            }
        }
    }

    async fn handle_packet(&self, pkt: GamePacket) {
        let mut inner = self.inner.lock().await;
        let res = match pkt {
            GamePacket::ServerAnnounce(announce) => self.on_announce(&mut inner, &announce),
            GamePacket::ServerClosed(_) => self.on_server_closed(&mut inner),
            GamePacket::ServerStatus(status) => {
                self.on_status(&mut inner, status);
                Ok(())
            }
            GamePacket::LongFrame(frame) => {
                warn!(
                    id = self.id,
                    skipped_ms = frame.skipped_ms,
                    "child skipped frames"
                );
                Ok(())
            }
            GamePacket::LobbyCreated(lobby) => self.on_lobby_created(&mut inner, &lobby),
            GamePacket::LobbyClosed(_) => self.on_lobby_closed(&mut inner),
            GamePacket::ServerConnection(_) => {
                inner.control_link = true;
                debug!(id = self.id, "control link established");
                Ok(())
            }
            GamePacket::CowAnnounce(CowAnnounce { port }) => {
                inner.cow_port = Some(port);
                debug!(id = self.id, port, "fork-master echo");
                Ok(())
            }
            GamePacket::ReplayUpdate(update) => {
                let tap = self.replay_tap.lock().clone();
                match tap {
                    Some(tap) => {
                        let _ = tap.try_send((self.id, update.data));
                    }
                    None => trace!(id = self.id, "replay update with no coordinator wired"),
                }
                Ok(())
            }
        };

        if let Err(e) = res {
            warn!(id = self.id, "packet rejected: {e}");
        }
        self.store_snapshot(&inner);
    }

    fn on_announce(&self, inner: &mut Inner, announce: &ServerAnnounce) -> Result<(), Error> {
        if inner.state != InstanceState::Starting {
            debug!(id = self.id, state = ?inner.state, "announce outside startup, ignoring");
            return Ok(());
        }
        if announce.port != u32::from(self.game_port) {
            warn!(
                id = self.id,
                announced = announce.port,
                expected = self.game_port,
                "announce port mismatch"
            );
        }

        self.set_state(inner, InstanceState::Ready)?;
        inner.start_permit = None;
        inner.backoff = self.settings.restart_backoff_start;
        self.bus.dispatch(Some(self.id), GameEventKind::ServerStarted);
        info!(id = self.id, port = self.game_port, "instance ready");
        Ok(())
    }

    fn on_server_closed(&self, inner: &mut Inner) -> Result<(), Error> {
        match inner.state {
            InstanceState::Ready | InstanceState::Idle | InstanceState::Occupied => {
                self.set_state(inner, InstanceState::Offline)?;
                inner.lobby = None;
                inner.match_started_at = None;
                self.bus.dispatch(Some(self.id), GameEventKind::ServerStopped);
            }
            // Draining falls through here: a draining instance leaves
            // through 0x45 and Stopping, nothing else.
            state => debug!(id = self.id, ?state, "server-closed outside serving states"),
        }
        Ok(())
    }

    fn on_status(&self, inner: &mut Inner, mut status: ServerStatus) {
        if status.num_clients > MAX_CLIENTS {
            warn!(
                id = self.id,
                reported = status.num_clients,
                "client count above cap, clamping"
            );
            status.num_clients = MAX_CLIENTS;
        }

        let previous = inner.status.as_ref().map(|s| s.num_clients);
        if previous != Some(status.num_clients) {
            self.bus.dispatch(
                Some(self.id),
                GameEventKind::PlayerSnapshot {
                    count: status.num_clients,
                },
            );
        }

        inner.status = Some(status);
    }

    fn on_lobby_created(&self, inner: &mut Inner, lobby: &LobbyCreated) -> Result<(), Error> {
        match inner.state {
            InstanceState::Ready | InstanceState::Idle => {
                self.set_state(inner, InstanceState::Occupied)?;
                inner.lobby = Some(LobbyInfo::from(lobby));
                inner.match_started_at = Some(Instant::now());
                self.bus.dispatch(
                    Some(self.id),
                    GameEventKind::MatchStarted {
                        match_id: lobby.match_id,
                        map: lobby.map.clone(),
                        name: lobby.name.clone(),
                        mode: lobby.mode.clone(),
                    },
                );
            }
            state => warn!(id = self.id, ?state, "lobby created outside ready/idle"),
        }
        Ok(())
    }

    fn on_lobby_closed(&self, inner: &mut Inner) -> Result<(), Error> {
        let match_id = inner.lobby.as_ref().map_or(0, |l| l.match_id);
        let duration = inner
            .match_started_at
            .map_or(Duration::ZERO, |at| at.elapsed());

        match inner.state {
            InstanceState::Occupied => {
                self.set_state(inner, InstanceState::Idle)?;
                inner.lobby = None;
                inner.match_started_at = None;
                self.bus.dispatch(
                    Some(self.id),
                    GameEventKind::MatchEnded { match_id, duration },
                );

                if self.settings.restart_between_games {
                    info!(id = self.id, "restarting between games");
                    self.set_state(inner, InstanceState::Stopping)?;
                    inner.pending_restart = true;
                    self.kill_child(inner);
                }
            }
            InstanceState::Draining => {
                self.set_state(inner, InstanceState::Stopping)?;
                inner.lobby = None;
                inner.match_started_at = None;
                self.bus.dispatch(
                    Some(self.id),
                    GameEventKind::MatchEnded { match_id, duration },
                );
                self.kill_child(inner);
            }
            state => debug!(id = self.id, ?state, "lobby closed with none open"),
        }
        Ok(())
    }

    async fn on_startup_deadline(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.state != InstanceState::Starting {
            return;
        }
        warn!(
            id = self.id,
            timeout = ?self.settings.startup_timeout,
            "instance never announced, declaring it crashed"
        );
        if let Err(e) = self.enter_crashed(&mut inner, None) {
            warn!(id = self.id, "crash transition rejected: {e}");
        }
        self.store_snapshot(&inner);
    }

    fn enter_crashed(&self, inner: &mut Inner, exit_code: Option<i32>) -> Result<(), Error> {
        self.set_state(inner, InstanceState::Crashed)?;

        inner.start_permit = None;
        inner.pid = None;
        self.kill_child(inner);
        inner.lobby = None;
        inner.match_started_at = None;

        self.bus
            .dispatch(Some(self.id), GameEventKind::ServerCrashed { exit_code });

        if self.settings.restart_on_crash {
            let delay = inner.backoff;
            inner.backoff = (inner.backoff * 2).min(self.settings.restart_backoff_cap);
            info!(id = self.id, ?delay, "scheduling restart after crash");

            let weak = self.weak.clone();
            let token = self.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                let Some(this) = weak.upgrade() else { return };
                if this.state() != InstanceState::Crashed {
                    return;
                }
                if let Err(e) = this.start().await {
                    warn!("restart after crash failed: {e}");
                }
            });
        }

        Ok(())
    }

    fn begin_drain(&self, inner: &mut Inner) -> Result<(), Error> {
        self.set_state(inner, InstanceState::Draining)?;

        let weak = self.weak.clone();
        let epoch = inner.epoch;
        let deadline = self.settings.drain_timeout;
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(deadline) => {}
            }
            let Some(this) = weak.upgrade() else { return };
            let mut inner = this.inner.lock().await;
            if inner.epoch == epoch && inner.state == InstanceState::Draining {
                warn!(id = this.id, "drain deadline expired, stopping mid-match");
                match this.set_state(&mut inner, InstanceState::Stopping) {
                    Ok(()) => this.kill_child(&inner),
                    Err(e) => warn!(id = this.id, "forced stop rejected: {e}"),
                }
                this.store_snapshot(&inner);
            }
        });

        Ok(())
    }

    fn kill_child(&self, inner: &Inner) {
        if let Some(token) = &inner.kill_token {
            token.cancel();
        }
    }

    /// The typed transition function: moves to `to` only along an edge of
    /// the lifecycle graph, rejecting everything else without mutating.
    fn set_state(&self, inner: &mut Inner, to: InstanceState) -> Result<(), Error> {
        let from = inner.state;
        if from == to {
            return Ok(());
        }
        if !transition_allowed(from, to) {
            return Err(Error::StateViolation {
                op: to.transition_label(),
                state: from,
            });
        }
        debug!(id = self.id, ?from, ?to, "state transition");
        inner.state = to;
        Ok(())
    }

    fn store_snapshot(&self, inner: &Inner) {
        let status = inner.status.as_ref();
        *self.snapshot.write() = InstanceSnapshot {
            id: self.id,
            game_port: self.game_port,
            voice_port: self.voice_port,
            state: inner.state,
            pid: inner.pid,
            started_at: inner.started_at,
            num_clients: status.map_or(0, |s| s.num_clients),
            uptime_s: status.map_or(0, |s| s.uptime_s),
            cpu_x100: status.map_or(0, |s| s.cpu_x100),
            game_phase: status.map_or(0, |s| s.game_phase),
            lobby: inner.lobby.clone(),
            control_link: inner.control_link,
            cow_port: inner.cow_port,
            dropped_frames: self.sender.dropped(),
        };
    }
}

/// Isolated in its own module so the compiler doesn't have to resolve the
/// mutually-referential opaque futures of `on_process_exit` and `start`
/// within a single defining scope (a known rustc limitation with recursive
/// async fns spawning tasks that call back into the same impl).
mod exit {
    use super::{warn, GameEventKind, Instance, InstanceState};

    impl Instance {
        pub(super) async fn on_process_exit(&self, epoch: u64, exit_code: Option<i32>) {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }

            inner.pid = None;
            inner.kill_token = None;
            inner.start_permit = None;

            let res = match inner.state {
                InstanceState::Stopping => match self.set_state(&mut inner, InstanceState::Offline)
                {
                    Ok(()) => {
                        inner.lobby = None;
                        inner.match_started_at = None;
                        self.bus.dispatch(Some(self.id), GameEventKind::ServerStopped);

                        if inner.pending_restart {
                            inner.pending_restart = false;
                            let weak = self.weak.clone();
                            tokio::spawn(async move {
                                if let Some(this) = weak.upgrade() {
                                    if let Err(e) = this.start().await {
                                        warn!("queued restart failed: {e}");
                                    }
                                }
                            });
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                // Already resolved: a ServerClosed packet or the startup
                // deadline got there first.
                InstanceState::Offline | InstanceState::Crashed => Ok(()),
                _ => self.enter_crashed(&mut inner, exit_code),
            };

            if let Err(e) = res {
                warn!(id = self.id, "exit transition rejected: {e}");
            }
            self.store_snapshot(&inner);
        }
    }
}

/// Isolated in its own module (separate from [`exit`]) so the compiler
/// doesn't have to resolve the mutually-referential opaque futures of
/// `launch_locked` and `start` within a single defining scope.
mod launch {
    use super::{Error, Inner, Instance, InstanceState, Instant};

    impl Instance {
        /// Spawns the child and arms the per-spawn tasks: the OS wait and the
        /// startup deadline.
        pub(super) async fn launch_locked(&self, inner: &mut Inner) -> Result<(), Error> {
            let handle = self.spawner.spawn(&self.launch).await?;

            // Commit the transition before any bookkeeping; a rejected edge
            // leaves the instance untouched and the dropped handle reaps the
            // child.
            self.set_state(inner, InstanceState::Starting)?;

            inner.epoch += 1;
            let epoch = inner.epoch;
            inner.pid = handle.pid();
            inner.started_at = Some(Instant::now());
            inner.status = None;
            inner.lobby = None;
            inner.match_started_at = None;
            inner.control_link = false;
            inner.cow_port = None;

            let kill_token = self.token.child_token();
            inner.kill_token = Some(kill_token.clone());

            let weak = self.weak.clone();
            tokio::spawn(async move {
                let mut handle = handle;
                let exited = tokio::select! {
                    code = handle.wait() => Some(code),
                    () = kill_token.cancelled() => None,
                };
                let code = match exited {
                    Some(code) => code,
                    None => {
                        handle.kill().await;
                        handle.wait().await
                    }
                };
                if let Some(this) = weak.upgrade() {
                    this.on_process_exit(epoch, code).await;
                }
            });

            let weak = self.weak.clone();
            let deadline = self.settings.startup_timeout;
            let token = self.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(deadline) => {}
                }
                if let Some(this) = weak.upgrade() {
                    this.on_startup_deadline(epoch).await;
                }
            });

            Ok(())
        }
    }
}
