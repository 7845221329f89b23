//! The root container: builds every subsystem from a loaded config, wires
//! the collaborators together explicitly, and owns the shutdown order. No
//! ambient globals; everything flows through constructor parameters.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use honfig_network::{
    ChatCallbacks, ChatSession, GameListener, KeepaliveSettings, ListenerSettings,
};
use honfig_protocol::chat::{ReplayRequest, ServerInfo, UploadStatus};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::autoscaler::{Autoscaler, ScalePolicy};
use crate::config::ManagerConfig;
use crate::error::Error;
use crate::event::EventBus;
use crate::manager::{InstanceManager, ManagerSettings};
use crate::replay::{
    HttpUploader, ReplayCoordinator, ReplaySettings, ReplayStatusSink, ReplayUploader,
};
use crate::spawn::{ProcessSpawner, TokioSpawner};
use crate::stats::{MatchStatsSink, MemoryStats, StatsHandler};

/// The identity the chat handshake runs under. Normally assigned by the
/// master-server login, which lives outside this core.
#[derive(Clone, Debug)]
pub struct ChatIdentity {
    pub server_id: u32,
    pub session_id: String,
}

impl ChatIdentity {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            server_id: config.svr_id,
            session_id: config.svr_login.clone(),
        }
    }
}

/// Injection points for the pieces with real side effects; defaults are the
/// production implementations.
pub struct ServiceOptions {
    pub spawner: Arc<dyn ProcessSpawner>,
    pub uploader: Arc<dyn ReplayUploader>,
    pub stats: Arc<dyn MatchStatsSink>,
    pub keepalive: KeepaliveSettings,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            spawner: Arc::new(TokioSpawner),
            uploader: Arc::new(HttpUploader::new()),
            stats: Arc::new(MemoryStats::default()),
            keepalive: KeepaliveSettings::default(),
        }
    }
}

/// Replay progress goes out over the chat session.
struct ChatReplaySink {
    session: Arc<ChatSession>,
}

#[async_trait]
impl ReplayStatusSink for ChatReplaySink {
    async fn report(
        &self,
        match_id: u32,
        account_id: u32,
        status: UploadStatus,
        download_link: Option<&str>,
    ) {
        self.session
            .send_replay_status(match_id, account_id, status, download_link)
            .await;
    }
}

/// Chat-session callbacks: replay requests fan out to the coordinator,
/// disconnects wake the reconnect supervisor.
struct ChatBridge {
    coordinator: parking_lot::RwLock<Option<Arc<ReplayCoordinator>>>,
    reconnect_tx: flume::Sender<()>,
}

#[async_trait]
impl ChatCallbacks for ChatBridge {
    async fn on_disconnected(&self) {
        warn!("chat session lost");
        let _ = self.reconnect_tx.try_send(());
    }

    async fn on_replay_request(&self, request: ReplayRequest) {
        let coordinator = self.coordinator.read().clone();
        match coordinator {
            Some(coordinator) => {
                // Uploads take a while; never stall the session's read loop.
                tokio::spawn(async move { coordinator.handle_request(request).await });
            }
            None => warn!("replay request before the coordinator was wired"),
        }
    }
}

pub struct ManagerService {
    config: ManagerConfig,
    bus: Arc<EventBus>,
    manager: Arc<InstanceManager>,
    session: Arc<ChatSession>,
    coordinator: Arc<ReplayCoordinator>,
    listener_addr: SocketAddr,
    token: CancellationToken,
}

impl ManagerService {
    /// Builds and starts the whole manager with production side effects.
    pub async fn start(config: ManagerConfig, identity: ChatIdentity) -> Result<Self, Error> {
        Self::start_with(config, identity, ServiceOptions::default()).await
    }

    pub async fn start_with(
        config: ManagerConfig,
        identity: ChatIdentity,
        options: ServiceOptions,
    ) -> Result<Self, Error> {
        config.validate()?;

        let token = CancellationToken::new();
        let bus = EventBus::new();
        bus.register(Arc::new(StatsHandler::new(options.stats.clone())));

        let manager = InstanceManager::new(
            ManagerSettings::from_config(&config),
            bus.clone(),
            options.spawner.clone(),
            &token,
        );

        for _ in 0..config.svr_total {
            manager.add_server()?;
        }

        let listener = GameListener::start(
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                config.svr_manager_port,
            ),
            manager.clone(),
            ListenerSettings::default(),
            &token,
        )
        .await?;
        let listener_addr = listener.local_addr();
        info!(%listener_addr, "listening for game servers");
        manager.set_listener(listener);

        let (reconnect_tx, reconnect_rx) = flume::bounded(1);
        let bridge = Arc::new(ChatBridge {
            coordinator: parking_lot::RwLock::new(None),
            reconnect_tx: reconnect_tx.clone(),
        });
        let session = ChatSession::new(bridge.clone(), options.keepalive);
        session.set_registration(ServerInfo::for_registration(
            identity.server_id,
            &config.svr_login,
            &config.svr_location,
            &config.svr_name,
            &config.man_version,
            &config.svr_ip,
            config.svr_starting_game_port,
        ));

        let coordinator = ReplayCoordinator::new(
            ReplaySettings {
                replays_dir: config.replays_dir.clone(),
                ..ReplaySettings::default()
            },
            options.uploader.clone(),
            Arc::new(ChatReplaySink {
                session: session.clone(),
            }),
            bus.clone(),
        );
        *bridge.coordinator.write() = Some(coordinator.clone());

        let (tap_tx, tap_rx) = flume::bounded(64);
        manager.set_replay_tap(tap_tx);
        coordinator.spawn_update_intake(tap_rx, &token);

        // The pre-created fleet is the floor for a fixed-size policy.
        let mut autoscale = config.autoscale;
        autoscale.total_servers = autoscale.total_servers.max(config.svr_total);
        let policy = ScalePolicy::from_config(
            &autoscale,
            std::thread::available_parallelism()
                .ok()
                .map(|n| n.get() as u32),
            config.svr_total_per_core,
        );
        Autoscaler::new(
            manager.clone(),
            policy,
            Duration::from_secs(config.autoscale.interval),
            &token,
        )
        .spawn();

        let endpoint = config.chat_endpoint()?;
        tokio::spawn(chat_supervisor(
            session.clone(),
            identity,
            endpoint,
            token.child_token(),
            reconnect_rx,
        ));
        let _ = reconnect_tx.try_send(());

        Ok(Self {
            config,
            bus,
            manager,
            session,
            coordinator,
            listener_addr,
            token,
        })
    }

    /// Where the game listener actually bound; children announce here.
    pub fn listener_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn manager(&self) -> Arc<InstanceManager> {
        self.manager.clone()
    }

    pub fn session(&self) -> Arc<ChatSession> {
        self.session.clone()
    }

    pub fn coordinator(&self) -> Arc<ReplayCoordinator> {
        self.coordinator.clone()
    }

    /// Orderly shutdown: flag the registration as going away, close the
    /// chat session, stop the fleet, then cancel everything that remains.
    pub async fn shutdown(self) {
        info!("manager service shutting down");

        self.session.announce_shutdown().await;
        self.session.disconnect().await;
        self.manager.shutdown(Duration::from_secs(30)).await;
        self.token.cancel();
    }
}

/// Owns the reconnect policy the session itself deliberately does not have:
/// every wake-up attempts connect + handshake until one sticks, with
/// exponential backoff between failures.
async fn chat_supervisor(
    session: Arc<ChatSession>,
    identity: ChatIdentity,
    (host, port): (String, u16),
    token: CancellationToken,
    reconnect_rx: flume::Receiver<()>,
) {
    const BACKOFF_START: Duration = Duration::from_secs(5);
    const BACKOFF_CAP: Duration = Duration::from_secs(60);

    loop {
        tokio::select! {
            () = token.cancelled() => return,
            res = reconnect_rx.recv_async() => {
                if res.is_err() {
                    return;
                }
            }
        }

        let mut backoff = BACKOFF_START;
        loop {
            match session.connect(&host, port).await {
                Ok(()) => {
                    match session
                        .handshake(identity.server_id, &identity.session_id)
                        .await
                    {
                        Ok(()) => break,
                        Err(e) => {
                            warn!("chat handshake failed: {e}");
                            session.disconnect().await;
                        }
                    }
                }
                Err(e) => warn!("chat connect failed: {e}"),
            }

            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }
}
