//! Ownership of the instance fleet: id and port allocation, lifecycle
//! commands, snapshots, and the routing registry the game listener uses to
//! tie connections to instances.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use honfig_network::{Disconnect, GameListener, InstanceRegistry, PacketSender};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::Error;
use crate::event::{EventBus, GameEventKind};
use crate::instance::{Instance, InstanceSettings, InstanceSnapshot, InstanceState};
use crate::spawn::{LaunchSpec, ProcessSpawner};

#[derive(Clone)]
pub struct ManagerSettings {
    pub starting_game_port: u16,
    pub starting_voice_port: u16,
    /// The listener port children connect back to.
    pub manager_port: u16,
    /// Hard ceiling on the fleet; `add_server` refuses beyond it.
    pub max_servers: u32,
    pub executable: PathBuf,
    pub server_name: String,
    pub region: String,
    pub priority: String,
    pub no_console: bool,
    pub instance: InstanceSettings,
}

impl ManagerSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            starting_game_port: config.svr_starting_game_port,
            starting_voice_port: config.svr_starting_voice_port,
            manager_port: config.svr_manager_port,
            max_servers: config.max_servers(),
            executable: config.hon_install_directory.join("hon_server"),
            server_name: config.svr_name.clone(),
            region: config.svr_location.clone(),
            priority: config.svr_priority.clone(),
            no_console: config.svr_no_console,
            instance: InstanceSettings {
                startup_timeout: Duration::from_secs(config.svr_startup_timeout),
                drain_timeout: Duration::from_secs(config.drain_timeout),
                restart_between_games: config.svr_restart_between_games,
                start_gate: Arc::new(Semaphore::new(config.svr_max_start_at_once)),
                ..InstanceSettings::default()
            },
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}

pub struct InstanceManager {
    settings: ManagerSettings,
    instances: RwLock<BTreeMap<u32, Arc<Instance>>>,
    bus: Arc<EventBus>,
    spawner: Arc<dyn ProcessSpawner>,
    listener: parking_lot::Mutex<Option<GameListener>>,
    replay_tap: parking_lot::Mutex<Option<flume::Sender<(u32, Vec<u8>)>>>,
    token: CancellationToken,
}

impl InstanceManager {
    pub fn new(
        settings: ManagerSettings,
        bus: Arc<EventBus>,
        spawner: Arc<dyn ProcessSpawner>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            instances: RwLock::new(BTreeMap::new()),
            bus,
            spawner,
            listener: parking_lot::Mutex::new(None),
            replay_tap: parking_lot::Mutex::new(None),
            token: parent.child_token(),
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Derives the game port for an instance id. Ids allocate ports, so
    /// distinctness of ports follows from distinctness of ids.
    fn game_port_for(&self, id: u32) -> u16 {
        self.settings.starting_game_port + (id - 1) as u16
    }

    fn voice_port_for(&self, id: u32) -> u16 {
        self.settings.starting_voice_port + (id - 1) as u16
    }

    /// Creates a new offline instance on the next free id and port pair.
    pub fn add_server(&self) -> Result<u32, Error> {
        let mut instances = self.instances.write();

        if instances.len() as u32 >= self.settings.max_servers {
            return Err(Error::ResourceExhausted);
        }

        // Lowest free id, starting at 1, so the fleet stays dense.
        let id = (1..)
            .find(|id| !instances.contains_key(id))
            .unwrap_or(1);

        let launch = LaunchSpec {
            executable: self.settings.executable.clone(),
            game_port: self.game_port_for(id),
            voice_port: self.voice_port_for(id),
            manager_port: self.settings.manager_port,
            name: format!("{} {id}", self.settings.server_name),
            region: self.settings.region.clone(),
            priority: self.settings.priority.clone(),
            no_console: self.settings.no_console,
        };

        let instance = Instance::new(
            id,
            self.game_port_for(id),
            self.voice_port_for(id),
            launch,
            self.settings.instance.clone(),
            self.bus.clone(),
            self.spawner.clone(),
            &self.token,
        );
        if let Some(tap) = self.replay_tap.lock().as_ref() {
            instance.set_replay_tap(tap.clone());
        }
        instances.insert(id, instance);
        drop(instances);

        self.bus.dispatch(Some(id), GameEventKind::InstanceAdded);
        info!(id, "instance added");
        Ok(id)
    }

    fn get(&self, id: u32) -> Result<Arc<Instance>, Error> {
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::InstanceNotFound(id))
    }

    /// Starts an instance, queueing on the shared start gate. Returns the
    /// game port and child pid.
    pub async fn start_server(&self, id: u32) -> Result<(u16, Option<u32>), Error> {
        self.get(id)?.start().await
    }

    /// Stops an instance. `Ok(false)` for unknown ids; occupied instances
    /// enter `Draining` instead of dying mid-match.
    pub async fn stop_server(&self, id: u32) -> Result<bool, Error> {
        let Ok(instance) = self.get(id) else {
            return Ok(false);
        };
        instance.stop().await?;
        Ok(true)
    }

    pub async fn restart_server(&self, id: u32) -> Result<(), Error> {
        self.get(id)?.restart().await
    }

    /// Drops an instance from the fleet. Only offline or crashed instances
    /// may be removed; stop (or drain) first.
    pub async fn remove_server(&self, id: u32) -> Result<(), Error> {
        let instance = self.get(id)?;

        match instance.state() {
            InstanceState::Offline | InstanceState::Crashed => {}
            state => return Err(Error::StateViolation { op: "remove", state }),
        }

        instance.cancel();
        self.instances.write().remove(&id);
        self.bus.dispatch(Some(id), GameEventKind::InstanceRemoved);
        info!(id, "instance removed");
        Ok(())
    }

    /// Snapshot of the whole fleet, cheap enough to call from any thread.
    pub fn enumerate(&self) -> Vec<InstanceSnapshot> {
        self.instances
            .read()
            .values()
            .map(|i| i.snapshot())
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Wires every instance's replay tap, current and future, to the
    /// coordinator's intake.
    pub fn set_replay_tap(&self, tap: flume::Sender<(u32, Vec<u8>)>) {
        for instance in self.instances.read().values() {
            instance.set_replay_tap(tap.clone());
        }
        *self.replay_tap.lock() = Some(tap);
    }

    /// Wires the listener in for coordinated shutdown.
    pub fn set_listener(&self, listener: GameListener) {
        *self.listener.lock() = Some(listener);
    }

    /// Graceful fleet shutdown: stop everything (draining occupied
    /// instances), wait up to `deadline`, force-kill stragglers, then close
    /// the listener.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("shutting down instance fleet");

        let instances: Vec<_> = self.instances.read().values().cloned().collect();
        for instance in &instances {
            if let Err(e) = instance.stop().await {
                debug!(id = instance.id(), "stop during shutdown: {e}");
            }
        }

        let all_down = async {
            loop {
                let pending = instances.iter().any(|i| {
                    !matches!(
                        i.state(),
                        InstanceState::Offline | InstanceState::Crashed
                    )
                });
                if !pending {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        if tokio::time::timeout(deadline, all_down).await.is_err() {
            warn!("fleet did not stop within {deadline:?}, force-killing");
            for instance in &instances {
                instance.force_kill().await;
            }
        }

        if let Some(listener) = self.listener.lock().take() {
            listener.stop().await;
        }

        self.token.cancel();
    }
}

impl InstanceRegistry for InstanceManager {
    fn route_for_port(&self, game_port: u32) -> Option<(u32, PacketSender)> {
        self.instances
            .read()
            .values()
            .find(|i| u32::from(i.game_port()) == game_port)
            .map(|i| (i.id(), i.packet_sender()))
    }

    fn connection_closed(&self, instance_id: u32, disconnect: Disconnect) {
        if let Ok(instance) = self.get(instance_id) {
            tokio::spawn(async move {
                instance.connection_closed(disconnect).await;
            });
        }
    }
}
