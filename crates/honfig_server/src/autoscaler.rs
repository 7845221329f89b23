//! Periodic fleet sizing against a configured policy. Every decision goes
//! through the manager's normal command surface, so removal is always
//! graceful: occupied instances drain, nothing dies mid-match.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AutoscaleConfig, AutoscaleMode};
use crate::error::Error;
use crate::instance::{InstanceSnapshot, InstanceState};
use crate::manager::InstanceManager;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScalePolicy {
    /// Maintain exactly `total` instances; add missing, retire excess.
    Fixed { total: u32 },
    /// Maintain `ready_slots` empty ready instances; never remove.
    Target { ready_slots: u32 },
    /// Add one when everything is busy, retire idles beyond `min_idle`.
    DemandDriven { min_idle: u32, max: u32 },
}

impl ScalePolicy {
    pub fn from_config(config: &AutoscaleConfig, cores: Option<u32>, per_core: u32) -> Self {
        // The per-core hint caps the ceiling when both knobs are present.
        let cap = |max: u32| match cores {
            Some(cores) if per_core > 0 => max.min(cores * per_core),
            _ => max,
        };

        match config.mode {
            AutoscaleMode::Fixed => Self::Fixed {
                total: cap(config.total_servers),
            },
            AutoscaleMode::Target => Self::Target {
                ready_slots: config.target_ready_slots,
            },
            AutoscaleMode::DemandDriven => Self::DemandDriven {
                min_idle: config.min_idle,
                max: cap(config.max),
            },
        }
    }
}

pub struct Autoscaler {
    manager: Arc<InstanceManager>,
    policy: ScalePolicy,
    interval: Duration,
    token: CancellationToken,
}

impl Autoscaler {
    pub fn new(
        manager: Arc<InstanceManager>,
        policy: ScalePolicy,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            manager,
            policy,
            interval,
            token: parent.child_token(),
        }
    }

    /// Runs the tick loop until cancelled. A failed tick is logged and
    /// skipped; the next tick starts from a fresh snapshot.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; scaling decisions start
            // one full interval after boot.
            interval.tick().await;

            loop {
                tokio::select! {
                    () = self.token.cancelled() => return,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.tick().await {
                    warn!("autoscaler tick failed: {e}");
                }
            }
        })
    }

    /// One policy evaluation. Public for tests and manual kicks.
    pub async fn tick(&self) -> Result<(), Error> {
        let fleet = self.manager.enumerate();

        match self.policy {
            ScalePolicy::Fixed { total } => self.tick_fixed(&fleet, total).await,
            ScalePolicy::Target { ready_slots } => self.tick_target(&fleet, ready_slots).await,
            ScalePolicy::DemandDriven { min_idle, max } => {
                self.tick_demand(&fleet, min_idle, max).await
            }
        }
    }

    async fn tick_fixed(&self, fleet: &[InstanceSnapshot], total: u32) -> Result<(), Error> {
        let current = fleet.len() as u32;

        if current < total {
            for _ in current..total {
                let id = self.manager.add_server()?;
                info!(id, "autoscaler adding instance");
                self.spawn_start(id);
            }
            return Ok(());
        }

        let mut excess = current - total;

        // Gone-dead instances go first, then idles: fewest clients, and
        // among ties the highest id so the fleet stays dense at low ports.
        for snapshot in fleet {
            if excess == 0 {
                break;
            }
            if matches!(
                snapshot.state,
                InstanceState::Offline | InstanceState::Crashed
            ) {
                info!(id = snapshot.id, "autoscaler removing instance");
                self.manager.remove_server(snapshot.id).await?;
                excess -= 1;
            }
        }

        for id in removal_order(fleet) {
            if excess == 0 {
                break;
            }
            info!(id, "autoscaler retiring idle instance");
            self.manager.stop_server(id).await?;
            excess -= 1;
        }

        Ok(())
    }

    async fn tick_target(&self, fleet: &[InstanceSnapshot], ready_slots: u32) -> Result<(), Error> {
        let ready = fleet
            .iter()
            .filter(|s| s.state == InstanceState::Ready)
            .count() as u32;
        let warming = fleet
            .iter()
            .filter(|s| s.state == InstanceState::Starting)
            .count() as u32;

        if ready + warming < ready_slots {
            for _ in ready + warming..ready_slots {
                match self.manager.add_server() {
                    Ok(id) => {
                        info!(id, "autoscaler warming a ready slot");
                        self.spawn_start(id);
                    }
                    Err(Error::ResourceExhausted) => {
                        debug!("target policy at fleet ceiling");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    async fn tick_demand(
        &self,
        fleet: &[InstanceSnapshot],
        min_idle: u32,
        max: u32,
    ) -> Result<(), Error> {
        // Instances retired on an earlier tick have reached Offline by now;
        // reap them so they stop counting against `max`.
        for snapshot in fleet {
            if snapshot.state == InstanceState::Offline {
                self.manager.remove_server(snapshot.id).await?;
            }
        }
        let fleet: Vec<_> = fleet
            .iter()
            .filter(|s| s.state != InstanceState::Offline)
            .cloned()
            .collect();
        let fleet = fleet.as_slice();

        let available = fleet
            .iter()
            .filter(|s| matches!(s.state, InstanceState::Ready | InstanceState::Idle))
            .count() as u32;
        let warming = fleet
            .iter()
            .filter(|s| s.state == InstanceState::Starting)
            .count() as u32;
        let total = fleet.len() as u32;

        if available == 0 && warming == 0 && total < max {
            let id = self.manager.add_server()?;
            info!(id, "autoscaler adding instance for demand");
            self.spawn_start(id);
            return Ok(());
        }

        let idle = fleet
            .iter()
            .filter(|s| s.state == InstanceState::Idle)
            .count() as u32;
        if idle > min_idle {
            if let Some(id) = removal_order(fleet).into_iter().next() {
                info!(id, "autoscaler retiring surplus idle instance");
                self.manager.stop_server(id).await?;
            }
        }

        Ok(())
    }

    fn spawn_start(&self, id: u32) {
        // Starts queue on the shared gate; never block a tick on them.
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start_server(id).await {
                warn!(id, "autoscaler start failed: {e}");
            }
        });
    }
}

/// Idle instances in retirement preference order: fewest clients first,
/// highest id breaking ties.
fn removal_order(fleet: &[InstanceSnapshot]) -> Vec<u32> {
    let mut idle: Vec<_> = fleet
        .iter()
        .filter(|s| s.state == InstanceState::Idle)
        .collect();
    idle.sort_by_key(|s| (s.num_clients, std::cmp::Reverse(s.id)));
    idle.iter().map(|s| s.id).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::event::EventBus;
    use crate::manager::ManagerSettings;
    use crate::spawn::{LaunchSpec, ProcessHandle, ProcessSpawner};

    struct NeverExits {
        pid: u32,
        exit: flume::Receiver<Option<i32>>,
        kill_tx: flume::Sender<Option<i32>>,
    }

    #[async_trait]
    impl ProcessHandle for NeverExits {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        async fn wait(&mut self) -> Option<i32> {
            self.exit.recv_async().await.unwrap_or(None)
        }

        async fn kill(&mut self) {
            let _ = self.kill_tx.try_send(Some(137));
        }
    }

    #[derive(Default)]
    struct Spawner {
        count: AtomicU32,
    }

    #[async_trait]
    impl ProcessSpawner for Spawner {
        async fn spawn(&self, _spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, Error> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = flume::unbounded();
            Ok(Box::new(NeverExits {
                pid: n,
                exit: rx,
                kill_tx: tx,
            }))
        }
    }

    fn manager() -> Arc<InstanceManager> {
        InstanceManager::new(
            ManagerSettings {
                max_servers: 10,
                ..ManagerSettings::default()
            },
            EventBus::new(),
            Arc::new(Spawner::default()),
            &CancellationToken::new(),
        )
    }

    fn scaler(manager: Arc<InstanceManager>, policy: ScalePolicy) -> Autoscaler {
        Autoscaler::new(
            manager,
            policy,
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn fixed_policy_fills_the_fleet() {
        let manager = manager();
        let scaler = scaler(manager.clone(), ScalePolicy::Fixed { total: 3 });

        scaler.tick().await.unwrap();
        assert_eq!(manager.instance_count(), 3);

        // Idempotent at size.
        scaler.tick().await.unwrap();
        assert_eq!(manager.instance_count(), 3);
    }

    #[tokio::test]
    async fn fixed_policy_removes_dead_excess() {
        let manager = manager();
        for _ in 0..3 {
            manager.add_server().unwrap();
        }

        let scaler = scaler(manager.clone(), ScalePolicy::Fixed { total: 2 });
        scaler.tick().await.unwrap();

        // All three were offline; one is removed outright.
        assert_eq!(manager.instance_count(), 2);
    }

    #[tokio::test]
    async fn target_policy_never_removes() {
        let manager = manager();
        for _ in 0..4 {
            manager.add_server().unwrap();
        }

        let scaler = scaler(manager.clone(), ScalePolicy::Target { ready_slots: 1 });
        scaler.tick().await.unwrap();

        // Nothing ready, so one more warms up; nothing is removed.
        assert_eq!(manager.instance_count(), 5);
    }

    #[tokio::test]
    async fn demand_policy_adds_when_everything_is_busy() {
        let manager = manager();
        let scaler = scaler(
            manager.clone(),
            ScalePolicy::DemandDriven {
                min_idle: 1,
                max: 3,
            },
        );

        // Empty fleet counts as "everything busy".
        scaler.tick().await.unwrap();
        assert_eq!(manager.instance_count(), 1);
    }

    #[test]
    fn per_core_hint_caps_the_ceiling() {
        let config = AutoscaleConfig {
            mode: AutoscaleMode::Fixed,
            total_servers: 100,
            ..AutoscaleConfig::default()
        };

        assert_eq!(
            ScalePolicy::from_config(&config, Some(8), 4),
            ScalePolicy::Fixed { total: 32 }
        );
        assert_eq!(
            ScalePolicy::from_config(&config, Some(8), 0),
            ScalePolicy::Fixed { total: 100 }
        );
        assert_eq!(
            ScalePolicy::from_config(&config, None, 4),
            ScalePolicy::Fixed { total: 100 }
        );
    }

    #[test]
    fn removal_prefers_fewest_clients_then_highest_id() {
        let snap = |id: u32, state: InstanceState, clients: u8| InstanceSnapshot {
            id,
            game_port: 10000 + id as u16,
            voice_port: 11000 + id as u16,
            state,
            pid: None,
            started_at: None,
            num_clients: clients,
            uptime_s: 0,
            cpu_x100: 0,
            game_phase: 0,
            lobby: None,
            control_link: false,
            cow_port: None,
            dropped_frames: 0,
        };

        let fleet = vec![
            snap(1, InstanceState::Idle, 2),
            snap(2, InstanceState::Occupied, 9),
            snap(3, InstanceState::Idle, 0),
            snap(4, InstanceState::Idle, 0),
        ];

        assert_eq!(removal_order(&fleet), vec![4, 3, 1]);
    }
}
