use std::sync::Arc;
use std::time::Duration;

use honfig_network::InstanceRegistry;
use honfig_protocol::game::ServerAnnounce;
use honfig_server::{
    EventBus, InstanceManager, InstanceSettings, InstanceState, ManagerSettings,
};
use pretty_assertions::assert_eq;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{wait_for, FakeSpawner};

#[tokio::test]
async fn crash_restarts_with_a_fresh_process() {
    let spawner = Arc::new(FakeSpawner::default());
    let settings = ManagerSettings {
        instance: InstanceSettings {
            startup_timeout: Duration::from_secs(30),
            restart_on_crash: true,
            restart_backoff_start: Duration::from_millis(100),
            restart_backoff_cap: Duration::from_millis(400),
            start_gate: Arc::new(Semaphore::new(5)),
            ..InstanceSettings::default()
        },
        ..ManagerSettings::default()
    };
    let manager = InstanceManager::new(
        settings,
        EventBus::new(),
        spawner.clone(),
        &CancellationToken::new(),
    );
    let bus = manager.bus();

    let id = manager.add_server().unwrap();
    manager.start_server(id).await.unwrap();

    let announce = || {
        let (_, sender) = manager.route_for_port(10001).unwrap();
        sender.push(ServerAnnounce { port: 10001 }.into());
    };

    announce();
    wait_for(|| manager.enumerate()[0].state == InstanceState::Ready).await;
    let first_start = manager.enumerate()[0].started_at.unwrap();

    // The child dies unexpectedly.
    spawner.exit_latest(Some(9));
    wait_for(|| manager.enumerate()[0].state == InstanceState::Crashed).await;
    assert_eq!(bus.by_kind("ServerCrashed", 10).len(), 1);

    // The backoff timer brings it back through Starting; after a fresh
    // announce it is Ready with a new process and a new start time.
    wait_for(|| manager.enumerate()[0].state == InstanceState::Starting).await;
    announce();
    wait_for(|| manager.enumerate()[0].state == InstanceState::Ready).await;

    assert_eq!(spawner.spawn_count(), 2);
    let snapshot = &manager.enumerate()[0];
    assert!(snapshot.started_at.unwrap() > first_start);
    assert_eq!(bus.by_kind("ServerStarted", 10).len(), 2);
}
