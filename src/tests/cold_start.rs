use std::sync::Arc;

use honfig_protocol::game::ServerAnnounce;
use honfig_protocol::{encode_frame, GamePacket};
use honfig_server::{InstanceState, ManagerService};
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::{fake_options, test_config, test_identity, wait_for, FakeSpawner};

#[tokio::test]
async fn cold_start_two_instances() {
    let spawner = Arc::new(FakeSpawner::default());
    let service = ManagerService::start_with(test_config(), test_identity(), fake_options(spawner))
        .await
        .unwrap();
    let manager = service.manager();

    // Pre-created fleet: dense ids, derived ports, everything offline.
    let fleet = manager.enumerate();
    assert_eq!(fleet.len(), 2);
    assert_eq!((fleet[0].id, fleet[0].game_port), (1, 10001));
    assert_eq!((fleet[1].id, fleet[1].game_port), (2, 10002));
    assert!(fleet.iter().all(|s| s.state == InstanceState::Offline));

    let (port, pid) = manager.start_server(1).await.unwrap();
    assert_eq!(port, 10001);
    assert!(pid.is_some());
    assert_eq!(manager.enumerate()[0].state, InstanceState::Starting);

    // The child connects back and announces its port.
    let mut conn = TcpStream::connect(service.listener_addr()).await.unwrap();
    conn.write_all(&encode_frame(&GamePacket::from(ServerAnnounce { port: 10001 })).unwrap())
        .await
        .unwrap();

    wait_for(|| manager.enumerate()[0].state == InstanceState::Ready).await;

    let started = service.bus().by_kind("ServerStarted", 10);
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].server_id, Some(1));

    // Instance 2 was never started.
    assert_eq!(manager.enumerate()[1].state, InstanceState::Offline);

    service.shutdown().await;
}
