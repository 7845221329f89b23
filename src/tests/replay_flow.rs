use std::sync::Arc;

use honfig_protocol::chat::{HandshakeAccepted, ReplayRequest, UploadStatus};
use honfig_protocol::ChatPacket;
use honfig_server::ManagerService;
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;

use super::{fake_options, test_config, test_identity, ChatPeer, FakeSpawner};

#[tokio::test]
async fn chat_initiated_replay_upload() {
    let replays = tempfile::tempdir().unwrap();
    std::fs::write(replays.path().join("M42.honreplay"), b"replay bytes").unwrap();

    let chat_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let chat_addr = chat_listener.local_addr().unwrap();

    let mut config = test_config();
    config.svr_chat_server = format!("127.0.0.1:{}", chat_addr.port());
    config.replays_dir = replays.path().to_path_buf();

    let service = ManagerService::start_with(
        config,
        test_identity(),
        fake_options(Arc::new(FakeSpawner::default())),
    )
    .await
    .unwrap();

    // Play the chat server: accept, admit, observe the registration.
    let (stream, _) = chat_listener.accept().await.unwrap();
    let mut peer = ChatPeer::new(stream);

    assert!(matches!(
        peer.read_packet().await,
        ChatPacket::HandshakeRequest(_)
    ));
    peer.send(&ChatPacket::from(HandshakeAccepted)).await;
    assert!(matches!(peer.read_packet().await, ChatPacket::ServerInfo(_)));

    // Ask for the replay.
    peer.send(&ChatPacket::from(ReplayRequest {
        pad: 0,
        account_id: 1,
        match_id: 42,
        extension: "honreplay".to_owned(),
        file_host: "h".to_owned(),
        directory: String::new(),
        upload_to_ftb: false,
        upload_to_s3: false,
        download_link: String::new(),
    }))
    .await;

    let mut statuses = Vec::new();
    while statuses.len() < 4 {
        match peer.read_packet().await {
            ChatPacket::ReplayStatus(status) => statuses.push(status),
            ChatPacket::Keepalive(_) => {}
            other => panic!("unexpected packet {other:?}"),
        }
    }

    assert_eq!(
        statuses.iter().map(|s| s.status).collect::<Vec<_>>(),
        vec![
            UploadStatus::InQueue,
            UploadStatus::Uploading,
            UploadStatus::UploadingNow,
            UploadStatus::UploadComplete,
        ]
    );

    let complete = statuses.last().unwrap();
    assert_eq!(complete.match_id, 42);
    assert_eq!(
        complete.download_link.as_deref(),
        Some("http://h/M42.honreplay")
    );

    service.shutdown().await;
}

#[tokio::test]
async fn missing_replay_is_not_found() {
    let replays = tempfile::tempdir().unwrap();

    let chat_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let chat_addr = chat_listener.local_addr().unwrap();

    let mut config = test_config();
    config.svr_chat_server = format!("127.0.0.1:{}", chat_addr.port());
    config.replays_dir = replays.path().to_path_buf();

    let service = ManagerService::start_with(
        config,
        test_identity(),
        fake_options(Arc::new(FakeSpawner::default())),
    )
    .await
    .unwrap();

    let (stream, _) = chat_listener.accept().await.unwrap();
    let mut peer = ChatPeer::new(stream);
    assert!(matches!(
        peer.read_packet().await,
        ChatPacket::HandshakeRequest(_)
    ));
    peer.send(&ChatPacket::from(HandshakeAccepted)).await;
    assert!(matches!(peer.read_packet().await, ChatPacket::ServerInfo(_)));

    peer.send(&ChatPacket::from(ReplayRequest {
        pad: 0,
        account_id: 1,
        match_id: 4242,
        extension: "honreplay".to_owned(),
        file_host: "h".to_owned(),
        directory: String::new(),
        upload_to_ftb: false,
        upload_to_s3: false,
        download_link: String::new(),
    }))
    .await;

    loop {
        match peer.read_packet().await {
            ChatPacket::ReplayStatus(status) => {
                assert_eq!(status.status, UploadStatus::NotFound);
                break;
            }
            ChatPacket::Keepalive(_) => {}
            other => panic!("unexpected packet {other:?}"),
        }
    }

    service.shutdown().await;
}
