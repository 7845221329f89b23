use std::sync::Arc;
use std::time::Duration;

use honfig_network::{ChatSession, ChatSessionState, KeepaliveMode, KeepaliveSettings, NoCallbacks};
use honfig_protocol::chat::{HandshakeAccepted, ServerInfo};
use honfig_protocol::ChatPacket;
use pretty_assertions::assert_eq;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use super::ChatPeer;

#[tokio::test]
async fn handshake_registration_and_keepalive_cadence() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let session = ChatSession::new(
        Arc::new(NoCallbacks),
        KeepaliveSettings {
            period: Duration::from_millis(100),
            mode: KeepaliveMode::TwoWrites,
        },
    );
    session.set_registration(ServerInfo::for_registration(
        7,
        "admin",
        "EU",
        "EU Server",
        "4.10.1",
        "127.0.0.1",
        10001,
    ));

    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    session.connect("127.0.0.1", addr.port()).await.unwrap();
    session.handshake(7, "abc").await.unwrap();
    let mut peer = ChatPeer::new(accept.await.unwrap());

    // The handshake request, then nothing until 0x1700 goes back.
    let ChatPacket::HandshakeRequest(req) = peer.read_packet().await else {
        panic!("expected handshake request");
    };
    assert_eq!(req.server_id, 7);
    assert_eq!(req.session_id, "abc");
    assert_eq!(req.protocol_version, 70);

    peer.send(&ChatPacket::from(HandshakeAccepted)).await;

    // Exactly one 0x1602 follows, with the wire-exact suffixes.
    let ChatPacket::ServerInfo(info) = peer.read_packet().await else {
        panic!("expected server info");
    };
    assert!(info.login.ends_with(':'));
    assert!(info.name.ends_with(" 0"));
    assert_eq!(info.running_flag, ServerInfo::SERVING);
    assert_eq!(session.state(), ChatSessionState::Registered);

    // Keepalive raw bytes: the length pair then the type pair, twice over.
    let mut pair = [0_u8; 2];
    for _ in 0..2 {
        peer.stream_mut().read_exact(&mut pair).await.unwrap();
        assert_eq!(pair, [0x02, 0x00]);
        peer.stream_mut().read_exact(&mut pair).await.unwrap();
        assert_eq!(pair, [0x00, 0x2A]);
    }

    session.disconnect().await;
}
