//! Cross-subsystem scenario tests: the assembled service driven over real
//! loopback sockets, with fake process and upload transports injected.

mod chat_registration;
mod cold_start;
mod crash_restart;
mod replay_flow;

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use honfig_protocol::chat::ReplayRequest;
use honfig_protocol::{ChatPacket, Decode};
use honfig_server::{
    ChatIdentity, Error, LaunchSpec, ManagerConfig, ProcessHandle, ProcessSpawner, ReplayUploader,
    ServiceOptions,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

pub(crate) struct FakeProcess {
    pid: u32,
    exits: flume::Receiver<Option<i32>>,
    kill_tx: flume::Sender<Option<i32>>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Option<i32> {
        self.exits.recv_async().await.unwrap_or(None)
    }

    async fn kill(&mut self) {
        let _ = self.kill_tx.try_send(Some(137));
    }
}

#[derive(Default)]
pub(crate) struct FakeSpawner {
    count: AtomicU32,
    exits: parking_lot::Mutex<Vec<flume::Sender<Option<i32>>>>,
}

impl FakeSpawner {
    pub(crate) fn spawn_count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Makes the most recently spawned child exit with `code`.
    pub(crate) fn exit_latest(&self, code: Option<i32>) {
        self.exits.lock().last().unwrap().try_send(code).unwrap();
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, _spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, Error> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = flume::unbounded();
        self.exits.lock().push(tx.clone());
        Ok(Box::new(FakeProcess {
            pid: 4000 + n,
            exits: rx,
            kill_tx: tx,
        }))
    }
}

pub(crate) struct FakeUploader;

#[async_trait]
impl ReplayUploader for FakeUploader {
    async fn upload(&self, _path: &Path, request: &ReplayRequest) -> Result<String, Error> {
        Ok(format!(
            "http://{}/M{}.{}",
            request.file_host, request.match_id, request.extension
        ))
    }
}

/// Two pre-created instances, ephemeral listener port, and a chat endpoint
/// that refuses connections (tests that need one run their own fake peer).
pub(crate) fn test_config() -> ManagerConfig {
    ManagerConfig {
        svr_total: 2,
        svr_starting_game_port: 10001,
        svr_starting_voice_port: 11001,
        svr_manager_port: 0,
        svr_chat_server: "127.0.0.1:9".to_owned(),
        svr_login: "admin".to_owned(),
        ..ManagerConfig::default()
    }
}

pub(crate) fn test_identity() -> ChatIdentity {
    ChatIdentity {
        server_id: 7,
        session_id: "abc".to_owned(),
    }
}

pub(crate) fn fake_options(spawner: Arc<FakeSpawner>) -> ServiceOptions {
    ServiceOptions {
        spawner,
        uploader: Arc::new(FakeUploader),
        ..ServiceOptions::default()
    }
}

pub(crate) async fn wait_for(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A fake chat-server peer. Frame reads are exact-length, so they never
/// consume bytes past the frame and raw-byte assertions stay aligned.
pub(crate) struct ChatPeer {
    stream: TcpStream,
}

impl ChatPeer {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) async fn read_packet(&mut self) -> ChatPacket {
        let mut len = [0_u8; 2];
        self.stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0_u8; u16::from_le_bytes(len) as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        ChatPacket::decode(&mut &body[..]).unwrap()
    }

    pub(crate) async fn send(&mut self, pkt: &ChatPacket) {
        use tokio::io::AsyncWriteExt;

        let bytes = honfig_protocol::encode_frame(pkt).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }
}
