//! Fulfils chat-initiated replay requests (`0x1704`) and reports progress
//! back over the chat session (`0x1603`).
//!
//! The pipeline per request: local lookup → cached-upload fast path →
//! `InQueue` → upload slot → `Uploading` → `UploadingNow` → transfer with
//! retries → `UploadComplete`, or `NotFound` (the protocol has no explicit
//! error status).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use honfig_protocol::chat::{ReplayRequest, UploadStatus};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::event::{EventBus, GameEventKind};

/// Transport seam: pushes a replay file to the requested host and resolves
/// the public download link.
#[async_trait]
pub trait ReplayUploader: Send + Sync {
    async fn upload(&self, path: &Path, request: &ReplayRequest) -> Result<String, Error>;
}

/// Where `0x1603` progress reports go; the live implementation wraps the
/// chat session.
#[async_trait]
pub trait ReplayStatusSink: Send + Sync {
    async fn report(
        &self,
        match_id: u32,
        account_id: u32,
        status: UploadStatus,
        download_link: Option<&str>,
    );
}

/// HTTP transport over `reqwest`. The target URL is
/// `http://<file_host>/<directory>/M<match>.<ext>`; the ftb/s3 toggles ride
/// along as query parameters, and a non-empty response body overrides the
/// computed download link.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpUploader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplayUploader for HttpUploader {
    async fn upload(&self, path: &Path, request: &ReplayRequest) -> Result<String, Error> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::UploadFailed(format!("failed to read {}: {e}", path.display())))?;

        let host = if request.file_host.contains("://") {
            request.file_host.clone()
        } else {
            format!("http://{}", request.file_host)
        };
        let file_name = replay_file_name(request.match_id, &request.extension);
        let url = match request.directory.trim_matches('/') {
            "" => format!("{host}/{file_name}"),
            dir => format!("{host}/{dir}/{file_name}"),
        };

        let response = self
            .client
            .put(&url)
            .query(&[
                ("ftb", u8::from(request.upload_to_ftb)),
                ("s3", u8::from(request.upload_to_s3)),
            ])
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::UploadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UploadFailed(format!("{url} returned {status}")));
        }

        let link = response.text().await.unwrap_or_default();
        let link = link.trim();
        Ok(if link.is_empty() {
            url
        } else {
            link.to_owned()
        })
    }
}

#[derive(Clone, Debug)]
pub struct ReplaySettings {
    pub replays_dir: PathBuf,
    /// Uploads allowed in flight at once.
    pub max_parallel_uploads: usize,
    pub upload_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            replays_dir: PathBuf::from("replays"),
            max_parallel_uploads: 2,
            upload_attempts: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

fn replay_file_name(match_id: u32, extension: &str) -> String {
    format!("M{match_id}.{extension}")
}

pub struct ReplayCoordinator {
    settings: ReplaySettings,
    uploader: Arc<dyn ReplayUploader>,
    sink: Arc<dyn ReplayStatusSink>,
    uploads: Arc<Semaphore>,
    /// Successful uploads by `(match_id, extension)`, for the
    /// already-uploaded fast path.
    completed: parking_lot::Mutex<HashMap<(u32, String), String>>,
    bus: Arc<EventBus>,
}

impl ReplayCoordinator {
    pub fn new(
        settings: ReplaySettings,
        uploader: Arc<dyn ReplayUploader>,
        sink: Arc<dyn ReplayStatusSink>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let uploads = Arc::new(Semaphore::new(settings.max_parallel_uploads));
        Arc::new(Self {
            settings,
            uploader,
            sink,
            uploads,
            completed: parking_lot::Mutex::new(HashMap::new()),
            bus,
        })
    }

    pub fn replay_path(&self, match_id: u32, extension: &str) -> PathBuf {
        self.settings
            .replays_dir
            .join(replay_file_name(match_id, extension))
    }

    /// Services one `0x1704` request end to end, reporting every step.
    pub async fn handle_request(&self, request: ReplayRequest) {
        let match_id = request.match_id;
        let account_id = request.account_id;

        self.bus.dispatch(
            None,
            GameEventKind::ReplayRequested {
                match_id,
                account_id,
            },
        );

        let path = self.replay_path(match_id, &request.extension);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(match_id, path = %path.display(), "replay not on disk");
            self.report(match_id, account_id, UploadStatus::NotFound, None)
                .await;
            return;
        }

        let key = (match_id, request.extension.clone());
        let cached = self.completed.lock().get(&key).cloned();
        if let Some(link) = cached {
            debug!(match_id, "replay already uploaded");
            self.report(
                match_id,
                account_id,
                UploadStatus::AlreadyUploaded,
                Some(&link),
            )
            .await;
            return;
        }

        self.report(match_id, account_id, UploadStatus::InQueue, None)
            .await;

        let Ok(_permit) = self.uploads.acquire().await else {
            return;
        };

        self.report(match_id, account_id, UploadStatus::Uploading, None)
            .await;
        self.report(match_id, account_id, UploadStatus::UploadingNow, None)
            .await;

        let mut backoff = self.settings.retry_backoff;
        for attempt in 1..=self.settings.upload_attempts {
            match self.uploader.upload(&path, &request).await {
                Ok(link) => {
                    info!(match_id, link, "replay uploaded");
                    self.completed.lock().insert(key, link.clone());
                    self.report(
                        match_id,
                        account_id,
                        UploadStatus::UploadComplete,
                        Some(&link),
                    )
                    .await;
                    self.bus
                        .dispatch(None, GameEventKind::ReplayUploaded { match_id });
                    return;
                }
                Err(e) => {
                    warn!(match_id, attempt, "replay upload failed: {e}");
                    if attempt < self.settings.upload_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        self.report(match_id, account_id, UploadStatus::NotFound, None)
            .await;
    }

    async fn report(
        &self,
        match_id: u32,
        account_id: u32,
        status: UploadStatus,
        link: Option<&str>,
    ) {
        self.sink.report(match_id, account_id, status, link).await;
    }

    /// Drains the opaque `0x4A` blobs instances forward. The payload has no
    /// documented layout; the tap exists so the progress is visible in the
    /// logs.
    pub fn spawn_update_intake(
        &self,
        updates: flume::Receiver<(u32, Vec<u8>)>,
        parent: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let token = parent.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    res = updates.recv_async() => match res {
                        Ok((instance_id, data)) => {
                            trace!(
                                instance_id,
                                len = data.len(),
                                "replay update from instance"
                            );
                        }
                        Err(_) => return,
                    },
                }
            }
        })
    }
}
