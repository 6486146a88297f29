use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::downloader::{DownloadHandler, Downloader, HandlerAction};
use crate::error::{ArchiveError, ArchiveResult};
use crate::hal::Flasher;
use crate::policy::{ArchiveDecision, Policy};
use crate::types::{ArchiveInfo, PublicKeySet};

/// Lifecycle of a single archive, per spec 3 / 4.4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveState {
    Idle,
    Downloading,
    Verifying,
    Ready,
    Invalid,
}

/// Downloads an optional archive, then verifies its signature before
/// surfacing it to the application. Structurally similar to `UpdateManager`
/// but ends in a signature check rather than a streaming install.
pub struct ArchiveManager {
    policy: Arc<dyn Policy>,
    flasher: Arc<dyn Flasher>,
    downloader: Arc<Downloader>,
    data_dir: PathBuf,
    state: Mutex<ArchiveState>,
}

impl ArchiveManager {
    pub fn new(policy: Arc<dyn Policy>, flasher: Arc<dyn Flasher>, downloader: Arc<Downloader>, data_dir: PathBuf) -> Self {
        Self {
            policy,
            flasher,
            downloader,
            data_dir,
            state: Mutex::new(ArchiveState::Idle),
        }
    }

    pub async fn state(&self) -> ArchiveState {
        self.state.lock().await.clone()
    }

    /// Implements spec 4.4: consult `archive_available`, download on
    /// `download`, verify against every configured archive public key,
    /// accepting on any success.
    pub async fn apply_archive(&self, archive: ArchiveInfo, public_keys: PublicKeySet) -> ArchiveResult<()> {
        match self.policy.archive_available(&archive).await {
            ArchiveDecision::Download => {}
            ArchiveDecision::Ignore => {
                *self.state.lock().await = ArchiveState::Idle;
                return Ok(());
            }
            ArchiveDecision::Reschedule { after } => {
                info!(uuid = %archive.uuid, delay_ms = after.as_millis() as u64, "archive download rescheduled");
                *self.state.lock().await = ArchiveState::Idle;
                return Ok(());
            }
        }

        *self.state.lock().await = ArchiveState::Downloading;

        let basename = archive.uuid.clone();
        let final_path = self.data_dir.join("archives").join(&basename);
        let download_path = download_tmp_path(&final_path);
        tokio::fs::create_dir_all(final_path.parent().unwrap()).await.map_err(ArchiveError::Io)?;

        let mut handler = ArchiveDownloadHandler {
            file: tokio::fs::File::create(&download_path).await.map_err(ArchiveError::Io)?,
        };
        self.downloader.run(&archive.url, 0, &mut handler).await?;

        tokio::fs::rename(&download_path, &final_path).await.map_err(ArchiveError::Io)?;

        *self.state.lock().await = ArchiveState::Verifying;
        if public_keys.is_empty() {
            // Spec open question: the source logs but performs no check here.
            warn!(uuid = %archive.uuid, "no archive public keys configured, accepting unverified archive");
            *self.state.lock().await = ArchiveState::Ready;
            self.policy.archive_ready(&archive, &final_path).await;
            return Ok(());
        }

        let mut verified = false;
        for key in public_keys.iter() {
            match self.flasher.verify(&final_path, &key.0).await {
                Ok(true) => {
                    verified = true;
                    break;
                }
                Ok(false) => continue,
                Err(err) => warn!(%err, "archive verification attempt failed"),
            }
        }

        if verified {
            *self.state.lock().await = ArchiveState::Ready;
            self.policy.archive_ready(&archive, &final_path).await;
            Ok(())
        } else {
            *self.state.lock().await = ArchiveState::Invalid;
            warn!(uuid = %archive.uuid, "archive signature verification failed, discarding");
            let _ = tokio::fs::remove_file(&final_path).await;
            Err(ArchiveError::InvalidSignature)
        }
    }
}

struct ArchiveDownloadHandler {
    file: tokio::fs::File,
}

#[async_trait]
impl DownloadHandler for ArchiveDownloadHandler {
    async fn on_data(&mut self, bytes: &[u8], _percent: u8) -> HandlerAction {
        use tokio::io::AsyncWriteExt;
        match self.file.write_all(bytes).await {
            Ok(()) => HandlerAction::Continue,
            Err(err) => HandlerAction::Abort(err.to_string()),
        }
    }

    async fn on_complete(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.file.flush().await;
    }
}

fn download_tmp_path(final_path: &std::path::Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".download");
    final_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_tmp_path_appends_suffix() {
        let final_path = PathBuf::from("/data/archives/A1");
        assert_eq!(download_tmp_path(&final_path), PathBuf::from("/data/archives/A1.download"));
    }
}
