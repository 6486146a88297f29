use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alarms::{Alarm, AlarmSet};
use crate::downloader::{DownloadHandler, Downloader, HandlerAction};
use crate::error::{AgentError, AgentResult, FlashError};
use crate::hal::{Flasher, FlasherEvent};
use crate::policy::{FwupMessage, Policy, UpdateDecision};
use crate::types::{FwupProgress, FwupStage, PublicKeySet, StatusUpdate, UpdateInfo};

/// Current lifecycle state of a single firmware update, per spec 3 / 4.2.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateState {
    Idle,
    Downloading { percent: u8 },
    Updating { percent: u8 },
    Done,
    Rescheduled,
    FwupError { message: String },
}

/// Whether downloaded bytes are piped straight to the flasher or cached to
/// disk first, per spec 4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdaterStrategy {
    Streaming,
    Caching,
}

impl Default for UpdaterStrategy {
    fn default() -> Self {
        UpdaterStrategy::Streaming
    }
}

/// Drives one firmware update through its state machine: consults policy,
/// downloads, and streams bytes into the flasher. Exactly one instance is
/// active per device; `apply_update` is idempotent while already updating.
pub struct UpdateManager {
    policy: Arc<dyn Policy>,
    flasher: Arc<dyn Flasher>,
    downloader: Arc<Downloader>,
    alarms: Arc<AlarmSet>,
    data_dir: PathBuf,
    strategy: UpdaterStrategy,
    flasher_task: String,
    flasher_env: Vec<(String, String)>,
    state: Mutex<UpdateState>,
    reschedule_handle: Mutex<Option<JoinHandle<()>>>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    progress_tx: mpsc::UnboundedSender<FwupProgress>,
}

impl UpdateManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: Arc<dyn Policy>,
        flasher: Arc<dyn Flasher>,
        downloader: Arc<Downloader>,
        alarms: Arc<AlarmSet>,
        data_dir: PathBuf,
        strategy: UpdaterStrategy,
        flasher_task: String,
        flasher_env: Vec<(String, String)>,
        status_tx: mpsc::UnboundedSender<StatusUpdate>,
        progress_tx: mpsc::UnboundedSender<FwupProgress>,
    ) -> Self {
        Self {
            policy,
            flasher,
            downloader,
            alarms,
            data_dir,
            strategy,
            flasher_task,
            flasher_env,
            state: Mutex::new(UpdateState::Idle),
            reschedule_handle: Mutex::new(None),
            status_tx,
            progress_tx,
        }
    }

    pub async fn state(&self) -> UpdateState {
        self.state.lock().await.clone()
    }

    /// Implements the `apply_update` contract of spec 4.2: idempotent while
    /// updating, consults policy otherwise, and cancels any previous
    /// reschedule timer before arming a new one.
    pub async fn apply_update(
        self: &Arc<Self>,
        update: UpdateInfo,
        public_keys: PublicKeySet,
    ) -> AgentResult<UpdateState> {
        {
            let state = self.state.lock().await;
            if matches!(*state, UpdateState::Updating { .. }) {
                debug!(uuid = %update.firmware_meta.uuid, "update already in progress, ignoring duplicate notification");
                return Ok(state.clone());
            }
        }

        self.cancel_reschedule().await;

        match self.policy.update_available(&update).await {
            UpdateDecision::Apply => self.start(update, public_keys).await,
            UpdateDecision::Ignore { reason } => {
                info!(uuid = %update.firmware_meta.uuid, ?reason, "update ignored by policy");
                let _ = self.status_tx.send(StatusUpdate::Ignored { reason });
                *self.state.lock().await = UpdateState::Idle;
                Ok(UpdateState::Idle)
            }
            UpdateDecision::Reschedule { after, reason } => {
                if let Some(reason) = &reason {
                    debug!(%reason, "update rescheduled");
                }
                let _ = self.status_tx.send(StatusUpdate::Rescheduled {
                    in_ms: after.as_millis() as u64,
                });
                self.arm_reschedule(update, public_keys, after).await;
                *self.state.lock().await = UpdateState::Rescheduled;
                Ok(UpdateState::Rescheduled)
            }
        }
    }

    async fn arm_reschedule(self: &Arc<Self>, update: UpdateInfo, keys: PublicKeySet, after: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Err(err) = this.apply_update(update, keys).await {
                warn!(%err, "rescheduled update failed");
            }
        });
        let mut slot = self.reschedule_handle.lock().await;
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    async fn cancel_reschedule(&self) {
        if let Some(handle) = self.reschedule_handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn start(self: &Arc<Self>, update: UpdateInfo, public_keys: PublicKeySet) -> AgentResult<UpdateState> {
        let _ = public_keys; // hot-swapped keys apply to in-flight flasher runs unchanged, per spec 4.2

        self.alarms.set(Alarm::UpdateInProgress);
        *self.state.lock().await = UpdateState::Downloading { percent: 0 };
        let _ = self.status_tx.send(StatusUpdate::Received);

        let basename = format!("{}.fw", update.firmware_meta.uuid);
        let resume_from = match self.strategy {
            UpdaterStrategy::Streaming => 0,
            UpdaterStrategy::Caching => self.purge_other_cached_files(&basename).await.unwrap_or(0),
        };

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(1);
        let (flasher_tx, mut flasher_events) = self
            .flasher
            .write_stream(&self.flasher_task, &self.flasher_env)
            .await
            .map_err(AgentError::Flash)?;

        let feed_task = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                if flasher_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        let strategy = self.strategy;
        let cache_path = self.cache_path(&basename);
        let this = Arc::clone(self);
        let url = update.firmware_url.clone();
        let progress_tx = self.progress_tx.clone();
        let download_task: JoinHandle<AgentResult<()>> = tokio::spawn(async move {
            let mut handler = StreamingHandler {
                chunk_tx,
                strategy,
                cache_path,
                file: None,
                progress_tx,
                last_percent: None,
            };
            this.downloader.run(&url, resume_from, &mut handler).await?;
            handler.finalize().await?;
            Ok(())
        });

        let result = self.drain_flasher_events(&mut flasher_events).await;

        let _ = feed_task.await;
        match download_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "download task reported an error after flasher exited"),
            Err(join_err) => warn!(%join_err, "download task panicked"),
        }

        result
    }

    async fn drain_flasher_events(
        self: &Arc<Self>,
        flasher_events: &mut mpsc::Receiver<FlasherEvent>,
    ) -> AgentResult<UpdateState> {
        let mut last_reported: Option<u8> = None;
        let mut last_sent_at = tokio::time::Instant::now()
            .checked_sub(Duration::from_millis(500))
            .unwrap_or_else(tokio::time::Instant::now);

        while let Some(event) = flasher_events.recv().await {
            let message = match &event {
                FlasherEvent::Progress(p) => FwupMessage::Progress(*p),
                FlasherEvent::Ok => FwupMessage::Ok,
                FlasherEvent::Error { code, message } => FwupMessage::Error {
                    code: *code,
                    message: message.clone(),
                },
            };
            self.policy.handle_fwup_message(&message).await;

            match event {
                FlasherEvent::Progress(percent) => {
                    *self.state.lock().await = UpdateState::Updating { percent };
                    if last_reported != Some(percent) && last_sent_at.elapsed() >= Duration::from_millis(500) {
                        last_reported = Some(percent);
                        last_sent_at = tokio::time::Instant::now();
                        let _ = self.progress_tx.send(FwupProgress {
                            stage: FwupStage::Updating,
                            value: scale_updating(percent),
                        });
                    }
                }
                FlasherEvent::Ok => {
                    *self.state.lock().await = UpdateState::Done;
                    self.alarms.clear(Alarm::UpdateInProgress);
                    let _ = self.progress_tx.send(FwupProgress {
                        stage: FwupStage::Updating,
                        value: 100,
                    });
                    let _ = self.status_tx.send(StatusUpdate::Completed);
                    self.policy.reboot().await;
                    return Ok(UpdateState::Done);
                }
                FlasherEvent::Error { code, message } => {
                    *self.state.lock().await = UpdateState::FwupError { message: message.clone() };
                    self.alarms.clear(Alarm::UpdateInProgress);
                    let _ = self.status_tx.send(StatusUpdate::Failed { reason: message.clone() });
                    return Err(AgentError::Flash(FlashError::Process {
                        code: Some(code),
                        message,
                    }));
                }
            }
        }

        Ok(self.state.lock().await.clone())
    }

    fn cache_path(&self, basename: &str) -> PathBuf {
        self.data_dir.join("firmware").join(basename)
    }

    /// Purges any stale cached file other than `basename` before a new
    /// caching-strategy download starts, per spec 4.2, returning the byte
    /// offset to resume from if a matching `.partial` file survives.
    async fn purge_other_cached_files(&self, basename: &str) -> std::io::Result<u64> {
        let dir = self.data_dir.join("firmware");
        tokio::fs::create_dir_all(&dir).await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut resumed = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if name == format!("{basename}.partial") {
                resumed = entry.metadata().await?.len();
            } else if name != basename {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(resumed)
    }
}

/// Feeds downloaded bytes into the flasher (streaming strategy) or a
/// `.partial` cache file (caching strategy), renaming to its final name on
/// completion.
struct StreamingHandler {
    chunk_tx: mpsc::Sender<Vec<u8>>,
    strategy: UpdaterStrategy,
    cache_path: PathBuf,
    file: Option<tokio::fs::File>,
    progress_tx: mpsc::UnboundedSender<FwupProgress>,
    last_percent: Option<u8>,
}

impl StreamingHandler {
    async fn finalize(&mut self) -> AgentResult<()> {
        if self.strategy == UpdaterStrategy::Caching {
            use tokio::io::AsyncWriteExt;
            if let Some(mut file) = self.file.take() {
                file.flush().await?;
            }
            let partial = partial_path(&self.cache_path);
            tokio::fs::rename(&partial, &self.cache_path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DownloadHandler for StreamingHandler {
    async fn on_data(&mut self, bytes: &[u8], percent: u8) -> HandlerAction {
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            let _ = self.progress_tx.send(FwupProgress {
                stage: FwupStage::Downloading,
                value: scale_downloading(percent),
            });
        }
        match self.strategy {
            UpdaterStrategy::Streaming => {
                if self.chunk_tx.send(bytes.to_vec()).await.is_err() {
                    return HandlerAction::Abort("flasher channel closed".into());
                }
            }
            UpdaterStrategy::Caching => {
                use tokio::io::AsyncWriteExt;
                if self.file.is_none() {
                    let partial = partial_path(&self.cache_path);
                    match tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&partial)
                        .await
                    {
                        Ok(file) => self.file = Some(file),
                        Err(err) => return HandlerAction::Abort(err.to_string()),
                    }
                }
                if let Some(file) = self.file.as_mut() {
                    if let Err(err) = file.write_all(bytes).await {
                        return HandlerAction::Abort(err.to_string());
                    }
                }
            }
        }
        HandlerAction::Continue
    }

    async fn on_complete(&mut self) {}
}

/// Maps a raw download percent (0-100) onto the first half of the overall
/// `fwup_progress` range, so downloading and updating together form one
/// monotonic 0-100 stream instead of two independent ones.
fn scale_downloading(percent: u8) -> u8 {
    ((percent as u32 * 50) / 100) as u8
}

/// Maps a raw flasher percent (0-100) onto the second half of the overall
/// `fwup_progress` range.
fn scale_updating(percent: u8) -> u8 {
    50 + ((percent as u32 * 50) / 100) as u8
}

fn partial_path(final_path: &std::path::Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    final_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_appends_suffix() {
        let final_path = PathBuf::from("/data/firmware/U1.fw");
        assert_eq!(partial_path(&final_path), PathBuf::from("/data/firmware/U1.fw.partial"));
    }

    #[test]
    fn caching_strategy_is_distinct_from_streaming() {
        assert_ne!(UpdaterStrategy::Streaming, UpdaterStrategy::Caching);
    }
}
