//! Hand-rolled mock platform adapters, in the call-recording style the
//! teacher uses for its own mock HAL: each mock wraps its state in
//! `Arc<Mutex<..>>` so a test can both drive behavior and assert on what was
//! called, without pulling in a mocking framework.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use nh_agent_core::hal::{Flasher, FlasherEvent, NetworkObserver, SlotStore};
use nh_agent_core::policy::{ArchiveDecision, FwupMessage, Policy, UpdateDecision};
use nh_agent_core::types::{ArchiveInfo, NetworkInterface, SlotSnapshot, UpdateInfo};
use nh_agent_core::{FlashError, FlashResult};

/// A scripted flasher: `write_stream` replays a fixed sequence of events
/// after echoing every chunk fed to it into `received`, and `verify` answers
/// according to a configured signature outcome.
pub struct ScriptedFlasher {
    events: Vec<FlasherEvent>,
    verify_result: bool,
    pub received: Arc<Mutex<Vec<u8>>>,
    pub write_stream_calls: Arc<Mutex<u32>>,
}

impl ScriptedFlasher {
    pub fn new(events: Vec<FlasherEvent>) -> Self {
        Self {
            events,
            verify_result: true,
            received: Arc::new(Mutex::new(Vec::new())),
            write_stream_calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_verify_result(mut self, verify_result: bool) -> Self {
        self.verify_result = verify_result;
        self
    }
}

#[async_trait]
impl Flasher for ScriptedFlasher {
    async fn write_stream(
        &self,
        _task: &str,
        _env: &[(String, String)],
    ) -> FlashResult<(
        tokio::sync::mpsc::Sender<Vec<u8>>,
        tokio::sync::mpsc::Receiver<FlasherEvent>,
    )> {
        *self.write_stream_calls.lock().await += 1;

        let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(8);
        let (event_tx, event_rx) = tokio::sync::mpsc::channel::<FlasherEvent>(8);
        let received = Arc::clone(&self.received);
        let events = self.events.clone();

        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                received.lock().await.extend_from_slice(&chunk);
            }
            for event in events {
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok((chunk_tx, event_rx))
    }

    async fn verify(&self, _path: &Path, _public_key_pem: &str) -> FlashResult<bool> {
        Ok(self.verify_result)
    }
}

/// A flasher whose `write_stream` always fails, for exercising the
/// `FlashError::AlreadyRunning` / propagation paths without touching a real
/// device.
pub struct FailingFlasher;

#[async_trait]
impl Flasher for FailingFlasher {
    async fn write_stream(
        &self,
        _task: &str,
        _env: &[(String, String)],
    ) -> FlashResult<(
        tokio::sync::mpsc::Sender<Vec<u8>>,
        tokio::sync::mpsc::Receiver<FlasherEvent>,
    )> {
        Err(FlashError::Process {
            code: Some(1),
            message: "mock flasher refused to start".into(),
        })
    }

    async fn verify(&self, _path: &Path, _public_key_pem: &str) -> FlashResult<bool> {
        Ok(false)
    }
}

/// A fixed slot snapshot, for tests that don't care about slot-store
/// behavior beyond handing the supervisor something to read at startup.
pub struct StaticSlotStore(pub SlotSnapshot);

impl StaticSlotStore {
    pub fn validated() -> Self {
        Self(SlotSnapshot {
            nerves_fw_active: Some("a".into()),
            nerves_fw_uuid: Some("U0".into()),
            nerves_fw_validated: true,
            nerves_fw_platform: Some("rpi".into()),
            nerves_fw_architecture: Some("arm".into()),
            nerves_fw_devpath: Some("/dev/mmcblk0".into()),
            firmware_auto_revert_detected: false,
        })
    }
}

#[async_trait]
impl SlotStore for StaticSlotStore {
    async fn snapshot(&self) -> FlashResult<SlotSnapshot> {
        Ok(self.0.clone())
    }
}

/// Always reports the same interface, regardless of `server_host`.
pub struct StaticNetworkObserver(pub NetworkInterface);

#[async_trait]
impl NetworkObserver for StaticNetworkObserver {
    async fn current_interface(&self, _server_host: &str) -> FlashResult<NetworkInterface> {
        Ok(self.0.clone())
    }
}

/// A policy whose `update_available`/`archive_available` decisions are
/// scripted up front and whose calls are recorded, so a scenario test can
/// assert both "what decision did it make" and "how many times was it
/// consulted" (spec 8's "no duplicate Downloader spawned" property).
pub struct RecordingPolicy {
    update_decisions: Mutex<Vec<UpdateDecision>>,
    archive_decisions: Mutex<Vec<ArchiveDecision>>,
    pub update_available_calls: Arc<Mutex<u32>>,
    pub archive_ready_calls: Arc<Mutex<Vec<String>>>,
    pub fwup_messages: Arc<Mutex<Vec<FwupMessage>>>,
}

impl RecordingPolicy {
    pub fn new(update_decisions: Vec<UpdateDecision>, archive_decisions: Vec<ArchiveDecision>) -> Self {
        Self {
            update_decisions: Mutex::new(update_decisions),
            archive_decisions: Mutex::new(archive_decisions),
            update_available_calls: Arc::new(Mutex::new(0)),
            archive_ready_calls: Arc::new(Mutex::new(Vec::new())),
            fwup_messages: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Policy for RecordingPolicy {
    async fn update_available(&self, _update: &UpdateInfo) -> UpdateDecision {
        *self.update_available_calls.lock().await += 1;
        let mut decisions = self.update_decisions.lock().await;
        if decisions.len() > 1 {
            decisions.remove(0)
        } else {
            decisions.first().cloned().unwrap_or(UpdateDecision::Apply)
        }
    }

    async fn archive_available(&self, _archive: &ArchiveInfo) -> ArchiveDecision {
        let mut decisions = self.archive_decisions.lock().await;
        if decisions.len() > 1 {
            decisions.remove(0)
        } else {
            decisions.first().cloned().unwrap_or(ArchiveDecision::Download)
        }
    }

    async fn archive_ready(&self, archive: &ArchiveInfo, _path: &Path) {
        self.archive_ready_calls.lock().await.push(archive.uuid.clone());
    }

    async fn handle_fwup_message(&self, message: &FwupMessage) {
        self.fwup_messages.lock().await.push(message.clone());
    }
}

/// A flasher whose `verify` always rejects, regardless of which key is
/// tried, for scenario 5 ("invalid archive").
pub struct RejectingVerifyFlasher;

#[async_trait]
impl Flasher for RejectingVerifyFlasher {
    async fn write_stream(
        &self,
        _task: &str,
        _env: &[(String, String)],
    ) -> FlashResult<(
        tokio::sync::mpsc::Sender<Vec<u8>>,
        tokio::sync::mpsc::Receiver<FlasherEvent>,
    )> {
        Err(FlashError::Process {
            code: Some(1),
            message: "not used in this scenario".into(),
        })
    }

    async fn verify(&self, _path: &Path, _public_key_pem: &str) -> FlashResult<bool> {
        Ok(false)
    }
}

pub fn idle_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
