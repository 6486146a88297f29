//! End-to-end scenario tests, one per seed scenario in spec 8, driven
//! against the in-process HTTP server and mock platform adapters in
//! `nh_agent_tests::{http_mock, mocks}` rather than a live fleet server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nh_agent_core::alarms::AlarmSet;
use nh_agent_core::archive_manager::ArchiveManager;
use nh_agent_core::config::RetryConfig;
use nh_agent_core::downloader::{DownloadHandler, Downloader, HandlerAction};
use nh_agent_core::hal::FlasherEvent;
use nh_agent_core::policy::{ArchiveDecision, UpdateDecision};
use nh_agent_core::update_manager::{UpdateManager, UpdateState, UpdaterStrategy};
use nh_agent_core::{ArchiveInfo, FirmwareMetadata, FwupStage, PublicKey, PublicKeySet, StatusUpdate, UpdateInfo};

use nh_agent_tests::http_mock;
use nh_agent_tests::mocks::{RecordingPolicy, RejectingVerifyFlasher, ScriptedFlasher};

fn firmware_meta(uuid: &str) -> FirmwareMetadata {
    FirmwareMetadata {
        architecture: "arm".into(),
        platform: "rpi".into(),
        product: "widget".into(),
        uuid: uuid.into(),
        version: "1.0.0".into(),
        author: None,
        description: None,
        build_tool_version: None,
        misc: None,
        vcs_identifier: None,
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_disconnects: 5,
        idle_timeout: Duration::from_secs(5),
        max_timeout: Duration::from_secs(10),
        time_between_retries: Duration::from_millis(5),
        worst_case_download_speed_bytes_per_sec: 10_000,
    }
}

/// Scenario 1: happy firmware. The server announces an update, the policy
/// applies it, the download completes, and the flasher reports progress
/// through to `Ok`. Expect monotonic `fwup_progress` and a final
/// `status_update(completed)`.
#[tokio::test]
async fn happy_firmware_reports_progress_then_completes() {
    let body = vec![0xABu8; 4096];
    let (url, _server) = http_mock::serve_once(body.clone()).await;

    let flasher = Arc::new(
        ScriptedFlasher::new(vec![
            FlasherEvent::Progress(50),
            FlasherEvent::Progress(100),
            FlasherEvent::Ok,
        ])
        .with_verify_result(true),
    );
    let received = Arc::clone(&flasher.received);

    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel();
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let data_dir = tempfile::tempdir().unwrap();

    let manager = Arc::new(UpdateManager::new(
        Arc::new(nh_agent_core::policy::DefaultPolicy),
        flasher,
        Arc::new(Downloader::new(fast_retry())),
        Arc::new(AlarmSet::new()),
        data_dir.path().to_path_buf(),
        UpdaterStrategy::Streaming,
        "upgrade".into(),
        Vec::new(),
        status_tx,
        progress_tx,
    ));

    let update = UpdateInfo {
        firmware_url: url,
        firmware_meta: firmware_meta("U1"),
    };
    let state = manager.apply_update(update, PublicKeySet::default()).await.unwrap();
    assert_eq!(state, UpdateState::Done);
    assert_eq!(received.lock().await.len(), body.len());

    let mut events = Vec::new();
    while let Ok(progress) = progress_rx.try_recv() {
        events.push((progress.stage, progress.value));
    }
    let values: Vec<u8> = events.iter().map(|(_, v)| *v).collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "progress must be non-decreasing: {values:?}");
    assert!(events.iter().any(|(stage, value)| *stage == FwupStage::Updating && *value == 100));

    let statuses: Vec<_> = std::iter::from_fn(|| status_rx.try_recv().ok()).collect();
    assert!(matches!(statuses.last(), Some(StatusUpdate::Completed)));
}

/// Scenario 2: a server that serves the first half of a file then closes
/// the connection. The downloader must resume with a `Range` request and
/// deliver the full file to the handler.
#[tokio::test]
async fn resume_after_mid_download_reset_delivers_full_file() {
    let body: Vec<u8> = (0u16..2048).map(|b| (b % 256) as u8).collect();
    let (url, _server) = http_mock::serve_resumed(body.clone(), 1024).await;

    struct Collector(Vec<u8>);
    #[async_trait::async_trait]
    impl DownloadHandler for Collector {
        async fn on_data(&mut self, bytes: &[u8], _percent: u8) -> HandlerAction {
            self.0.extend_from_slice(bytes);
            HandlerAction::Continue
        }
        async fn on_complete(&mut self) {}
    }

    let downloader = Downloader::new(fast_retry());
    let mut collector = Collector(Vec::new());
    downloader.run(&url, 0, &mut collector).await.unwrap();

    assert_eq!(collector.0, body);
}

/// Scenario 4: a single redirect is followed transparently to completion.
#[tokio::test]
async fn redirect_is_followed_to_completion() {
    let body = vec![0x42u8; 512];
    let (url, _redirect_server, _final_server) = http_mock::serve_redirect(body.clone()).await;

    struct Collector(Vec<u8>);
    #[async_trait::async_trait]
    impl DownloadHandler for Collector {
        async fn on_data(&mut self, bytes: &[u8], _percent: u8) -> HandlerAction {
            self.0.extend_from_slice(bytes);
            HandlerAction::Continue
        }
        async fn on_complete(&mut self) {}
    }

    let downloader = Downloader::new(fast_retry());
    let mut collector = Collector(Vec::new());
    downloader.run(&url, 0, &mut collector).await.unwrap();

    assert_eq!(collector.0, body);
}

/// Scenario 3: policy reschedules once, then applies on the retry. No
/// second Downloader should be spawned for the first, rescheduled attempt.
#[tokio::test]
async fn policy_reschedule_then_apply_arms_exactly_one_retry() {
    let body = vec![0x01u8; 256];
    let (url, _server) = http_mock::serve_once(body.clone()).await;

    let policy = Arc::new(RecordingPolicy::new(
        vec![
            UpdateDecision::Reschedule { after: Duration::from_millis(30), reason: None },
            UpdateDecision::Apply,
        ],
        vec![],
    ));
    let calls = Arc::clone(&policy.update_available_calls);

    let flasher = Arc::new(ScriptedFlasher::new(vec![FlasherEvent::Progress(100), FlasherEvent::Ok]));
    let (status_tx, _status_rx) = tokio::sync::mpsc::unbounded_channel();
    let (progress_tx, _progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let data_dir = tempfile::tempdir().unwrap();

    let manager = Arc::new(UpdateManager::new(
        policy,
        flasher,
        Arc::new(Downloader::new(fast_retry())),
        Arc::new(AlarmSet::new()),
        data_dir.path().to_path_buf(),
        UpdaterStrategy::Streaming,
        "upgrade".into(),
        Vec::new(),
        status_tx,
        progress_tx,
    ));

    let update = UpdateInfo {
        firmware_url: url,
        firmware_meta: firmware_meta("U2"),
    };
    let state = manager.apply_update(update, PublicKeySet::default()).await.unwrap();
    assert_eq!(state, UpdateState::Rescheduled);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.state().await, UpdateState::Done);
    assert_eq!(*calls.lock().await, 2, "policy should be consulted exactly twice");
}

/// Scenario 5: every configured public key fails verification. The final
/// archive file must be removed and `archive_ready` must never fire.
#[tokio::test]
async fn invalid_archive_signature_discards_file_and_skips_ready() {
    let body = vec![0x09u8; 128];
    let (url, _server) = http_mock::serve_once(body).await;

    let policy = Arc::new(RecordingPolicy::new(vec![], vec![ArchiveDecision::Download]));
    let ready_calls = Arc::clone(&policy.archive_ready_calls);
    let flasher = Arc::new(RejectingVerifyFlasher);
    let data_dir = tempfile::tempdir().unwrap();

    let manager = ArchiveManager::new(
        policy,
        flasher,
        Arc::new(Downloader::new(fast_retry())),
        data_dir.path().to_path_buf(),
    );

    let archive = ArchiveInfo {
        uuid: "A1".into(),
        url,
        size: 128,
        architecture: "arm".into(),
        platform: "rpi".into(),
        version: "1.0.0".into(),
        description: None,
        uploaded_at: chrono::Utc::now(),
    };
    let keys = PublicKeySet(vec![PublicKey("not-a-real-key".into())]);

    let result = manager.apply_archive(archive, keys).await;
    assert!(result.is_err());
    assert!(ready_calls.lock().await.is_empty());

    let final_path: PathBuf = data_dir.path().join("archives").join("A1");
    assert!(!final_path.exists(), "invalid archive must not be left on disk");
}

/// Scenario 6 (reduced to the component the agent owns): a remote shell
/// keeps forwarding stdout until terminated, and a fresh shell can be
/// spawned in its place — the respawn-after-idle-timeout behavior the
/// channel client's event loop drives.
#[tokio::test]
async fn remote_shell_forwards_output_then_can_be_respawned() {
    use nh_agent_core::channel::console::RemoteShell;

    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel(8);
    let mut shell = RemoteShell::spawn(Duration::from_secs(30), out_tx).unwrap();
    shell.write(b"echo hello\n").await.unwrap();

    let output = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
        .await
        .expect("shell produced output before timeout")
        .expect("channel open");
    assert!(String::from_utf8_lossy(&output).contains("hello"));

    shell.terminate().await;

    let (out_tx2, _out_rx2) = tokio::sync::mpsc::channel(8);
    let mut respawned = RemoteShell::spawn(Duration::from_secs(30), out_tx2).unwrap();
    respawned.write(b"echo again\n").await.unwrap();
    respawned.terminate().await;
}
