use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::alarms::{Alarm, AlarmSet};
use crate::archive_manager::ArchiveManager;
use crate::channel::ChannelClient;
use crate::channel::extensions::ExtensionsRegistry;
use crate::config::Config;
use crate::downloader::Downloader;
use crate::error::AgentResult;
use crate::hal::{Flasher, NetworkObserver, SlotStore};
use crate::policy::Policy;
use crate::update_manager::UpdateManager;

/// Starts and owns the agent's long-lived components in the fixed order
/// required by spec 3/5: extensions registry, then `UpdateManager`, then
/// `ArchiveManager`, then the channel client. Shutdown tears down in
/// reverse by simply dropping the `Supervisor` once `run` returns.
pub struct Supervisor {
    client: Arc<ChannelClient>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Supervisor {
    /// Assembles every long-lived component from `config` and the
    /// caller-supplied platform adapters. Does not connect yet; call
    /// `run` to start the channel client's connect/event loop.
    pub async fn start(
        config: Arc<Config>,
        policy: Arc<dyn Policy>,
        flasher: Arc<dyn Flasher>,
        slot_store: Arc<dyn SlotStore>,
        network: Arc<dyn NetworkObserver>,
    ) -> AgentResult<Self> {
        config.validate()?;

        let alarms = Arc::new(AlarmSet::new());

        let snapshot = slot_store.snapshot().await?;
        if snapshot.firmware_auto_revert_detected {
            warn!("boot-loader reported a firmware auto-revert");
            alarms.set(Alarm::FirmwareReverted);
        }

        let extensions = Arc::new(ExtensionsRegistry::new(
            config.extensions_allow_list.iter().cloned().collect(),
        ));

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let update_manager = Arc::new(UpdateManager::new(
            Arc::clone(&policy),
            Arc::clone(&flasher),
            Arc::new(Downloader::new(config.retry.clone())),
            Arc::clone(&alarms),
            config.data_dir.clone(),
            config.updater_strategy,
            config.flasher_task.clone(),
            config.flasher_env.clone(),
            status_tx,
            progress_tx,
        ));

        let archive_manager = Arc::new(ArchiveManager::new(
            Arc::clone(&policy),
            Arc::clone(&flasher),
            Arc::new(Downloader::new(config.retry.clone())),
            config.data_dir.clone(),
        ));

        let client = Arc::new(ChannelClient::new(
            Arc::clone(&config),
            policy,
            update_manager,
            archive_manager,
            extensions,
            slot_store,
            network,
            alarms,
            status_rx,
            progress_rx,
        ));

        Ok(Self {
            client,
            shutdown_tx: Mutex::new(None),
        })
    }

    /// Runs the channel client's connect/rejoin loop until `stop` is called
    /// or the process is torn down. Returns once the loop has observed the
    /// shutdown signal.
    pub async fn run(&self) {
        let (tx, rx) = mpsc::channel(1);
        *self.shutdown_tx.lock().await = Some(tx);
        info!("supervisor starting channel client");
        Arc::clone(&self.client).run(rx).await;
    }

    /// Signals `run` to stop. A no-op if `run` was never called or already
    /// returned.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::hal::FlasherEvent;
    use crate::policy::DefaultPolicy;
    use crate::types::{NetworkInterface, SlotSnapshot};
    use std::time::Duration;

    struct NoopFlasher;

    #[async_trait::async_trait]
    impl Flasher for NoopFlasher {
        async fn write_stream(
            &self,
            _task: &str,
            _env: &[(String, String)],
        ) -> crate::error::FlashResult<(
            mpsc::Sender<Vec<u8>>,
            mpsc::Receiver<FlasherEvent>,
        )> {
            let (tx, rx) = mpsc::channel(1);
            Ok((tx, rx))
        }

        async fn verify(&self, _path: &std::path::Path, _public_key_pem: &str) -> crate::error::FlashResult<bool> {
            Ok(true)
        }
    }

    struct StaticSlotStore;

    #[async_trait::async_trait]
    impl SlotStore for StaticSlotStore {
        async fn snapshot(&self) -> crate::error::FlashResult<SlotSnapshot> {
            Ok(SlotSnapshot {
                firmware_auto_revert_detected: true,
                ..Default::default()
            })
        }
    }

    struct StaticNetworkObserver;

    #[async_trait::async_trait]
    impl NetworkObserver for StaticNetworkObserver {
        async fn current_interface(&self, _server_host: &str) -> crate::error::FlashResult<NetworkInterface> {
            Ok(NetworkInterface {
                name: "eth0".into(),
                address: "127.0.0.1".into(),
            })
        }
    }

    fn base_config() -> Config {
        Config {
            server_url: "wss://example.test/socket".into(),
            sni: None,
            auth: AuthConfig::SharedSecret {
                key_id: "k1".into(),
                secret: "s3cr3t".into(),
                digest: "sha256".into(),
                iterations: 10,
                key_length: 16,
            },
            firmware_device_path: "/dev/mmcblk0".into(),
            flasher_task: "upgrade".into(),
            flasher_env: Vec::new(),
            fwup_public_keys: Vec::new(),
            archive_public_keys: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            rejoin_delay: Duration::from_secs(5),
            reconnect_backoff_ms: vec![1000, 2000, 4000],
            remote_shell_enabled: false,
            remote_shell_idle_timeout: Duration::from_secs(60),
            extensions_allow_list: std::collections::HashSet::new(),
            retry: Default::default(),
            data_dir: "/tmp/nh-agent-supervisor-test".into(),
            wait_for_network: false,
            updater_strategy: Default::default(),
        }
    }

    #[tokio::test]
    async fn assembly_raises_firmware_reverted_alarm_from_slot_snapshot() {
        let supervisor = Supervisor::start(
            Arc::new(base_config()),
            Arc::new(DefaultPolicy),
            Arc::new(NoopFlasher),
            Arc::new(StaticSlotStore),
            Arc::new(StaticNetworkObserver),
        )
        .await
        .unwrap();

        assert!(supervisor.client.alarms().is_set(Alarm::FirmwareReverted));
    }
}
