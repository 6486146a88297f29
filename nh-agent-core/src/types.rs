use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata describing a firmware image, as reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareMetadata {
    pub architecture: String,
    pub platform: String,
    pub product: String,
    pub uuid: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub build_tool_version: Option<String>,
    #[serde(default)]
    pub misc: Option<String>,
    #[serde(default)]
    pub vcs_identifier: Option<String>,
}

/// A pending firmware update as announced on the `device` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub firmware_url: String,
    pub firmware_meta: FirmwareMetadata,
}

/// A pending auxiliary archive as announced on the `device` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub uuid: String,
    pub url: String,
    pub size: u64,
    pub architecture: String,
    pub platform: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Snapshot of the slot key-value store consumed by the channel client on
/// every (re)join. The store itself is an external collaborator; the agent
/// only ever reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub nerves_fw_active: Option<String>,
    pub nerves_fw_uuid: Option<String>,
    pub nerves_fw_validated: bool,
    pub nerves_fw_platform: Option<String>,
    pub nerves_fw_architecture: Option<String>,
    pub nerves_fw_devpath: Option<String>,
    pub firmware_auto_revert_detected: bool,
}

/// Parameters reported on every `device` topic join, per spec 4.1 / 10.
/// `firmware_auto_revert_detected` is carried on the flattened slot
/// snapshot rather than duplicated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceJoinParams {
    #[serde(flatten)]
    pub slot: SlotSnapshot,
    pub currently_downloading_uuid: Option<String>,
    pub firmware_validated: bool,
}

/// A named network interface observation, used to detect interface changes
/// mid-connection (`network_interface_mismatch`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub address: String,
}

/// A PEM-encoded public key used for firmware or archive signature
/// verification. Opaque to this crate beyond being handed to the flasher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(pub String);

/// The current set of public keys accepted for a given verification purpose.
/// Replaced atomically on `fwup_public_keys` / `archive_public_keys`.
#[derive(Debug, Clone, Default)]
pub struct PublicKeySet(pub Vec<PublicKey>);

impl PublicKeySet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublicKey> {
        self.0.iter()
    }
}

/// Outcome of a flasher progress report, forwarded to the policy and, after
/// throttling, to the server as `fwup_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FwupStage {
    Downloading,
    Updating,
}

impl std::fmt::Display for FwupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FwupStage::Downloading => write!(f, "downloading"),
            FwupStage::Updating => write!(f, "updating"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwupProgress {
    pub stage: FwupStage,
    pub value: u8,
}

/// Terminal / intermediate status reported back to the server for an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusUpdate {
    Received,
    Completed,
    Ignored { reason: Option<String> },
    Rescheduled { in_ms: u64 },
    Failed { reason: String },
}

/// Result of a script execution, returned on `scripts/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScriptOutcome {
    Completed { r#return: String, output: String },
    Error { r#return: String, reason: String, output: String },
}

/// A single registered extension and its attachment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionEntry {
    pub name: String,
    pub version: String,
    pub attached: bool,
}
