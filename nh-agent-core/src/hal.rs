use async_trait::async_trait;
use std::path::Path;

use crate::error::FlashResult;
use crate::types::{NetworkInterface, SlotSnapshot};

/// A single message emitted by a running flasher process, in the order
/// they occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlasherEvent {
    Progress(u8),
    Ok,
    Error { code: i32, message: String },
}

/// Adapter to the external block-level firmware writer. Implementations
/// shell out to a real tool (e.g. `fwup` on Linux); the engine never parses
/// or assumes a specific wire format beyond this trait's events.
///
/// The spec treats the flashing tool itself as an external collaborator;
/// this trait is the seam the update/archive managers program against.
#[async_trait]
pub trait Flasher: Send + Sync {
    /// Starts writing `data` to the device, streaming chunks as they are
    /// produced by the caller. `task` selects the flasher's upgrade task
    /// (e.g. `upgrade`); `env` carries any extra environment the flasher
    /// needs (device path, etc). Returns a stream of progress/result events
    /// in the order the flasher process emits them.
    async fn write_stream(
        &self,
        task: &str,
        env: &[(String, String)],
    ) -> FlashResult<(
        tokio::sync::mpsc::Sender<Vec<u8>>,
        tokio::sync::mpsc::Receiver<FlasherEvent>,
    )>;

    /// Verifies a completed file's signature against one public key.
    /// `true` means the signature matched; `false` means it did not (not
    /// an error by itself — the caller tries the next candidate key).
    async fn verify(&self, path: &Path, public_key_pem: &str) -> FlashResult<bool>;
}

/// Read-only view over the persisted slot key-value store. The store
/// itself (a file, a U-Boot environment, etc) is an external collaborator;
/// the agent only ever reads from it.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Returns a snapshot of the keys the channel client reports on join.
    async fn snapshot(&self) -> FlashResult<SlotSnapshot>;
}

/// Discovers the network interface currently used to reach the configured
/// server, so the channel client can detect `network_interface_mismatch`.
#[async_trait]
pub trait NetworkObserver: Send + Sync {
    async fn current_interface(&self, server_host: &str) -> FlashResult<NetworkInterface>;
}
