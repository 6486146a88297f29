use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::backoff::Backoff;
use crate::types::{ArchiveInfo, NetworkInterface, UpdateInfo};

/// Decision returned by `Policy::update_available`. Anything a misbehaving
/// implementation returns that doesn't fit here is coerced to `Apply` by the
/// caller, per spec 4.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    Apply,
    Ignore { reason: Option<String> },
    Reschedule { after: Duration, reason: Option<String> },
}

/// Decision returned by `Policy::archive_available`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveDecision {
    Download,
    Ignore,
    Reschedule { after: Duration },
}

/// A single progress or lifecycle message surfaced by the external flasher
/// process, forwarded to the policy unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FwupMessage {
    Progress(u8),
    Ok,
    Error { code: i32, message: String },
}

/// User-supplied callbacks that steer the update engine without the engine
/// itself knowing fleet policy. Every slot has a sensible default so a
/// caller only overrides what it cares about, matching the vtable pattern
/// called for in spec 9.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Called when a new firmware update is announced.
    async fn update_available(&self, _update: &UpdateInfo) -> UpdateDecision {
        UpdateDecision::Apply
    }

    /// Called when a new archive is announced.
    async fn archive_available(&self, _archive: &ArchiveInfo) -> ArchiveDecision {
        ArchiveDecision::Download
    }

    /// Called once an archive has been downloaded and its signature verified.
    async fn archive_ready(&self, _archive: &ArchiveInfo, _path: &std::path::Path) {}

    /// Called for every message the flasher process emits.
    async fn handle_fwup_message(&self, _message: &FwupMessage) {}

    /// Called when the channel client or a manager hits an error it cannot
    /// recover from on its own.
    async fn handle_error(&self, _reason: &str) {}

    /// Called when the server asks the device to identify itself (blink an
    /// LED, etc). Left to the caller; default is a no-op.
    async fn identify(&self) {}

    /// Produces the jittered backoff sequence used for reconnects. Override
    /// to flatten thundering-herd reconnect storms across a fleet.
    fn reconnect_backoff(&self) -> Backoff {
        Backoff::default()
    }

    /// Invoked to actually reboot the device after a successful update.
    /// Default logs and returns; a platform adapter overrides this.
    async fn reboot(&self) {
        warn!("policy default reboot() invoked: no-op, override for a real platform");
    }

    /// Whether the currently running firmware has been marked validated.
    fn firmware_validated(&self) -> bool {
        true
    }

    /// Whether the slot store shows an auto-revert happened on last boot.
    fn firmware_auto_revert_detected(&self) -> bool {
        false
    }

    /// Called when the observed network interface diverges from the one
    /// reported at join time.
    async fn network_interface_changed(&self, _previous: &NetworkInterface, _current: &NetworkInterface) {}
}

/// Coerces a policy's raw return into a well-formed `UpdateDecision`,
/// logging when coercion actually changes something. `Policy` trait methods
/// are already typed so in practice this is a defensive identity function;
/// it exists so a future dynamically-loaded policy has one place to funnel
/// through.
pub fn coerce_update_decision(decision: Option<UpdateDecision>) -> UpdateDecision {
    match decision {
        Some(decision) => decision,
        None => {
            warn!("policy returned no update decision, defaulting to apply");
            UpdateDecision::Apply
        }
    }
}

/// A policy that accepts every update and archive immediately, with no
/// extensions behavior. Useful as a baseline in tests and as the default
/// when a caller does not need custom behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

#[async_trait]
impl Policy for DefaultPolicy {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_policy_always_applies() {
        let policy = DefaultPolicy;
        let update = UpdateInfo {
            firmware_url: "http://h/fw.fw".into(),
            firmware_meta: crate::types::FirmwareMetadata {
                architecture: "arm".into(),
                platform: "rpi".into(),
                product: "widget".into(),
                uuid: "U1".into(),
                version: "1.0.0".into(),
                author: None,
                description: None,
                build_tool_version: None,
                misc: None,
                vcs_identifier: None,
            },
        };
        assert_eq!(policy.update_available(&update).await, UpdateDecision::Apply);
    }

    #[test]
    fn missing_decision_coerces_to_apply() {
        assert_eq!(coerce_update_decision(None), UpdateDecision::Apply);
    }
}
