//! Linux `SlotStore` adapter: reads the U-Boot-style environment Nerves
//! firmware slots are conventionally recorded in, via `fw_printenv`.

use nh_agent_core::error::{FlashError, FlashResult};
use nh_agent_core::hal::SlotStore;
use nh_agent_core::types::SlotSnapshot;
use tokio::process::Command;
use tracing::warn;

/// Reads slot state from `fw_printenv` output, falling back to an all-empty
/// snapshot if the tool is unavailable (e.g. running off-target in CI).
pub struct UBootSlotStore {
    fw_printenv_path: String,
}

impl UBootSlotStore {
    pub fn new(fw_printenv_path: impl Into<String>) -> Self {
        Self {
            fw_printenv_path: fw_printenv_path.into(),
        }
    }
}

#[async_trait::async_trait]
impl SlotStore for UBootSlotStore {
    async fn snapshot(&self) -> FlashResult<SlotSnapshot> {
        let output = Command::new(&self.fw_printenv_path).output().await;
        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(status = %output.status, "fw_printenv exited non-zero, reporting an empty slot snapshot");
                return Ok(SlotSnapshot::default());
            }
            Err(err) => {
                warn!(%err, "fw_printenv unavailable, reporting an empty slot snapshot");
                return Ok(SlotSnapshot::default());
            }
        };

        let text = String::from_utf8(output.stdout).map_err(|e| FlashError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        Ok(parse_env(&text))
    }
}

fn parse_env(text: &str) -> SlotSnapshot {
    let mut env = std::collections::HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }

    let active = env.get("nerves_fw_active").cloned();
    let prefix = active.as_deref().unwrap_or("a");

    SlotSnapshot {
        nerves_fw_active: active.clone(),
        nerves_fw_uuid: env.get(&format!("{prefix}.nerves_fw_uuid")).cloned(),
        nerves_fw_validated: env
            .get(&format!("{prefix}.nerves_fw_validated"))
            .map(|v| v == "1")
            .unwrap_or(false),
        nerves_fw_platform: env.get(&format!("{prefix}.nerves_fw_platform")).cloned(),
        nerves_fw_architecture: env.get(&format!("{prefix}.nerves_fw_architecture")).cloned(),
        nerves_fw_devpath: env.get("nerves_fw_devpath").cloned(),
        firmware_auto_revert_detected: env
            .get("nerves_fw_auto_revert_detected")
            .map(|v| v == "1")
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_active_slot_fields() {
        let text = "nerves_fw_active=a\na.nerves_fw_uuid=U1\na.nerves_fw_validated=1\na.nerves_fw_platform=rpi4\n";
        let snapshot = parse_env(text);
        assert_eq!(snapshot.nerves_fw_active.as_deref(), Some("a"));
        assert_eq!(snapshot.nerves_fw_uuid.as_deref(), Some("U1"));
        assert!(snapshot.nerves_fw_validated);
        assert_eq!(snapshot.nerves_fw_platform.as_deref(), Some("rpi4"));
    }

    #[test]
    fn defaults_to_slot_a_when_active_is_unset() {
        let snapshot = parse_env("a.nerves_fw_uuid=U2\n");
        assert_eq!(snapshot.nerves_fw_uuid.as_deref(), Some("U2"));
    }

    #[test]
    fn detects_auto_revert_flag() {
        let snapshot = parse_env("nerves_fw_auto_revert_detected=1\n");
        assert!(snapshot.firmware_auto_revert_detected);
    }
}
