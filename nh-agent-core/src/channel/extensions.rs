use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExtensionName;
use crate::error::{ExtensionError, ExtensionResult};
use crate::types::ExtensionEntry;

/// Lifecycle of optional side-channels: attach/detach under the
/// `extensions` topic, isolated from the critical update path, per spec
/// 4.5. A crash in an extension's handling must never affect `device`.
pub struct ExtensionsRegistry {
    allow_list: Vec<ExtensionName>,
    entries: Mutex<HashMap<String, ExtensionEntry>>,
}

impl ExtensionsRegistry {
    pub fn new(allow_list: Vec<ExtensionName>) -> Self {
        Self {
            allow_list,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The extensions this device is willing to run, reported on the
    /// extensions topic's own join.
    pub fn allow_list(&self) -> &[ExtensionName] {
        &self.allow_list
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allow_list.iter().any(|n| n.to_string() == name)
    }

    /// Handles `<name>:attach`: starts tracking the extension, rejecting
    /// names outside the allow-list or already attached.
    pub async fn attach(&self, name: &str, version: &str) -> ExtensionResult<()> {
        if !self.is_allowed(name) {
            return Err(ExtensionError::NotAllowed(name.to_string()));
        }
        let mut entries = self.entries.lock().await;
        if entries.get(name).map(|e| e.attached).unwrap_or(false) {
            return Err(ExtensionError::AlreadyAttached(name.to_string()));
        }
        entries.insert(
            name.to_string(),
            ExtensionEntry {
                name: name.to_string(),
                version: version.to_string(),
                attached: true,
            },
        );
        info!(extension = name, version, "extension attached");
        Ok(())
    }

    /// Handles `<name>:detach`.
    pub async fn detach(&self, name: &str) -> ExtensionResult<()> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(name) {
            Some(entry) if entry.attached => {
                entry.attached = false;
                info!(extension = name, "extension detached");
                Ok(())
            }
            Some(_) => Err(ExtensionError::NotAttached(name.to_string())),
            None => Err(ExtensionError::Unknown(name.to_string())),
        }
    }

    /// Routes a `<name>:<event>` payload to the named extension if
    /// attached; rejects pushes from a detached or unknown extension at
    /// the gateway, per spec 4.5.
    pub async fn route(&self, name: &str, event: &str) -> ExtensionResult<()> {
        let entries = self.entries.lock().await;
        match entries.get(name) {
            Some(entry) if entry.attached => {
                debug!(extension = name, event, "routed extension event");
                Ok(())
            }
            Some(_) => Err(ExtensionError::NotAttached(name.to_string())),
            None => {
                warn!(extension = name, event, "event for unknown extension dropped");
                Err(ExtensionError::Unknown(name.to_string()))
            }
        }
    }

    /// The locally known extensions map, returned for `extensions:get`.
    pub async fn known(&self) -> Vec<ExtensionEntry> {
        self.entries.lock().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_rejects_names_outside_allow_list() {
        let registry = ExtensionsRegistry::new(vec![ExtensionName::Geo]);
        assert!(registry.attach("health", "1.0.0").await.is_err());
    }

    #[tokio::test]
    async fn attach_then_detach_round_trips() {
        let registry = ExtensionsRegistry::new(vec![ExtensionName::Geo]);
        registry.attach("geo", "1.0.0").await.unwrap();
        assert!(registry.attach("geo", "1.0.0").await.is_err());
        registry.detach("geo").await.unwrap();
        assert!(registry.detach("geo").await.is_err());
    }

    #[tokio::test]
    async fn route_rejects_detached_extension() {
        let registry = ExtensionsRegistry::new(vec![ExtensionName::Geo]);
        registry.attach("geo", "1.0.0").await.unwrap();
        registry.detach("geo").await.unwrap();
        assert!(registry.route("geo", "location").await.is_err());
    }
}
