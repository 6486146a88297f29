use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, info};

/// Process-wide alarms raised by the agent. Set/clear is idempotent: raising
/// an already-set alarm or clearing an already-clear one is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alarm {
    Disconnected,
    UpdateInProgress,
    FirmwareReverted,
}

impl std::fmt::Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alarm::Disconnected => write!(f, "disconnected"),
            Alarm::UpdateInProgress => write!(f, "update_in_progress"),
            Alarm::FirmwareReverted => write!(f, "firmware_reverted"),
        }
    }
}

/// An idempotent, process-wide alarm set. The spec marks alarm *reporting*
/// as an external collaborator; this is just the in-process bookkeeping a
/// reporter would subscribe to.
#[derive(Debug, Default)]
pub struct AlarmSet {
    active: Mutex<HashSet<Alarm>>,
}

impl AlarmSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises `alarm`. Returns `true` if this call actually changed state.
    pub fn set(&self, alarm: Alarm) -> bool {
        let mut active = self.active.lock().expect("alarm set poisoned");
        let changed = active.insert(alarm);
        if changed {
            info!(%alarm, "alarm raised");
        } else {
            debug!(%alarm, "alarm already raised");
        }
        changed
    }

    /// Clears `alarm`. Returns `true` if this call actually changed state.
    pub fn clear(&self, alarm: Alarm) -> bool {
        let mut active = self.active.lock().expect("alarm set poisoned");
        let changed = active.remove(&alarm);
        if changed {
            info!(%alarm, "alarm cleared");
        } else {
            debug!(%alarm, "alarm already clear");
        }
        changed
    }

    pub fn is_set(&self, alarm: Alarm) -> bool {
        self.active.lock().expect("alarm set poisoned").contains(&alarm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_clear_is_idempotent() {
        let alarms = AlarmSet::new();
        assert!(alarms.set(Alarm::UpdateInProgress));
        assert!(!alarms.set(Alarm::UpdateInProgress));
        assert!(alarms.is_set(Alarm::UpdateInProgress));

        assert!(alarms.clear(Alarm::UpdateInProgress));
        assert!(!alarms.clear(Alarm::UpdateInProgress));
        assert!(!alarms.is_set(Alarm::UpdateInProgress));
    }

    #[test]
    fn alarms_are_independent() {
        let alarms = AlarmSet::new();
        alarms.set(Alarm::Disconnected);
        assert!(alarms.is_set(Alarm::Disconnected));
        assert!(!alarms.is_set(Alarm::FirmwareReverted));
    }
}
