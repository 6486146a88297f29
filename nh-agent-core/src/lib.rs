pub mod alarms;
pub mod archive_manager;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod downloader;
pub mod error;
pub mod hal;
pub mod logging;
pub mod policy;
pub mod security;
pub mod supervisor;
pub mod types;
pub mod update_manager;

pub use alarms::{Alarm, AlarmSet};
pub use channel::ChannelClient;
pub use config::{AuthConfig, Config, ExtensionName, RetryConfig};
pub use error::*;
pub use hal::{Flasher, FlasherEvent, NetworkObserver, SlotStore};
pub use policy::{ArchiveDecision, DefaultPolicy, FwupMessage, Policy, UpdateDecision};
pub use supervisor::Supervisor;
pub use types::*;
