pub mod config;
pub mod types;

pub use config::{AllocatorConfig, ConfigError, GroupSettings, RackConfig, TriggerKind};
pub use types::*;
