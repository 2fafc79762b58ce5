//! amgrid.toml configuration parser.
//!
//! Every field has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! heartbeat = "5s"
//! trigger = "fixed-delay"
//!
//! [defaults]
//! priority = 0
//! memory_mb = 64
//!
//! [groups.workers]
//! priority = 10
//! memory_mb = 1024
//! vcores = 2
//! relax_locality = false
//!
//! [racks]
//! default_rack = "/default-rack"
//! hosts = { node-1 = "/rack1" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ResourceShape;

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Period between heartbeats.
    pub heartbeat: String,
    pub trigger: TriggerKind,
    /// Delay before the first heartbeat.
    pub initial_delay: String,
    /// Highest priority the group registry may reserve.
    pub priority_ceiling: i32,
    /// Settings for the default group and for group ids nobody configured.
    pub defaults: GroupSettings,
    pub groups: BTreeMap<String, GroupSettings>,
    pub racks: RackConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            heartbeat: "5s".to_string(),
            trigger: TriggerKind::FixedDelay,
            initial_delay: "0s".to_string(),
            priority_ceiling: i32::MAX,
            defaults: GroupSettings::default(),
            groups: BTreeMap::new(),
            racks: RackConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    /// Wait `heartbeat` after each heartbeat completes.
    #[default]
    FixedDelay,
    /// Fire every `heartbeat`, skipping ticks missed while a heartbeat ran long.
    FixedRate,
}

/// Priority and resource shape of one allocation group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    pub priority: i32,
    pub memory_mb: u64,
    pub vcores: u32,
    pub relax_locality: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_expression: Option<String>,
}

impl GroupSettings {
    pub fn shape(&self) -> ResourceShape {
        ResourceShape {
            memory_mb: self.memory_mb,
            vcores: self.vcores,
            label_expression: self.label_expression.clone(),
            relax_locality: self.relax_locality,
        }
    }
}

impl Default for GroupSettings {
    fn default() -> Self {
        let shape = ResourceShape::default();
        Self {
            priority: 0,
            memory_mb: shape.memory_mb,
            vcores: shape.vcores,
            relax_locality: shape.relax_locality,
            label_expression: None,
        }
    }
}

/// Static host → rack topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RackConfig {
    pub default_rack: String,
    pub hosts: BTreeMap<String, String>,
}

impl Default for RackConfig {
    fn default() -> Self {
        Self {
            default_rack: "/default-rack".to_string(),
            hosts: BTreeMap::new(),
        }
    }
}

impl AllocatorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AllocatorConfig = toml::from_str(content)?;
        config.heartbeat_interval()?;
        config.initial_delay()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn heartbeat_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.heartbeat).ok_or_else(|| ConfigError::InvalidDuration {
            field: "heartbeat",
            value: self.heartbeat.clone(),
        })
    }

    pub fn initial_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.initial_delay).ok_or_else(|| ConfigError::InvalidDuration {
            field: "initial_delay",
            value: self.initial_delay.clone(),
        })
    }

    /// Settings for `group_id`, falling back to the defaults.
    pub fn group(&self, group_id: &str) -> &GroupSettings {
        self.groups.get(group_id).unwrap_or(&self.defaults)
    }
}

/// Parse a duration string like "500ms", "5s", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
