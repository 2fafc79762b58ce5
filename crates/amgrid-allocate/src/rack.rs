//! Host → rack resolution.
//!
//! Resolution is best effort: a failing resolver is logged and the host
//! simply gets no rack for that call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use amgrid_core::RackConfig;
use tracing::{debug, warn};

use crate::sync::lock;

/// Rack every host lands in when nothing better is known.
pub const DEFAULT_RACK: &str = "/default-rack";

/// Maps a hostname to its rack.
pub trait RackResolver: Send + Sync {
    /// `Ok(None)` when the host has no known rack.
    fn resolve(&self, host: &str) -> anyhow::Result<Option<String>>;
}

impl<F> RackResolver for F
where
    F: Fn(&str) -> anyhow::Result<Option<String>> + Send + Sync,
{
    fn resolve(&self, host: &str) -> anyhow::Result<Option<String>> {
        self(host)
    }
}

/// Puts every host in a single rack.
#[derive(Debug, Clone)]
pub struct DefaultRackResolver {
    rack: String,
}

impl DefaultRackResolver {
    pub fn new() -> Self {
        Self::with_rack(DEFAULT_RACK)
    }

    pub fn with_rack(rack: impl Into<String>) -> Self {
        Self { rack: rack.into() }
    }
}

impl Default for DefaultRackResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl RackResolver for DefaultRackResolver {
    fn resolve(&self, _host: &str) -> anyhow::Result<Option<String>> {
        Ok(Some(self.rack.clone()))
    }
}

/// Resolves hosts from a fixed table, with an optional fallback rack.
#[derive(Debug, Clone, Default)]
pub struct StaticRackResolver {
    hosts: HashMap<String, String>,
    default_rack: Option<String>,
}

impl StaticRackResolver {
    pub fn new(hosts: HashMap<String, String>, default_rack: Option<String>) -> Self {
        Self {
            hosts,
            default_rack,
        }
    }

    pub fn from_config(config: &RackConfig) -> Self {
        let default_rack = (!config.default_rack.is_empty()).then(|| config.default_rack.clone());
        Self::new(
            config
                .hosts
                .iter()
                .map(|(host, rack)| (host.clone(), rack.clone()))
                .collect(),
            default_rack,
        )
    }

    pub fn with_host(mut self, host: impl Into<String>, rack: impl Into<String>) -> Self {
        self.hosts.insert(host.into(), rack.into());
        self
    }
}

impl RackResolver for StaticRackResolver {
    fn resolve(&self, host: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .hosts
            .get(host)
            .cloned()
            .or_else(|| self.default_rack.clone()))
    }
}

/// Per-tracker memo in front of a shared resolver. Failures are not cached.
pub(crate) struct RackCache {
    resolver: Arc<dyn RackResolver>,
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl RackCache {
    pub(crate) fn new(resolver: Arc<dyn RackResolver>) -> Self {
        Self {
            resolver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn rack_of(&self, host: &str) -> Option<String> {
        if let Some(hit) = lock(&self.cache).get(host) {
            return hit.clone();
        }

        match self.resolver.resolve(host) {
            Ok(rack) => {
                debug!(%host, rack = ?rack, "resolved rack");
                lock(&self.cache).insert(host.to_string(), rack.clone());
                rack
            }
            Err(e) => {
                warn!(%host, error = %e, "rack resolution failed, skipping rack for host");
                None
            }
        }
    }
}
