//! Allocation request data — one batch of any/host/rack container asks.
//!
//! Counts accumulate: adding the same host twice sums the counts. The
//! batch is checked when it is handed to the allocator, so a malformed
//! request fails at the `allocate()` call site and never reaches a tracker.

use std::collections::BTreeMap;

use amgrid_core::ANY_RESOURCE;

use crate::error::{AllocateError, AllocateResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequestData {
    /// Target group; `None` is the default group.
    group_id: Option<String>,
    any: u64,
    hosts: BTreeMap<String, u64>,
    racks: BTreeMap<String, u64>,
}

impl AllocationRequestData {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty batch for a named group. An empty id means the default group.
    pub fn for_group(group_id: impl Into<String>) -> Self {
        let group_id = group_id.into();
        Self {
            group_id: (!group_id.is_empty()).then_some(group_id),
            ..Self::default()
        }
    }

    pub fn with_any(mut self, count: u32) -> Self {
        self.add_any(count);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>, count: u32) -> Self {
        self.add_host(host, count);
        self
    }

    pub fn with_rack(mut self, rack: impl Into<String>, count: u32) -> Self {
        self.add_rack(rack, count);
        self
    }

    pub fn add_any(&mut self, count: u32) {
        self.any = self.any.saturating_add(u64::from(count));
    }

    pub fn add_host(&mut self, host: impl Into<String>, count: u32) {
        let entry = self.hosts.entry(host.into()).or_default();
        *entry = entry.saturating_add(u64::from(count));
    }

    pub fn add_rack(&mut self, rack: impl Into<String>, count: u32) {
        let entry = self.racks.entry(rack.into()).or_default();
        *entry = entry.saturating_add(u64::from(count));
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn any_count(&self) -> u64 {
        self.any
    }

    pub fn hosts(&self) -> &BTreeMap<String, u64> {
        &self.hosts
    }

    pub fn racks(&self) -> &BTreeMap<String, u64> {
        &self.racks
    }

    /// Check names and counts, dropping zero entries.
    pub fn validate(&self) -> AllocateResult<ValidatedRequest> {
        let any = to_count("any", self.any)?;
        let hosts = validate_named("host", &self.hosts)?;
        let racks = validate_named("rack", &self.racks)?;
        Ok(ValidatedRequest { any, hosts, racks })
    }
}

impl From<u32> for AllocationRequestData {
    /// `count` containers anywhere, on the default group.
    fn from(count: u32) -> Self {
        Self::new().with_any(count)
    }
}

/// A request that passed validation. Every count fits a `u32` and is nonzero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub any: u32,
    pub hosts: BTreeMap<String, u32>,
    pub racks: BTreeMap<String, u32>,
}

impl ValidatedRequest {
    pub fn is_empty(&self) -> bool {
        self.any == 0 && self.hosts.is_empty() && self.racks.is_empty()
    }

    pub fn total(&self) -> u64 {
        u64::from(self.any)
            + self.hosts.values().map(|&c| u64::from(c)).sum::<u64>()
            + self.racks.values().map(|&c| u64::from(c)).sum::<u64>()
    }
}

fn validate_named(
    kind: &str,
    counts: &BTreeMap<String, u64>,
) -> AllocateResult<BTreeMap<String, u32>> {
    let mut out = BTreeMap::new();
    for (name, &count) in counts {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(AllocateError::InvalidRequest(format!("empty {kind} name")));
        }
        if trimmed == ANY_RESOURCE {
            return Err(AllocateError::InvalidRequest(format!(
                "{kind} name must not be the wildcard {ANY_RESOURCE:?}"
            )));
        }
        if trimmed != name {
            return Err(AllocateError::InvalidRequest(format!(
                "{kind} name {name:?} has surrounding whitespace"
            )));
        }
        let count = to_count(kind, count)?;
        if count > 0 {
            out.insert(name.clone(), count);
        }
    }
    Ok(out)
}

fn to_count(kind: &str, count: u64) -> AllocateResult<u32> {
    u32::try_from(count).map_err(|_| {
        AllocateError::InvalidRequest(format!("{kind} count {count} exceeds {}", u32::MAX))
    })
}
