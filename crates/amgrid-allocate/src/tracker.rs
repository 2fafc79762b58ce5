//! Allocate count tracker — pending vs. in-flight container counts.
//!
//! Counts live in two states. *Pending* counts were requested by the
//! application but not yet sent; *in-flight* counts were sent to the
//! resource manager and not yet answered by a grant. Callers add to the
//! pending side concurrently and lock-free per key; the heartbeat is the
//! only writer of the in-flight side.
//!
//! # Flush
//!
//! A flush drains each pending counter with one atomic swap and adds the
//! drained amount into the matching in-flight counter. The asks it
//! returns are cumulative in-flight totals, because the wire protocol
//! replaces the previous ask for a resource name rather than adding to it.
//!
//! The wildcard total always covers every locality-specific count at
//! this priority: `any = inflight[any] + Σ inflight[host] + Σ inflight[rack]`.
//! A smaller wildcard ask lets the resource manager starve the
//! locality-specific asks.
//!
//! # Reconciliation
//!
//! Grants carry no request id. A grant on host `h` is matched, in order,
//! against `inflight[h]`, `inflight[rack(h)]`, `inflight[any]`, and
//! finally against the first positive host or rack count, which absorbs
//! relaxed-locality grants that landed somewhere unrequested. A grant
//! matching nothing is garbage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use amgrid_core::{BucketKind, Container};
use tracing::debug;

use crate::rack::{RackCache, RackResolver};
use crate::sync::{lock, read, write};

/// Asks produced by one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushedCounts {
    /// Wildcard total; `None` when the wildcard ask need not be sent.
    pub any: Option<u32>,
    /// Host name → cumulative in-flight count.
    pub hosts: BTreeMap<String, u32>,
    /// Rack name → cumulative in-flight count.
    pub racks: BTreeMap<String, u32>,
}

impl FlushedCounts {
    pub fn is_empty(&self) -> bool {
        self.any.is_none() && self.hosts.is_empty() && self.racks.is_empty()
    }
}

/// Point-in-time copy of a tracker's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub pending_any: u32,
    pub inflight_any: u32,
    pub pending_hosts: BTreeMap<String, u32>,
    pub inflight_hosts: BTreeMap<String, u32>,
    pub pending_racks: BTreeMap<String, u32>,
    pub inflight_racks: BTreeMap<String, u32>,
}

impl TrackerSnapshot {
    /// The wildcard total a flush would send right now for the in-flight side.
    pub fn inflight_total(&self) -> u64 {
        u64::from(self.inflight_any)
            + self.inflight_hosts.values().map(|&c| u64::from(c)).sum::<u64>()
            + self.inflight_racks.values().map(|&c| u64::from(c)).sum::<u64>()
    }
}

#[derive(Debug, Default)]
struct InflightCounts {
    any: u32,
    hosts: BTreeMap<String, u32>,
    racks: BTreeMap<String, u32>,
}

impl InflightCounts {
    fn total(&self) -> u32 {
        let sum = u64::from(self.any)
            + self.hosts.values().map(|&c| u64::from(c)).sum::<u64>()
            + self.racks.values().map(|&c| u64::from(c)).sum::<u64>();
        u32::try_from(sum).unwrap_or(u32::MAX)
    }
}

/// Tracks one bucket of one allocation group.
pub struct AllocateCountTracker {
    group_id: String,
    bucket: BucketKind,
    racks: RackCache,
    pending_any: AtomicU32,
    pending_hosts: RwLock<HashMap<String, AtomicU32>>,
    pending_racks: RwLock<HashMap<String, AtomicU32>>,
    inflight: Mutex<InflightCounts>,
    /// Set when the last flush never reached the resource manager.
    resend: AtomicBool,
}

impl AllocateCountTracker {
    pub fn new(
        group_id: impl Into<String>,
        bucket: BucketKind,
        resolver: Arc<dyn RackResolver>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            bucket,
            racks: RackCache::new(resolver),
            pending_any: AtomicU32::new(0),
            pending_hosts: RwLock::new(HashMap::new()),
            pending_racks: RwLock::new(HashMap::new()),
            inflight: Mutex::new(InflightCounts::default()),
            resend: AtomicBool::new(false),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn bucket(&self) -> BucketKind {
        self.bucket
    }

    /// Add pending counts. Each host count is mirrored into the pending
    /// count of the host's rack when the rack resolves.
    ///
    /// Returns whether any nonzero count was applied.
    pub fn add_containers(
        &self,
        any: u32,
        hosts: &BTreeMap<String, u32>,
        racks: &BTreeMap<String, u32>,
    ) -> bool {
        let mut applied = false;

        for (host, &count) in hosts {
            if count == 0 {
                continue;
            }
            add_keyed(&self.pending_hosts, host, count);
            if let Some(rack) = self.racks.rack_of(host) {
                add_keyed(&self.pending_racks, &rack, count);
            }
            applied = true;
        }

        for (rack, &count) in racks {
            if count == 0 {
                continue;
            }
            add_keyed(&self.pending_racks, rack, count);
            applied = true;
        }

        if any > 0 {
            saturating_add(&self.pending_any, any);
            applied = true;
        }

        if applied {
            debug!(
                group = %self.group_id,
                bucket = %self.bucket,
                any,
                hosts = hosts.len(),
                racks = racks.len(),
                "added pending containers"
            );
        }
        applied
    }

    /// Move pending counts to in-flight and return the asks to send.
    ///
    /// Only names whose pending count was drained are returned, each with
    /// its cumulative in-flight total. A flush with nothing drained returns
    /// no asks, unless the previous flush was marked for resend, in which
    /// case every in-flight name is returned again.
    pub fn flush(&self) -> FlushedCounts {
        let resend = self.resend.swap(false, Ordering::AcqRel);
        let mut inflight = lock(&self.inflight);
        let mut out = FlushedCounts::default();

        drain_into(&self.pending_hosts, &mut inflight.hosts, &mut out.hosts);
        drain_into(&self.pending_racks, &mut inflight.racks, &mut out.racks);

        let drained_any = self.pending_any.swap(0, Ordering::AcqRel);
        inflight.any = inflight.any.saturating_add(drained_any);

        let drained = drained_any > 0 || !out.hosts.is_empty() || !out.racks.is_empty();

        if resend {
            for (host, &count) in &inflight.hosts {
                out.hosts.insert(host.clone(), count);
            }
            for (rack, &count) in &inflight.racks {
                out.racks.insert(rack.clone(), count);
            }
        }

        if drained || resend {
            out.any = Some(inflight.total());
        }

        if !out.is_empty() {
            debug!(
                group = %self.group_id,
                bucket = %self.bucket,
                any = ?out.any,
                hosts = ?out.hosts,
                racks = ?out.racks,
                resend,
                "flushed allocate counts"
            );
        }
        out
    }

    /// Match a grant against in-flight counts.
    ///
    /// Returns `false` when nothing was outstanding; the caller treats the
    /// container as garbage. Counts never drop below zero.
    pub fn reconcile_grant(&self, container: &Container) -> bool {
        let host = container.host.as_str();
        let mut inflight = lock(&self.inflight);

        let matched = if decrement_key(&mut inflight.hosts, host) {
            Some("host")
        } else if !inflight.racks.is_empty()
            && self
                .racks
                .rack_of(host)
                .is_some_and(|rack| decrement_key(&mut inflight.racks, &rack))
        {
            Some("rack")
        } else if decrement(&mut inflight.any) {
            Some("any")
        } else if decrement_first(&mut inflight.hosts) {
            Some("drained host")
        } else if decrement_first(&mut inflight.racks) {
            Some("drained rack")
        } else {
            None
        };

        match matched {
            Some(kind) => {
                debug!(
                    group = %self.group_id,
                    bucket = %self.bucket,
                    container = %container.id,
                    %host,
                    matched = kind,
                    "matched grant"
                );
                true
            }
            None => {
                debug!(
                    group = %self.group_id,
                    bucket = %self.bucket,
                    container = %container.id,
                    %host,
                    "no outstanding asks for grant"
                );
                false
            }
        }
    }

    /// Make the next flush resend every in-flight count.
    pub fn mark_resend(&self) {
        self.resend.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let inflight = lock(&self.inflight);
        TrackerSnapshot {
            pending_any: self.pending_any.load(Ordering::Acquire),
            inflight_any: inflight.any,
            pending_hosts: load_keyed(&self.pending_hosts),
            inflight_hosts: inflight.hosts.clone(),
            pending_racks: load_keyed(&self.pending_racks),
            inflight_racks: inflight.racks.clone(),
        }
    }
}

impl std::fmt::Debug for AllocateCountTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocateCountTracker")
            .field("group_id", &self.group_id)
            .field("bucket", &self.bucket)
            .field("counts", &self.snapshot())
            .finish()
    }
}

fn saturating_add(counter: &AtomicU32, delta: u32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_add(delta))
    });
}

fn add_keyed(map: &RwLock<HashMap<String, AtomicU32>>, key: &str, delta: u32) {
    {
        let counters = read(map);
        if let Some(counter) = counters.get(key) {
            saturating_add(counter, delta);
            return;
        }
    }
    let mut counters = write(map);
    saturating_add(counters.entry(key.to_string()).or_default(), delta);
}

/// Swap each pending counter to zero and fold it into `inflight`.
fn drain_into(
    pending: &RwLock<HashMap<String, AtomicU32>>,
    inflight: &mut BTreeMap<String, u32>,
    out: &mut BTreeMap<String, u32>,
) {
    for (name, counter) in read(pending).iter() {
        let drained = counter.swap(0, Ordering::AcqRel);
        if drained == 0 {
            continue;
        }
        let total = inflight.entry(name.clone()).or_default();
        *total = total.saturating_add(drained);
        out.insert(name.clone(), *total);
    }
}

fn load_keyed(map: &RwLock<HashMap<String, AtomicU32>>) -> BTreeMap<String, u32> {
    read(map)
        .iter()
        .map(|(name, counter)| (name.clone(), counter.load(Ordering::Acquire)))
        .collect()
}

fn decrement(value: &mut u32) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

fn decrement_key(map: &mut BTreeMap<String, u32>, key: &str) -> bool {
    map.get_mut(key).is_some_and(decrement)
}

/// Decrement the first positive entry, in name order.
fn decrement_first(map: &mut BTreeMap<String, u32>) -> bool {
    map.values_mut().any(decrement)
}
