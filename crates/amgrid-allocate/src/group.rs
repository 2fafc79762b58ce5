//! Allocation groups and the registry that hands out their priorities.
//!
//! A group is a named resource shape. Each of its buckets (any, host,
//! rack) gets its own tracker and its own wire priority, reserved the
//! first time the bucket receives data. Grants come back stamped with
//! that priority, which is how they find their way to the right tracker.
//!
//! Reservation scans upward from the group's base priority and takes the
//! first value no other (group, bucket) holds. Reservations are never
//! released, so two buckets can never share a priority.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use amgrid_core::{BucketKind, ResourceAsk, ResourceShape, ANY_RESOURCE};
use tracing::{debug, info};

use crate::error::{AllocateError, AllocateResult};
use crate::rack::RackResolver;
use crate::sync::{lock, read, write};
use crate::tracker::{AllocateCountTracker, FlushedCounts};

/// Group id of the default (unnamed) group.
pub const DEFAULT_GROUP_ID: &str = "";

/// A reserved bucket: its wire priority and its tracker.
#[derive(Debug)]
struct BucketSlot {
    priority: i32,
    tracker: Arc<AllocateCountTracker>,
}

/// A named resource shape owning one tracker per bucket kind.
pub struct AllocationGroup {
    id: String,
    base_priority: i32,
    shape: ResourceShape,
    resolver: Arc<dyn RackResolver>,
    /// Indexed by [`BucketKind::index`]; set once under the registry's
    /// priority lock.
    buckets: [OnceLock<BucketSlot>; 3],
}

impl AllocationGroup {
    fn new(
        id: String,
        base_priority: i32,
        shape: ResourceShape,
        resolver: Arc<dyn RackResolver>,
    ) -> Self {
        Self {
            id,
            base_priority,
            shape,
            resolver,
            buckets: [OnceLock::new(), OnceLock::new(), OnceLock::new()],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_priority(&self) -> i32 {
        self.base_priority
    }

    pub fn shape(&self) -> &ResourceShape {
        &self.shape
    }

    /// Priority reserved for `bucket`, if the bucket has been used.
    pub fn priority(&self, bucket: BucketKind) -> Option<i32> {
        self.slot(bucket).map(|slot| slot.priority)
    }

    pub fn tracker(&self, bucket: BucketKind) -> Option<&Arc<AllocateCountTracker>> {
        self.slot(bucket).map(|slot| &slot.tracker)
    }

    /// Bucket owning `priority` in this group.
    pub fn bucket_for_priority(&self, priority: i32) -> Option<BucketKind> {
        BucketKind::ALL
            .into_iter()
            .find(|&bucket| self.priority(bucket) == Some(priority))
    }

    /// Flush every reserved bucket into wire asks.
    pub fn flush_asks(&self) -> Vec<ResourceAsk> {
        let mut asks = Vec::new();
        for bucket in BucketKind::ALL {
            if let Some(slot) = self.slot(bucket) {
                let counts = slot.tracker.flush();
                asks.extend(self.build_asks(bucket, slot.priority, &counts));
            }
        }
        asks
    }

    /// Make the next flush of every bucket resend all in-flight counts.
    pub fn mark_resend(&self) {
        for bucket in BucketKind::ALL {
            if let Some(slot) = self.slot(bucket) {
                slot.tracker.mark_resend();
            }
        }
    }

    fn slot(&self, bucket: BucketKind) -> Option<&BucketSlot> {
        self.buckets[bucket.index()].get()
    }

    /// Turn flushed counts into asks.
    ///
    /// The exact-locality asks of a bucket always relax; the wildcard and
    /// the rack mirrors of a host bucket follow the group's shape. Label
    /// expressions only go on the wildcard ask.
    fn build_asks(
        &self,
        bucket: BucketKind,
        priority: i32,
        counts: &FlushedCounts,
    ) -> Vec<ResourceAsk> {
        let (host_relax, rack_relax, any_relax) = match bucket {
            BucketKind::Any => (true, true, true),
            BucketKind::Host => (true, self.shape.relax_locality, self.shape.relax_locality),
            BucketKind::Rack => (true, true, self.shape.relax_locality),
        };

        let ask = |name: &str, count: u32, relax: bool, label: Option<String>| ResourceAsk {
            priority,
            resource_name: name.to_string(),
            count,
            relax_locality: relax,
            label_expression: label,
            memory_mb: self.shape.memory_mb,
            vcores: self.shape.vcores,
        };

        let mut asks = Vec::new();
        if let Some(any) = counts.any {
            asks.push(ask(
                ANY_RESOURCE,
                any,
                any_relax,
                self.shape.label_expression.clone(),
            ));
        }
        for (rack, &count) in &counts.racks {
            asks.push(ask(rack, count, rack_relax, None));
        }
        for (host, &count) in &counts.hosts {
            asks.push(ask(host, count, host_relax, None));
        }
        asks
    }
}

impl std::fmt::Debug for AllocationGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationGroup")
            .field("id", &self.id)
            .field("base_priority", &self.base_priority)
            .field("shape", &self.shape)
            .field("buckets", &self.buckets)
            .finish()
    }
}

#[derive(Debug, Default)]
struct PriorityTable {
    reserved: BTreeSet<i32>,
    /// priority → (group id, bucket)
    owners: HashMap<i32, (String, BucketKind)>,
}

/// Owns every allocation group and the shared priority space.
pub struct AllocationGroupRegistry {
    resolver: Arc<dyn RackResolver>,
    priority_ceiling: i32,
    groups: RwLock<BTreeMap<String, Arc<AllocationGroup>>>,
    priorities: Mutex<PriorityTable>,
}

impl AllocationGroupRegistry {
    pub fn new(resolver: Arc<dyn RackResolver>) -> Self {
        Self::with_priority_ceiling(resolver, i32::MAX)
    }

    /// A registry that never reserves a priority above `ceiling`.
    pub fn with_priority_ceiling(resolver: Arc<dyn RackResolver>, ceiling: i32) -> Self {
        Self {
            resolver,
            priority_ceiling: ceiling,
            groups: RwLock::new(BTreeMap::new()),
            priorities: Mutex::new(PriorityTable::default()),
        }
    }

    /// Return the group `id`, creating it on first use.
    ///
    /// The first caller fixes the base priority and shape; a later call
    /// with a different base priority fails.
    pub fn get_or_create(
        &self,
        id: &str,
        base_priority: i32,
        shape: ResourceShape,
    ) -> AllocateResult<Arc<AllocationGroup>> {
        if let Some(group) = read(&self.groups).get(id) {
            return check_base_priority(group, base_priority).map(|()| group.clone());
        }

        let mut groups = write(&self.groups);
        if let Some(group) = groups.get(id) {
            return check_base_priority(group, base_priority).map(|()| group.clone());
        }

        let group = Arc::new(AllocationGroup::new(
            id.to_string(),
            base_priority,
            shape,
            self.resolver.clone(),
        ));
        groups.insert(id.to_string(), group.clone());
        info!(group = %id, base_priority, "allocation group created");
        Ok(group)
    }

    pub fn priority_ceiling(&self) -> i32 {
        self.priority_ceiling
    }

    pub fn resolver(&self) -> Arc<dyn RackResolver> {
        self.resolver.clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<AllocationGroup>> {
        read(&self.groups).get(id).cloned()
    }

    /// All groups, ordered by id.
    pub fn groups(&self) -> Vec<Arc<AllocationGroup>> {
        read(&self.groups).values().cloned().collect()
    }

    /// Reserve (once) the priority of `bucket` in group `id`.
    pub fn reserve_bucket_priority(&self, id: &str, bucket: BucketKind) -> AllocateResult<i32> {
        let group = self
            .get(id)
            .ok_or_else(|| AllocateError::UnknownGroup(id.to_string()))?;
        self.ensure_bucket(&group, bucket).map(|(priority, _)| priority)
    }

    /// Tracker for `bucket` of `group`, reserving the bucket on first use.
    pub fn tracker(
        &self,
        group: &AllocationGroup,
        bucket: BucketKind,
    ) -> AllocateResult<Arc<AllocateCountTracker>> {
        self.ensure_bucket(group, bucket).map(|(_, tracker)| tracker)
    }

    /// Group and bucket a grant with `priority` belongs to.
    pub fn find_by_priority(&self, priority: i32) -> Option<(Arc<AllocationGroup>, BucketKind)> {
        let (id, bucket) = lock(&self.priorities).owners.get(&priority).cloned()?;
        self.get(&id).map(|group| (group, bucket))
    }

    /// Every reserved priority, ascending.
    pub fn reserved_priorities(&self) -> Vec<i32> {
        lock(&self.priorities).reserved.iter().copied().collect()
    }

    fn ensure_bucket(
        &self,
        group: &AllocationGroup,
        bucket: BucketKind,
    ) -> AllocateResult<(i32, Arc<AllocateCountTracker>)> {
        if let Some(slot) = group.slot(bucket) {
            return Ok((slot.priority, slot.tracker.clone()));
        }

        let mut table = lock(&self.priorities);
        // Another caller may have reserved it while we waited for the lock.
        if let Some(slot) = group.slot(bucket) {
            return Ok((slot.priority, slot.tracker.clone()));
        }

        let priority = next_free_priority(&table.reserved, group.base_priority, self.priority_ceiling)
            .ok_or_else(|| AllocateError::PriorityExhausted {
                group: group.id.clone(),
                bucket,
                start: group.base_priority,
            })?;

        let tracker = Arc::new(AllocateCountTracker::new(
            group.id.clone(),
            bucket,
            group.resolver.clone(),
        ));
        let _ = group.buckets[bucket.index()].set(BucketSlot {
            priority,
            tracker: tracker.clone(),
        });
        table.reserved.insert(priority);
        table.owners.insert(priority, (group.id.clone(), bucket));

        debug!(group = %group.id, %bucket, priority, "reserved bucket priority");
        Ok((priority, tracker))
    }
}

impl std::fmt::Debug for AllocationGroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationGroupRegistry")
            .field("priority_ceiling", &self.priority_ceiling)
            .field("groups", &*read(&self.groups))
            .field("priorities", &*lock(&self.priorities))
            .finish()
    }
}

fn check_base_priority(group: &AllocationGroup, requested: i32) -> AllocateResult<()> {
    if group.base_priority == requested {
        Ok(())
    } else {
        Err(AllocateError::GroupConflict {
            id: group.id.clone(),
            existing: group.base_priority,
            requested,
        })
    }
}

/// First unreserved value in `start..=ceiling`.
fn next_free_priority(reserved: &BTreeSet<i32>, start: i32, ceiling: i32) -> Option<i32> {
    let mut candidate = start;
    for &taken in reserved.range(start..) {
        if taken != candidate {
            break;
        }
        candidate = candidate.checked_add(1)?;
    }
    (candidate <= ceiling).then_some(candidate)
}
