//! The container allocator: request intake plus the heartbeat that
//! reconciles asks with the resource manager.
//!
//! Callers add requests from any thread. Once per heartbeat the allocator
//! flushes every tracker (only if something changed), sends the asks and
//! queued releases, and routes the returned grants back to the trackers
//! by priority. Grants nobody asked for are released on the following
//! heartbeat and their completions are hidden from listeners.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use amgrid_core::{
    AllocateRequest, AllocatorConfig, BucketKind, ConfigError, Container, ContainerId,
    ContainerStatus, GroupSettings,
};
use amgrid_poll::{PollFn, PollingEngine, Trigger};
use tracing::{debug, error, info, warn};

use crate::client::ResourceManagerClient;
use crate::error::{AllocateError, AllocateResult};
use crate::group::{AllocationGroup, AllocationGroupRegistry, DEFAULT_GROUP_ID};
use crate::listener::{AllocatorListener, CompositeListener, FnListener};
use crate::rack::{DefaultRackResolver, RackResolver, StaticRackResolver};
use crate::request::AllocationRequestData;
use crate::sync::{lock, read, write};
use crate::tracker::AllocateCountTracker;

const ENGINE_NAME: &str = "container-allocator";

/// Successful heartbeats a released garbage container waits for its
/// completion report before it is forgotten.
const GARBAGE_RETENTION_HEARTBEATS: u32 = 50;

/// Result of one heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Completed(HeartbeatSummary),
    /// The RPC failed; state was kept for the next heartbeat.
    Failed,
}

/// Counts from one successful heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatSummary {
    pub asks: usize,
    pub releases: usize,
    pub allocated: usize,
    pub garbage: usize,
    pub completed: usize,
    pub suppressed: usize,
}

/// Ids waiting to be released, each at most once.
#[derive(Debug, Default)]
struct ReleaseQueue {
    order: Vec<ContainerId>,
    queued: HashSet<ContainerId>,
}

impl ReleaseQueue {
    fn push(&mut self, id: ContainerId) -> bool {
        if self.queued.insert(id.clone()) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    fn drain(&mut self) -> Vec<ContainerId> {
        self.queued.clear();
        std::mem::take(&mut self.order)
    }

    /// Put back ids a failed heartbeat never delivered, ahead of newer ones.
    fn requeue(&mut self, ids: Vec<ContainerId>) {
        let newer = std::mem::take(&mut self.order);
        self.queued.clear();
        for id in ids.into_iter().chain(newer) {
            self.push(id);
        }
    }
}

pub struct ContainerAllocator {
    client: Arc<dyn ResourceManagerClient>,
    registry: AllocationGroupRegistry,
    defaults: GroupSettings,
    group_settings: RwLock<HashMap<String, GroupSettings>>,
    listeners: CompositeListener,
    releases: Mutex<ReleaseQueue>,
    /// Garbage ids and the heartbeats left before they are forgotten.
    garbage: Mutex<HashMap<ContainerId, u32>>,
    /// Set on every applied request, cleared by the heartbeat that flushes.
    dirty: AtomicBool,
    /// `f32` bits, always within `[0, 1]`.
    progress: AtomicU32,
    response_id: AtomicI32,
    engine: PollingEngine,
    /// Serializes heartbeats, including ones driven by hand.
    tick: tokio::sync::Mutex<()>,
}

impl ContainerAllocator {
    /// An allocator with default group settings, a single default rack
    /// and a 5s fixed-delay heartbeat.
    pub fn new(client: Arc<dyn ResourceManagerClient>) -> Self {
        Self {
            client,
            registry: AllocationGroupRegistry::new(Arc::new(DefaultRackResolver::new())),
            defaults: GroupSettings::default(),
            group_settings: RwLock::new(HashMap::new()),
            listeners: CompositeListener::new(),
            releases: Mutex::new(ReleaseQueue::default()),
            garbage: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            progress: AtomicU32::new(0f32.to_bits()),
            response_id: AtomicI32::new(0),
            engine: PollingEngine::new(ENGINE_NAME, Trigger::default()),
            tick: tokio::sync::Mutex::new(()),
        }
    }

    /// Build an allocator from a parsed config file.
    pub fn from_config(
        client: Arc<dyn ResourceManagerClient>,
        config: &AllocatorConfig,
    ) -> Result<Self, ConfigError> {
        let trigger = Trigger::from_config(config)?;
        let resolver = Arc::new(StaticRackResolver::from_config(&config.racks));
        let groups = config
            .groups
            .iter()
            .map(|(id, settings)| (id.clone(), settings.clone()))
            .collect();

        let mut allocator = Self::new(client)
            .with_trigger(trigger)
            .with_rack_resolver_and_ceiling(resolver, config.priority_ceiling)
            .with_default_settings(config.defaults.clone());
        allocator.group_settings = RwLock::new(groups);
        Ok(allocator)
    }

    /// Replace the rack resolver. Must be called before any allocation.
    pub fn with_rack_resolver(self, resolver: Arc<dyn RackResolver>) -> Self {
        let ceiling = self.registry.priority_ceiling();
        self.with_rack_resolver_and_ceiling(resolver, ceiling)
    }

    /// Cap the priorities the registry may reserve. Must be called before
    /// any allocation.
    pub fn with_priority_ceiling(self, ceiling: i32) -> Self {
        let resolver = self.registry.resolver();
        self.with_rack_resolver_and_ceiling(resolver, ceiling)
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.engine = PollingEngine::new(ENGINE_NAME, trigger);
        self
    }

    /// Settings used for groups without their own entry.
    pub fn with_default_settings(mut self, settings: GroupSettings) -> Self {
        self.defaults = settings;
        self
    }

    fn with_rack_resolver_and_ceiling(
        mut self,
        resolver: Arc<dyn RackResolver>,
        ceiling: i32,
    ) -> Self {
        self.registry = AllocationGroupRegistry::with_priority_ceiling(resolver, ceiling);
        self
    }

    /// Describe group `id`. A group that already exists keeps its base
    /// priority and shape; settings that change either are rejected.
    pub fn set_group_settings(
        &self,
        id: impl Into<String>,
        settings: GroupSettings,
    ) -> AllocateResult<()> {
        let id = id.into();
        if let Some(group) = self.registry.get(&id) {
            if group.base_priority() != settings.priority {
                return Err(AllocateError::GroupConflict {
                    id,
                    existing: group.base_priority(),
                    requested: settings.priority,
                });
            }
            if *group.shape() != settings.shape() {
                return Err(AllocateError::ShapeConflict(id));
            }
        }
        write(&self.group_settings).insert(id, settings);
        Ok(())
    }

    /// Settings for group `id`, falling back to the defaults.
    pub fn group_settings(&self, id: &str) -> GroupSettings {
        read(&self.group_settings)
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Ask for more containers.
    ///
    /// A bare count asks for that many containers anywhere on the default
    /// group. Errors are raised here, never from a heartbeat; a rejected
    /// request changes nothing.
    pub fn allocate(&self, data: impl Into<AllocationRequestData>) -> AllocateResult<()> {
        let data = data.into();
        let request = data.validate()?;
        if request.is_empty() {
            return Ok(());
        }

        let id = data.group_id().unwrap_or(DEFAULT_GROUP_ID);
        let settings = self.group_settings(id);
        let group = self
            .registry
            .get_or_create(id, settings.priority, settings.shape())?;

        // Reserve every bucket first so a priority failure leaves no partial request.
        let any = self.bucket_tracker(&group, BucketKind::Any, request.any > 0)?;
        let host = self.bucket_tracker(&group, BucketKind::Host, !request.hosts.is_empty())?;
        let rack = self.bucket_tracker(&group, BucketKind::Rack, !request.racks.is_empty())?;

        let none = BTreeMap::new();
        let mut applied = false;
        if let Some(tracker) = any {
            applied |= tracker.add_containers(request.any, &none, &none);
        }
        if let Some(tracker) = host {
            applied |= tracker.add_containers(0, &request.hosts, &none);
        }
        if let Some(tracker) = rack {
            applied |= tracker.add_containers(0, &none, &request.racks);
        }

        if applied {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn bucket_tracker(
        &self,
        group: &AllocationGroup,
        bucket: BucketKind,
        wanted: bool,
    ) -> AllocateResult<Option<Arc<AllocateCountTracker>>> {
        if wanted {
            self.registry.tracker(group, bucket).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Queue a container for release on the next heartbeat.
    pub fn release(&self, id: impl Into<ContainerId>) {
        let id = id.into();
        if lock(&self.releases).push(id.clone()) {
            debug!(container = %id, "queued release");
        }
    }

    pub fn release_all<I>(&self, ids: I)
    where
        I: IntoIterator,
        I::Item: Into<ContainerId>,
    {
        let mut releases = lock(&self.releases);
        for id in ids {
            releases.push(id.into());
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn AllocatorListener>) {
        self.listeners.add(listener);
    }

    pub fn add_listener_fn<A, C>(&self, on_allocated: A, on_completed: C)
    where
        A: Fn(&[Container]) + Send + Sync + 'static,
        C: Fn(&[ContainerStatus]) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(FnListener::new(on_allocated, on_completed)));
    }

    /// Progress reported on the next heartbeat, clamped to `[0, 1]`.
    pub fn set_progress(&self, progress: f32) {
        let clamped = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        self.progress.store(clamped.to_bits(), Ordering::Release);
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Acquire))
    }

    pub fn registry(&self) -> &AllocationGroupRegistry {
        &self.registry
    }

    pub fn group(&self, id: &str) -> Option<Arc<AllocationGroup>> {
        self.registry.get(id)
    }

    /// Run one allocate round-trip.
    ///
    /// Heartbeats never overlap; a concurrent call waits for the current
    /// one to finish.
    pub async fn heartbeat(&self) -> HeartbeatOutcome {
        let _tick = self.tick.lock().await;

        let flushed = self.dirty.swap(false, Ordering::AcqRel);
        let groups = if flushed {
            self.registry.groups()
        } else {
            Vec::new()
        };
        let asks: Vec<_> = groups.iter().flat_map(|g| g.flush_asks()).collect();
        let releases = lock(&self.releases).drain();

        let request = AllocateRequest {
            response_id: self.response_id.load(Ordering::Acquire),
            asks,
            releases,
            progress: self.progress(),
        };
        let ask_count = request.asks.len();
        let sent_releases = request.releases.clone();
        debug!(
            response_id = request.response_id,
            asks = ask_count,
            releases = sent_releases.len(),
            progress = request.progress,
            "sending heartbeat"
        );

        let response = match self.client.allocate(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "heartbeat failed, retrying next tick");
                if flushed {
                    for group in &groups {
                        group.mark_resend();
                    }
                    self.dirty.store(true, Ordering::Release);
                }
                lock(&self.releases).requeue(sent_releases);
                return HeartbeatOutcome::Failed;
            }
        };
        self.response_id
            .store(response.response_id, Ordering::Release);

        let mut summary = HeartbeatSummary {
            asks: ask_count,
            releases: sent_releases.len(),
            ..HeartbeatSummary::default()
        };

        let mut allocated = Vec::new();
        for container in response.granted {
            if self.reconcile(&container) {
                allocated.push(container);
            } else {
                self.discard(container);
                summary.garbage += 1;
            }
        }

        let mut completed = Vec::new();
        {
            let mut garbage = lock(&self.garbage);
            for status in response.completed {
                if garbage.remove(&status.id).is_some() {
                    debug!(container = %status.id, "suppressed completion of garbage container");
                    summary.suppressed += 1;
                } else {
                    completed.push(status);
                }
            }
            garbage.retain(|id, left| {
                *left -= 1;
                if *left == 0 {
                    warn!(container = %id, "no completion reported for released garbage container");
                }
                *left > 0
            });
        }

        summary.allocated = allocated.len();
        summary.completed = completed.len();
        self.listeners.allocated(&allocated);
        self.listeners.completed(&completed);

        debug!(
            response_id = response.response_id,
            allocated = summary.allocated,
            garbage = summary.garbage,
            completed = summary.completed,
            suppressed = summary.suppressed,
            "heartbeat complete"
        );
        HeartbeatOutcome::Completed(summary)
    }

    fn reconcile(&self, container: &Container) -> bool {
        match self.registry.find_by_priority(container.priority) {
            Some((group, bucket)) => group
                .tracker(bucket)
                .is_some_and(|tracker| tracker.reconcile_grant(container)),
            None => {
                warn!(
                    container = %container.id,
                    priority = container.priority,
                    "grant with unknown priority"
                );
                false
            }
        }
    }

    fn discard(&self, container: Container) {
        info!(
            container = %container.id,
            host = %container.host,
            priority = container.priority,
            "releasing unrequested container"
        );
        lock(&self.garbage).insert(container.id.clone(), GARBAGE_RETENTION_HEARTBEATS);
        lock(&self.releases).push(container.id);
    }

    /// Start heartbeating on the configured trigger.
    ///
    /// The engine only holds a weak reference; dropping the last `Arc`
    /// turns remaining ticks into no-ops.
    pub fn start(self: &Arc<Self>) -> AllocateResult<()> {
        let weak = Arc::downgrade(self);
        let poll: PollFn = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(allocator) = weak.upgrade() {
                    allocator.heartbeat().await;
                }
            })
        });
        self.engine.start(poll)?;
        Ok(())
    }

    /// Stop future heartbeats. An in-flight heartbeat runs to completion.
    pub fn stop(&self) {
        self.engine.stop();
    }

    pub async fn stop_and_join(&self) {
        self.engine.stop_and_join().await;
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }
}

impl std::fmt::Debug for ContainerAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerAllocator")
            .field("registry", &self.registry)
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .field("progress", &self.progress())
            .field("response_id", &self.response_id.load(Ordering::Relaxed))
            .field("engine", &self.engine.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{finished, grant, MockResourceManager};
    use amgrid_core::{ResourceAsk, ANY_RESOURCE};
    use std::time::Duration;

    fn allocator() -> (Arc<MockResourceManager>, ContainerAllocator) {
        let rm = MockResourceManager::new();
        let allocator = ContainerAllocator::new(rm.clone());
        (rm, allocator)
    }

    fn recorded(allocator: &ContainerAllocator) -> Arc<Mutex<Vec<String>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let on_allocated = events.clone();
        let on_completed = events.clone();
        allocator.add_listener_fn(
            move |containers: &[Container]| {
                on_allocated
                    .lock()
                    .unwrap()
                    .extend(containers.iter().map(|c| format!("+{}", c.id)));
            },
            move |statuses: &[ContainerStatus]| {
                on_completed
                    .lock()
                    .unwrap()
                    .extend(statuses.iter().map(|s| format!("-{}", s.id)));
            },
        );
        events
    }

    fn summary(outcome: HeartbeatOutcome) -> HeartbeatSummary {
        match outcome {
            HeartbeatOutcome::Completed(summary) => summary,
            HeartbeatOutcome::Failed => panic!("heartbeat failed"),
        }
    }

    fn asks_by_name(asks: &[ResourceAsk]) -> BTreeMap<(i32, String), u32> {
        asks.iter()
            .map(|a| ((a.priority, a.resource_name.clone()), a.count))
            .collect()
    }

    fn tracker(allocator: &ContainerAllocator, id: &str, bucket: BucketKind) -> Arc<AllocateCountTracker> {
        allocator
            .group(id)
            .and_then(|g| g.tracker(bucket).cloned())
            .unwrap()
    }

    #[tokio::test]
    async fn any_request_is_asked_and_granted() {
        let (rm, allocator) = allocator();
        let events = recorded(&allocator);
        allocator.allocate(3u32).unwrap();

        rm.respond(vec![grant("c1", "h1", 0), grant("c2", "h2", 0)], vec![]);
        let s = summary(allocator.heartbeat().await);

        let request = rm.last_request();
        assert_eq!(
            request.asks,
            vec![ResourceAsk {
                priority: 0,
                resource_name: ANY_RESOURCE.to_string(),
                count: 3,
                relax_locality: true,
                label_expression: None,
                memory_mb: 64,
                vcores: 1,
            }]
        );
        assert_eq!(s.allocated, 2);
        assert_eq!(s.garbage, 0);
        assert_eq!(*events.lock().unwrap(), vec!["+c1", "+c2"]);
        assert_eq!(tracker(&allocator, "", BucketKind::Any).snapshot().inflight_any, 1);
    }

    #[tokio::test]
    async fn host_requests_before_a_tick_are_summed() {
        let (rm, allocator) = allocator();
        allocator
            .allocate(AllocationRequestData::new().with_host("h1", 2))
            .unwrap();
        allocator
            .allocate(AllocationRequestData::new().with_host("h1", 1))
            .unwrap();

        allocator.heartbeat().await;

        let asks = asks_by_name(&rm.last_request().asks);
        assert_eq!(asks.len(), 3);
        assert_eq!(asks[&(0, "h1".to_string())], 3);
        assert_eq!(asks[&(0, "/default-rack".to_string())], 3);
        assert_eq!(asks[&(0, "*".to_string())], 6);
    }

    #[tokio::test]
    async fn grants_route_to_group_by_priority() {
        let (rm, allocator) = allocator();
        for (id, priority) in [("g1", 10), ("g2", 20)] {
            allocator
                .set_group_settings(
                    id,
                    GroupSettings {
                        priority,
                        ..GroupSettings::default()
                    },
                )
                .unwrap();
            allocator
                .allocate(AllocationRequestData::for_group(id).with_any(1))
                .unwrap();
        }

        rm.respond(vec![grant("c1", "h1", 20)], vec![]);
        let s = summary(allocator.heartbeat().await);

        assert_eq!(s.allocated, 1);
        assert_eq!(tracker(&allocator, "g1", BucketKind::Any).snapshot().inflight_any, 1);
        assert_eq!(tracker(&allocator, "g2", BucketKind::Any).snapshot().inflight_any, 0);
        let asks = asks_by_name(&rm.last_request().asks);
        assert_eq!(asks[&(10, "*".to_string())], 1);
        assert_eq!(asks[&(20, "*".to_string())], 1);
    }

    #[tokio::test]
    async fn grant_on_unrequested_host_matches_any() {
        let (rm, allocator) = allocator();
        let events = recorded(&allocator);
        allocator.allocate(5u32).unwrap();
        allocator.heartbeat().await;

        rm.respond(vec![grant("c1", "h9", 0)], vec![]);
        let s = summary(allocator.heartbeat().await);

        assert_eq!(s.garbage, 0);
        assert_eq!(*events.lock().unwrap(), vec!["+c1"]);
        assert_eq!(tracker(&allocator, "", BucketKind::Any).snapshot().inflight_any, 4);
    }

    #[tokio::test]
    async fn garbage_is_released_and_its_completion_suppressed_once() {
        let (rm, allocator) = allocator();
        let events = recorded(&allocator);
        allocator.allocate(1u32).unwrap();

        rm.respond(
            vec![
                grant("c1", "h1", 0),
                grant("c2", "h1", 0),
                grant("c3", "h1", 99),
            ],
            vec![],
        );
        let s = summary(allocator.heartbeat().await);
        assert_eq!(s.allocated, 1);
        assert_eq!(s.garbage, 2);

        rm.respond(vec![], vec![finished("c2"), finished("c3"), finished("c1")]);
        let s = summary(allocator.heartbeat().await);
        assert_eq!(
            rm.last_request().releases,
            vec![ContainerId::from("c2"), ContainerId::from("c3")]
        );
        assert!(rm.last_request().asks.is_empty());
        assert_eq!(s.suppressed, 2);
        assert_eq!(s.completed, 1);

        // A second report of the same id is no longer garbage.
        rm.respond(vec![], vec![finished("c2")]);
        allocator.heartbeat().await;

        assert_eq!(*events.lock().unwrap(), vec!["+c1", "-c1", "-c2"]);
        assert!(rm.last_request().releases.is_empty());
    }

    #[tokio::test]
    async fn unreported_garbage_is_forgotten() {
        let (rm, allocator) = allocator();
        let events = recorded(&allocator);

        rm.respond(vec![grant("stray", "h1", 7)], vec![]);
        let s = summary(allocator.heartbeat().await);
        assert_eq!(s.garbage, 1);
        assert_eq!(lock(&allocator.garbage).len(), 1);

        for _ in 1..GARBAGE_RETENTION_HEARTBEATS {
            allocator.heartbeat().await;
        }
        assert!(lock(&allocator.garbage).is_empty());

        rm.respond(vec![], vec![finished("stray")]);
        let s = summary(allocator.heartbeat().await);
        assert_eq!(s.suppressed, 0);
        assert_eq!(s.completed, 1);
        assert_eq!(*events.lock().unwrap(), vec!["-stray"]);
    }

    #[tokio::test]
    async fn unchanged_state_sends_no_asks() {
        let (rm, allocator) = allocator();
        allocator.allocate(2u32).unwrap();
        allocator.heartbeat().await;
        allocator.heartbeat().await;

        let requests = rm.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].asks.len(), 1);
        assert!(requests[1].asks.is_empty());
    }

    #[tokio::test]
    async fn failed_heartbeat_resends_everything_next_tick() {
        let (rm, allocator) = allocator();
        allocator
            .allocate(AllocationRequestData::new().with_host("h1", 1))
            .unwrap();
        allocator.release("old");

        rm.fail("connection reset");
        assert_eq!(allocator.heartbeat().await, HeartbeatOutcome::Failed);

        allocator.release("newer");
        allocator.heartbeat().await;

        let requests = rm.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].asks, requests[1].asks);
        assert_eq!(requests[1].response_id, 0);
        assert_eq!(
            requests[1].releases,
            vec![ContainerId::from("old"), ContainerId::from("newer")]
        );

        let snap = tracker(&allocator, "", BucketKind::Host).snapshot();
        assert_eq!(snap.inflight_hosts.get("h1"), Some(&1));
        assert_eq!(snap.pending_hosts.get("h1"), Some(&0));
    }

    #[tokio::test]
    async fn response_ids_follow_the_previous_reply() {
        let (rm, allocator) = allocator();
        allocator.heartbeat().await;
        allocator.heartbeat().await;
        rm.fail("timeout");
        allocator.heartbeat().await;
        allocator.heartbeat().await;

        let ids: Vec<i32> = rm.requests().iter().map(|r| r.response_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 2]);
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let (rm, allocator) = allocator();
        for (input, sent) in [(0.5, 0.5), (1.5, 1.0), (-0.2, 0.0), (f32::NAN, 0.0)] {
            allocator.set_progress(input);
            allocator.heartbeat().await;
            assert_eq!(rm.last_request().progress, sent);
        }
    }

    #[tokio::test]
    async fn duplicate_releases_are_sent_once() {
        let (rm, allocator) = allocator();
        allocator.release("c1");
        allocator.release("c1");
        allocator.release_all(["c1", "c2"]);
        allocator.heartbeat().await;

        assert_eq!(
            rm.last_request().releases,
            vec![ContainerId::from("c1"), ContainerId::from("c2")]
        );
    }

    #[tokio::test]
    async fn rejected_request_changes_nothing() {
        let (rm, allocator) = allocator();
        let err = allocator
            .allocate(AllocationRequestData::new().with_any(1).with_host("*", 1))
            .unwrap_err();
        assert!(matches!(err, AllocateError::InvalidRequest(_)));
        assert!(allocator.group(DEFAULT_GROUP_ID).is_none());

        allocator.heartbeat().await;
        assert!(rm.last_request().asks.is_empty());
    }

    #[tokio::test]
    async fn exhausted_priorities_leave_no_partial_request() {
        let rm = MockResourceManager::new();
        let allocator = ContainerAllocator::new(rm.clone()).with_priority_ceiling(1);

        let err = allocator
            .allocate(
                AllocationRequestData::new()
                    .with_any(1)
                    .with_host("h1", 1)
                    .with_rack("/r1", 1),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AllocateError::PriorityExhausted {
                bucket: BucketKind::Rack,
                ..
            }
        ));

        allocator.heartbeat().await;
        assert!(rm.last_request().asks.is_empty());
    }

    #[test]
    fn group_settings_conflict_with_existing_group() {
        let (_rm, allocator) = allocator();
        let settings = |priority| GroupSettings {
            priority,
            ..GroupSettings::default()
        };
        allocator.set_group_settings("g1", settings(10)).unwrap();
        allocator
            .allocate(AllocationRequestData::for_group("g1").with_any(1))
            .unwrap();

        allocator.set_group_settings("g1", settings(10)).unwrap();
        assert!(matches!(
            allocator.set_group_settings("g1", settings(11)),
            Err(AllocateError::GroupConflict {
                existing: 10,
                requested: 11,
                ..
            })
        ));
        assert_eq!(allocator.group_settings("unknown"), GroupSettings::default());
    }

    #[test]
    fn shape_of_existing_group_cannot_change() {
        let (_rm, allocator) = allocator();
        allocator.allocate(3u32).unwrap();

        let bigger = GroupSettings {
            memory_mb: 1024,
            ..GroupSettings::default()
        };
        assert!(matches!(
            allocator.set_group_settings(DEFAULT_GROUP_ID, bigger),
            Err(AllocateError::ShapeConflict(id)) if id.is_empty()
        ));
        let strict = GroupSettings {
            relax_locality: false,
            ..GroupSettings::default()
        };
        assert!(allocator.set_group_settings(DEFAULT_GROUP_ID, strict).is_err());

        assert_eq!(allocator.group(DEFAULT_GROUP_ID).unwrap().shape().memory_mb, 64);
        assert_eq!(allocator.group_settings(DEFAULT_GROUP_ID), GroupSettings::default());
        allocator
            .set_group_settings(DEFAULT_GROUP_ID, GroupSettings::default())
            .unwrap();
    }

    #[test]
    fn config_drives_groups_and_racks() {
        let config = AllocatorConfig::from_toml_str(
            r#"
            heartbeat = "1s"

            [groups.gpu]
            priority = 7
            memory_mb = 2048
            vcores = 4
            relax_locality = false
            label_expression = "gpu"

            [racks.hosts]
            h1 = "/r1"
            "#,
        )
        .unwrap();
        let allocator = ContainerAllocator::from_config(MockResourceManager::new(), &config).unwrap();

        allocator
            .allocate(AllocationRequestData::for_group("gpu").with_host("h1", 1))
            .unwrap();
        let group = allocator.group("gpu").unwrap();
        assert_eq!(group.base_priority(), 7);
        assert_eq!(group.shape().memory_mb, 2048);

        let asks = group.flush_asks();
        let rack = asks.iter().find(|a| a.resource_name == "/r1").unwrap();
        let any = asks.iter().find(|a| a.is_wildcard()).unwrap();
        assert!(!rack.relax_locality);
        assert_eq!(any.label_expression.as_deref(), Some("gpu"));
        assert_eq!(any.count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_drives_heartbeats_until_stopped() {
        let rm = MockResourceManager::new();
        let allocator = Arc::new(
            ContainerAllocator::new(rm.clone())
                .with_trigger(Trigger::fixed_delay(Duration::from_secs(1))),
        );
        allocator.allocate(1u32).unwrap();

        allocator.start().unwrap();
        assert!(allocator.is_running());
        assert!(matches!(allocator.start(), Err(AllocateError::Poll(_))));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        allocator.stop_and_join().await;
        assert!(!allocator.is_running());

        let sent = rm.requests().len();
        assert!(sent >= 3, "expected at least 3 heartbeats, got {sent}");
        assert_eq!(rm.requests()[0].asks.len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rm.requests().len(), sent);
    }

    #[tokio::test]
    async fn concurrent_requests_are_all_asked() {
        let (rm, allocator) = allocator();
        let allocator = Arc::new(allocator);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    allocator
                        .allocate(AllocationRequestData::new().with_any(1).with_host("h1", 1))
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        allocator.heartbeat().await;
        let asks = asks_by_name(&rm.last_request().asks);
        assert_eq!(asks[&(0, "*".to_string())], 200);
        assert_eq!(asks[&(1, "h1".to_string())], 200);
        assert_eq!(asks[&(1, "*".to_string())], 400);
    }
}
