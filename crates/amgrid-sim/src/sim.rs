//! In-process resource manager used by the simulator.
//!
//! It keeps the latest ask per `(priority, resource name)` the way a real
//! resource manager keeps its ask table, and grants against it one
//! heartbeat at a time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use amgrid_allocate::ResourceManagerClient;
use amgrid_core::{
    AllocateRequest, AllocateResponse, ANY_RESOURCE, Container, ContainerId, ContainerStatus,
    RackConfig, Resource, ResourceAsk,
};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// Exit status reported for containers the application released.
pub const EXIT_RELEASED: i32 = -100;

/// Hosts used when the config names none.
const DEFAULT_HOSTS: [&str; 3] = ["node-1", "node-2", "node-3"];

/// Cluster layout: the hosts the simulator places containers on and
/// their racks.
#[derive(Debug, Clone)]
pub struct Topology {
    hosts: Vec<String>,
    rack_of: HashMap<String, String>,
    default_rack: String,
}

impl Topology {
    /// Hosts from the rack table plus `extra_hosts`, in name order.
    pub fn from_config(racks: &RackConfig, extra_hosts: impl IntoIterator<Item = String>) -> Self {
        let mut hosts: BTreeSet<String> = racks.hosts.keys().cloned().collect();
        hosts.extend(extra_hosts);
        if hosts.is_empty() {
            hosts.extend(DEFAULT_HOSTS.iter().map(|h| h.to_string()));
        }

        Self {
            hosts: hosts.into_iter().collect(),
            rack_of: racks
                .hosts
                .iter()
                .map(|(host, rack)| (host.clone(), rack.clone()))
                .collect(),
            default_rack: racks.default_rack.clone(),
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn rack_of(&self, host: &str) -> &str {
        self.rack_of
            .get(host)
            .map(String::as_str)
            .unwrap_or(&self.default_rack)
    }

    fn is_rack(&self, name: &str) -> bool {
        name == self.default_rack || self.rack_of.values().any(|rack| rack == name)
    }

    fn hosts_in<'a>(&'a self, rack: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.hosts.iter().filter(move |host| self.rack_of(host) == rack)
    }
}

/// Totals over the simulator's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub heartbeats: u64,
    pub granted: u64,
    pub completed: u64,
    pub released: u64,
}

#[derive(Debug, Default)]
struct SimState {
    heartbeat: u64,
    asks: BTreeMap<(i32, String), ResourceAsk>,
    /// Granted containers and the heartbeat they complete on.
    running: Vec<(ContainerId, u64)>,
    /// Released last heartbeat; reported completed on this one.
    released: Vec<ContainerId>,
    next_container: u64,
    cursor: usize,
    stats: SimStats,
}

pub struct SimulatedResourceManager {
    topology: Topology,
    grants_per_tick: usize,
    complete_after: u64,
    state: Mutex<SimState>,
}

impl SimulatedResourceManager {
    /// Grant at most `grants_per_tick` containers per heartbeat and report
    /// each one completed `complete_after` heartbeats later (at least one).
    pub fn new(topology: Topology, grants_per_tick: usize, complete_after: u64) -> Self {
        Self {
            topology,
            grants_per_tick,
            complete_after: complete_after.max(1),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }

    /// Outstanding count of an ask, as last sent.
    #[cfg(test)]
    pub fn ask_count(&self, priority: i32, name: &str) -> u32 {
        count(&self.lock(), priority, name)
    }

    /// Containers granted and not yet completed or released.
    pub fn running(&self) -> usize {
        self.lock().running.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn heartbeat(&self, request: AllocateRequest) -> AllocateResponse {
        let mut state = self.lock();
        state.heartbeat += 1;
        let now = state.heartbeat;
        state.stats.heartbeats += 1;

        for ask in request.asks {
            state.asks.insert((ask.priority, ask.resource_name.clone()), ask);
        }

        let mut completed: Vec<ContainerStatus> = std::mem::take(&mut state.released)
            .into_iter()
            .map(|id| ContainerStatus {
                id,
                exit_status: EXIT_RELEASED,
                diagnostics: "released by application".to_string(),
            })
            .collect();

        for id in request.releases {
            if let Some(pos) = state.running.iter().position(|(running, _)| *running == id) {
                state.running.remove(pos);
                state.released.push(id);
                state.stats.released += 1;
            }
        }

        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut state.running)
            .into_iter()
            .partition(|(_, due)| *due <= now);
        state.running = running;
        completed.extend(done.into_iter().map(|(id, _)| ContainerStatus {
            id,
            exit_status: 0,
            diagnostics: String::new(),
        }));
        state.stats.completed += completed.len() as u64;

        let granted = self.grant(&mut state);
        let due = now + self.complete_after;
        state
            .running
            .extend(granted.iter().map(|c| (c.id.clone(), due)));
        state.stats.granted += granted.len() as u64;

        debug!(
            heartbeat = now,
            granted = granted.len(),
            completed = completed.len(),
            running = state.running.len(),
            "simulated heartbeat"
        );

        AllocateResponse {
            response_id: request.response_id + 1,
            granted,
            completed,
        }
    }

    /// Host asks first, then rack asks, then the wildcard, lowest priority
    /// value first. Nothing is granted at a priority whose wildcard is 0.
    fn grant(&self, state: &mut SimState) -> Vec<Container> {
        let mut granted = Vec::new();
        let priorities: BTreeSet<i32> = state.asks.keys().map(|(p, _)| *p).collect();

        for priority in priorities {
            let (racks, hosts): (Vec<String>, Vec<String>) = state
                .asks
                .range((priority, String::new())..)
                .take_while(|((p, _), _)| *p == priority)
                .map(|((_, name), _)| name.clone())
                .filter(|name| name != ANY_RESOURCE)
                .partition(|name| self.topology.is_rack(name));

            for host in hosts {
                while self.has_budget(&granted)
                    && count(state, priority, &host) > 0
                    && count(state, priority, ANY_RESOURCE) > 0
                {
                    granted.push(self.place(state, priority, &host));
                }
            }

            for rack in racks {
                let candidates: Vec<String> = self.topology.hosts_in(&rack).cloned().collect();
                if candidates.is_empty() {
                    continue;
                }
                while self.has_budget(&granted)
                    && count(state, priority, &rack) > 0
                    && count(state, priority, ANY_RESOURCE) > 0
                {
                    let host = candidates[state.cursor % candidates.len()].clone();
                    state.cursor += 1;
                    granted.push(self.place(state, priority, &host));
                }
            }

            while self.has_budget(&granted) && count(state, priority, ANY_RESOURCE) > 0 {
                let hosts = self.topology.hosts();
                let host = hosts[state.cursor % hosts.len()].clone();
                state.cursor += 1;
                granted.push(self.place(state, priority, &host));
            }
        }
        granted
    }

    fn has_budget(&self, granted: &[Container]) -> bool {
        granted.len() < self.grants_per_tick
    }

    fn place(&self, state: &mut SimState, priority: i32, host: &str) -> Container {
        let rack = self.topology.rack_of(host).to_string();
        for name in [host, rack.as_str(), ANY_RESOURCE] {
            if let Some(ask) = state.asks.get_mut(&(priority, name.to_string())) {
                ask.count = ask.count.saturating_sub(1);
            }
        }

        let resource = state
            .asks
            .get(&(priority, ANY_RESOURCE.to_string()))
            .map(|ask| Resource {
                memory_mb: ask.memory_mb,
                vcores: ask.vcores,
            })
            .unwrap_or(Resource {
                memory_mb: 0,
                vcores: 0,
            });

        state.next_container += 1;
        Container {
            id: ContainerId::new(format!("container_{:06}", state.next_container)),
            host: host.to_string(),
            priority,
            resource,
        }
    }
}

fn count(state: &SimState, priority: i32, name: &str) -> u32 {
    state
        .asks
        .get(&(priority, name.to_string()))
        .map_or(0, |ask| ask.count)
}

#[async_trait]
impl ResourceManagerClient for SimulatedResourceManager {
    async fn allocate(&self, request: AllocateRequest) -> anyhow::Result<AllocateResponse> {
        Ok(self.heartbeat(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amgrid_allocate::{AllocationRequestData, ContainerAllocator, HeartbeatOutcome};
    use std::sync::Arc;

    fn topology() -> Topology {
        let mut racks = RackConfig::default();
        racks.hosts.insert("h1".to_string(), "/r1".to_string());
        racks.hosts.insert("h2".to_string(), "/r1".to_string());
        racks.hosts.insert("h3".to_string(), "/r2".to_string());
        Topology::from_config(&racks, [])
    }

    fn ask(priority: i32, name: &str, count: u32) -> ResourceAsk {
        ResourceAsk {
            priority,
            resource_name: name.to_string(),
            count,
            relax_locality: true,
            label_expression: None,
            memory_mb: 128,
            vcores: 1,
        }
    }

    fn request(asks: Vec<ResourceAsk>, releases: Vec<ContainerId>) -> AllocateRequest {
        AllocateRequest {
            response_id: 0,
            asks,
            releases,
            progress: 0.0,
        }
    }

    #[test]
    fn topology_defaults_and_racks() {
        let topo = Topology::from_config(&RackConfig::default(), []);
        assert_eq!(topo.hosts(), ["node-1", "node-2", "node-3"]);
        assert_eq!(topo.rack_of("node-1"), "/default-rack");

        let topo = topology();
        assert_eq!(topo.rack_of("h3"), "/r2");
        assert!(topo.is_rack("/r1"));
        assert!(!topo.is_rack("h1"));
        assert_eq!(topo.hosts_in("/r1").count(), 2);
    }

    #[test]
    fn host_asks_are_granted_on_their_host() {
        let rm = SimulatedResourceManager::new(topology(), 10, 3);
        let response = rm.heartbeat(request(
            vec![ask(1, "*", 2), ask(1, "/r2", 1), ask(1, "h3", 1)],
            vec![],
        ));

        assert_eq!(response.response_id, 1);
        assert_eq!(response.granted.len(), 2);
        assert_eq!(response.granted[0].host, "h3");
        assert_eq!(response.granted[0].priority, 1);
        assert_eq!(response.granted[0].resource.memory_mb, 128);
        assert_eq!(rm.ask_count(1, "h3"), 0);
        assert_eq!(rm.ask_count(1, "/r2"), 0);
        assert_eq!(rm.ask_count(1, "*"), 0);
    }

    #[test]
    fn rack_asks_land_inside_the_rack() {
        let rm = SimulatedResourceManager::new(topology(), 10, 3);
        let response = rm.heartbeat(request(vec![ask(0, "*", 2), ask(0, "/r1", 2)], vec![]));

        assert_eq!(response.granted.len(), 2);
        assert!(response.granted.iter().all(|c| c.host == "h1" || c.host == "h2"));
        assert_eq!(rm.ask_count(0, "/r1"), 0);
    }

    #[test]
    fn nothing_is_granted_without_a_wildcard() {
        let rm = SimulatedResourceManager::new(topology(), 10, 3);
        let response = rm.heartbeat(request(vec![ask(0, "*", 0), ask(0, "h1", 2)], vec![]));
        assert!(response.granted.is_empty());
    }

    #[test]
    fn grants_are_capped_per_heartbeat() {
        let rm = SimulatedResourceManager::new(topology(), 2, 3);
        assert_eq!(rm.heartbeat(request(vec![ask(0, "*", 5)], vec![])).granted.len(), 2);
        assert_eq!(rm.heartbeat(request(vec![], vec![])).granted.len(), 2);
        assert_eq!(rm.heartbeat(request(vec![], vec![])).granted.len(), 1);
        assert_eq!(rm.stats().granted, 5);
    }

    #[test]
    fn completions_and_releases() {
        let rm = SimulatedResourceManager::new(topology(), 10, 2);
        let granted = rm.heartbeat(request(vec![ask(0, "*", 2)], vec![])).granted;
        let (keep, drop) = (granted[0].id.clone(), granted[1].id.clone());

        // Heartbeat 2: release one; nothing is due yet.
        let response = rm.heartbeat(request(vec![], vec![drop.clone()]));
        assert!(response.completed.is_empty());

        // Heartbeat 3: the released one is reported, the other is due.
        let response = rm.heartbeat(request(vec![], vec![]));
        let statuses: Vec<(ContainerId, i32)> = response
            .completed
            .iter()
            .map(|s| (s.id.clone(), s.exit_status))
            .collect();
        assert_eq!(statuses, vec![(drop, EXIT_RELEASED), (keep, 0)]);
        assert_eq!(rm.running(), 0);
        assert_eq!(
            rm.stats(),
            SimStats {
                heartbeats: 3,
                granted: 2,
                completed: 2,
                released: 1,
            }
        );
    }

    #[tokio::test]
    async fn allocator_converges_against_simulator() {
        let rm = Arc::new(SimulatedResourceManager::new(topology(), 16, 2));
        let allocator = ContainerAllocator::new(rm.clone());
        allocator
            .allocate(AllocationRequestData::new().with_any(3).with_host("h1", 2))
            .unwrap();

        let mut allocated = 0;
        let mut garbage = 0;
        for _ in 0..5 {
            if let HeartbeatOutcome::Completed(summary) = allocator.heartbeat().await {
                allocated += summary.allocated;
                garbage += summary.garbage;
            }
        }

        // The host bucket's wildcard also covers the mirrored rack ask; the
        // two extra grants it draws are matched against that rack count.
        assert_eq!(allocated, 7);
        assert_eq!(garbage, 0);
        assert_eq!(rm.stats().granted, 7);
        assert_eq!(rm.stats().released, 0);
        assert_eq!(rm.running(), 0);
    }
}
