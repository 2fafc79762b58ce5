//! Allocation event listeners.

use std::sync::{Arc, RwLock};

use amgrid_core::{Container, ContainerStatus};

use crate::sync::{read, write};

/// Receives the containers the allocator keeps and the ones that finish.
///
/// Both callbacks run on the heartbeat task and should return quickly.
pub trait AllocatorListener: Send + Sync {
    fn allocated(&self, containers: &[Container]);

    fn completed(&self, _statuses: &[ContainerStatus]) {}
}

/// Adapts a pair of closures into a listener.
pub struct FnListener<A, C> {
    on_allocated: A,
    on_completed: C,
}

impl<A, C> FnListener<A, C>
where
    A: Fn(&[Container]) + Send + Sync,
    C: Fn(&[ContainerStatus]) + Send + Sync,
{
    pub fn new(on_allocated: A, on_completed: C) -> Self {
        Self {
            on_allocated,
            on_completed,
        }
    }
}

impl<A, C> AllocatorListener for FnListener<A, C>
where
    A: Fn(&[Container]) + Send + Sync,
    C: Fn(&[ContainerStatus]) + Send + Sync,
{
    fn allocated(&self, containers: &[Container]) {
        (self.on_allocated)(containers)
    }

    fn completed(&self, statuses: &[ContainerStatus]) {
        (self.on_completed)(statuses)
    }
}

/// Fans every event out to a list of listeners, in registration order.
#[derive(Default)]
pub struct CompositeListener {
    listeners: RwLock<Vec<Arc<dyn AllocatorListener>>>,
}

impl CompositeListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn AllocatorListener>) {
        write(&self.listeners).push(listener);
    }

    pub fn len(&self) -> usize {
        read(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Snapshot so a listener may register another without deadlocking.
    fn snapshot(&self) -> Vec<Arc<dyn AllocatorListener>> {
        read(&self.listeners).clone()
    }
}

impl AllocatorListener for CompositeListener {
    fn allocated(&self, containers: &[Container]) {
        if containers.is_empty() {
            return;
        }
        for listener in self.snapshot() {
            listener.allocated(containers);
        }
    }

    fn completed(&self, statuses: &[ContainerStatus]) {
        if statuses.is_empty() {
            return;
        }
        for listener in self.snapshot() {
            listener.completed(statuses);
        }
    }
}

impl std::fmt::Debug for CompositeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeListener")
            .field("listeners", &self.len())
            .finish()
    }
}
