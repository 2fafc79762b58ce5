//! amgrid-allocate — container allocation against a resource manager.
//!
//! The embedding application asks for containers (anywhere, on hosts, or
//! on racks) from any thread. A single heartbeat task turns the pending
//! counts into cumulative asks, sends them to the resource manager and
//! matches the containers it grants back to what was asked for.
//!
//! # Architecture
//!
//! ```text
//! ContainerAllocator
//!   ├── AllocationGroupRegistry
//!   │     └── AllocationGroup (one per group id, fixed resource shape)
//!   │           ├── any  bucket ─ priority p0 ─ AllocateCountTracker
//!   │           ├── host bucket ─ priority p1 ─ AllocateCountTracker ─ RackResolver
//!   │           └── rack bucket ─ priority p2 ─ AllocateCountTracker
//!   ├── release queue + garbage set
//!   ├── CompositeListener (allocated / completed)
//!   └── PollingEngine ── heartbeat() ── ResourceManagerClient::allocate
//! ```
//!
//! Grants carry no request id. They are routed back by the priority they
//! are stamped with, then matched host, rack, any. Grants that match
//! nothing are released on the next heartbeat and never reach listeners.

pub mod allocator;
pub mod client;
pub mod error;
pub mod group;
pub mod listener;
pub mod rack;
pub mod request;
mod sync;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use allocator::{ContainerAllocator, HeartbeatOutcome, HeartbeatSummary};
pub use client::ResourceManagerClient;
pub use error::{AllocateError, AllocateResult};
pub use group::{AllocationGroup, AllocationGroupRegistry, DEFAULT_GROUP_ID};
pub use listener::{AllocatorListener, CompositeListener, FnListener};
pub use rack::{DefaultRackResolver, RackResolver, StaticRackResolver, DEFAULT_RACK};
pub use request::{AllocationRequestData, ValidatedRequest};
pub use tracker::{AllocateCountTracker, FlushedCounts, TrackerSnapshot};
