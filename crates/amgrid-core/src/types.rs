//! Shared types exchanged between the allocator and the resource manager.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Resource name of the wildcard ask.
pub const ANY_RESOURCE: &str = "*";

/// Opaque container identifier assigned by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Capability of a single container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

/// A container granted by the resource manager.
///
/// Grants carry no request identifier; the priority stamped on the
/// container and its host are all the allocator has to correlate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub host: String,
    pub priority: i32,
    pub resource: Resource,
}

/// Final status of a container reported by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub exit_status: i32,
    pub diagnostics: String,
}

/// Locality granularity of a tracked count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Any,
    Host,
    Rack,
}

impl BucketKind {
    /// All bucket kinds, in the order their priorities are reserved.
    pub const ALL: [BucketKind; 3] = [BucketKind::Any, BucketKind::Host, BucketKind::Rack];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Any => "any",
            BucketKind::Host => "host",
            BucketKind::Rack => "rack",
        }
    }

    /// Position of this bucket in [`BucketKind::ALL`].
    pub fn index(&self) -> usize {
        match self {
            BucketKind::Any => 0,
            BucketKind::Host => 1,
            BucketKind::Rack => 2,
        }
    }
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resource "shape" every ask of an allocation group carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub memory_mb: u64,
    pub vcores: u32,
    pub label_expression: Option<String>,
    /// Whether rack and wildcard asks of locality-specific buckets may be
    /// satisfied elsewhere.
    pub relax_locality: bool,
}

impl Default for ResourceShape {
    fn default() -> Self {
        Self {
            memory_mb: 64,
            vcores: 1,
            label_expression: None,
            relax_locality: true,
        }
    }
}

/// A wire-level request for `count` containers at one priority and resource name.
///
/// The count is cumulative: resending a smaller count for the same
/// `(priority, resource_name)` rescinds the difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAsk {
    pub priority: i32,
    /// `*`, a hostname, or a rack name.
    pub resource_name: String,
    pub count: u32,
    pub relax_locality: bool,
    pub label_expression: Option<String>,
    pub memory_mb: u64,
    pub vcores: u32,
}

impl ResourceAsk {
    pub fn is_wildcard(&self) -> bool {
        self.resource_name == ANY_RESOURCE
    }
}

/// One heartbeat sent to the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateRequest {
    /// Response id returned by the previous successful heartbeat.
    pub response_id: i32,
    pub asks: Vec<ResourceAsk>,
    pub releases: Vec<ContainerId>,
    /// Application progress in `[0, 1]`.
    pub progress: f32,
}

/// What the resource manager returned for one heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub response_id: i32,
    pub granted: Vec<Container>,
    pub completed: Vec<ContainerStatus>,
}
