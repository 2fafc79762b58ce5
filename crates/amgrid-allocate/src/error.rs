//! Allocator error types.
//!
//! Every variant is raised synchronously to the caller that misused the
//! API. Protocol-level faults (failed heartbeats, unmatched grants,
//! rack resolution failures) are absorbed and logged instead.

use amgrid_core::BucketKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocateError {
    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("unknown allocation group: {0:?}")]
    UnknownGroup(String),

    #[error(
        "allocation group {id:?} already registered with base priority {existing}, not {requested}"
    )]
    GroupConflict {
        id: String,
        existing: i32,
        requested: i32,
    },

    #[error("allocation group {0:?} already exists with a different resource shape")]
    ShapeConflict(String),

    #[error("no free priority for group {group:?} bucket {bucket} at or above {start}")]
    PriorityExhausted {
        group: String,
        bucket: BucketKind,
        start: i32,
    },

    #[error("polling error: {0}")]
    Poll(#[from] amgrid_poll::PollError),
}

pub type AllocateResult<T> = Result<T, AllocateError>;
