//! amgrid-poll — periodic, non-overlapping task execution.
//!
//! A `PollingEngine` owns at most one background task which repeatedly
//! awaits a poll callback. The next poll is only scheduled after the
//! previous one has finished, so a callback never runs concurrently
//! with itself.
//!
//! # Architecture
//!
//! ```text
//! PollingEngine
//!   ├── Trigger (fixed delay | fixed rate, optional initial delay)
//!   ├── tokio runtime Handle (explicit or the ambient runtime)
//!   └── Running task
//!       ├── poll loop: select { timer, shutdown }
//!       └── watch::Sender<bool> shutdown signal
//! ```
//!
//! Stopping signals the loop and returns immediately. A poll already in
//! progress is allowed to finish; no further polls start afterwards.

pub mod engine;
pub mod error;
pub mod trigger;

pub use engine::{PollFn, PollFuture, PollingEngine};
pub use error::{PollError, PollResult};
pub use trigger::Trigger;
