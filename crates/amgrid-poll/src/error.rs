//! Polling engine error types.

use thiserror::Error;

/// Errors raised synchronously by [`crate::PollingEngine::start`].
#[derive(Debug, Error)]
pub enum PollError {
    #[error("polling engine {0:?} is already running")]
    AlreadyRunning(String),

    #[error("unable to start polling engine {0:?}: no tokio runtime available")]
    NoRuntime(String),
}

pub type PollResult<T> = Result<T, PollError>;
