//! Errors from the context executor

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("Owning context has stopped")]
    Stopped,

    #[error("Timed out after {0:?} waiting for the owning context")]
    Timeout(Duration),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Not running on the owning context thread")]
    NotContextThread,

    #[error("Blocking wait attempted on the owning context thread")]
    ContextThread,

    #[error("Context loop cannot block here: {0}")]
    Runtime(String),
}
