//! APO error types

use thiserror::Error;

/// Errors from property store access
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    #[error("Property store unavailable: {0}")]
    Unavailable(String),

    #[error("Property store is read-only")]
    ReadOnly,
}

/// Errors from the real-time work queue
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkQueueError {
    #[error("Work queue is full")]
    Full,

    #[error("Work queue has shut down")]
    ShutDown,
}

/// Errors from APO control-path calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApoError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("APO is already initialized")]
    AlreadyInitialized,

    #[error("APO is not initialized")]
    NotInitialized,

    #[error("APO is already locked for processing")]
    AlreadyLocked,

    #[error("APO is not locked for processing")]
    NotLocked,

    #[error("Invalid connection format: {0}")]
    InvalidConnectionFormat(&'static str),

    #[error("Invalid number of connections: {inputs} in, {outputs} out")]
    NumConnectionsInvalid { inputs: usize, outputs: usize },

    #[error("Out of memory allocating {0}")]
    OutOfMemory(&'static str),

    #[error("Effect not found")]
    NotFound,

    #[error("Work queue error: {0}")]
    WorkQueue(#[from] WorkQueueError),

    #[error("Property error: {0}")]
    Property(#[from] PropertyError),
}
