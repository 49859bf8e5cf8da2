//! Error type.
//!
//! This is the shared error type for the whole crate. Hazard diagnostics are
//! not errors: they are logged through [`log`] and never abort recording.

use crate::handle::RawId;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The handle is stale (generation mismatch), out of range, or refers to
    /// a dead slot. Nothing was mutated.
    #[error("invalid handle {0:?}")]
    InvalidHandle(RawId),

    /// Recording-time validation rejected the call; the task graph is
    /// unchanged.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Device memory exhausted after the configured number of growth steps.
    #[error("out of device memory")]
    OutOfMemory,

    /// All staging rings are in flight and the oldest frame did not retire
    /// within the configured timeout.
    #[error("staging buffers exhausted")]
    StagingExhausted,

    /// No command-buffer slot is available on the requested queue.
    #[error("queue exhausted")]
    QueueExhausted,

    /// Shader or pipeline compilation failed.
    #[error("pipeline compilation failed: {0}")]
    CompileFailed(String),

    /// The device was lost; the frame graph is in a terminal state and must
    /// be rebuilt.
    #[error("device lost")]
    DeviceLost,

    /// The operation was cancelled by teardown before it could complete.
    #[error("aborted")]
    Aborted,

    /// A driver wait exceeded its deadline.
    #[error("timed out")]
    Timeout,
}

pub type Result<T> = ::std::result::Result<T, Error>;

impl Error {
    /// True for errors that leave the frame graph unusable.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::DeviceLost => true,
            _ => false,
        }
    }
}
