//! Wave-RT stream error codes

use crate::format::FormatError;
use thiserror::Error;

/// Errors returned by wave-RT stream operations
///
/// Sequencing errors (`DeviceNotReady`, `DataLateError`, `DataOverrun`,
/// `InvalidDeviceState`) are recoverable by the client; none of them leave
/// the stream in a partially mutated state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("operation requires event-driven notification mode")]
    NotSupported,

    #[error("operation not valid in the current stream state")]
    InvalidDeviceState,

    #[error("no new packet has completed since the last read")]
    DeviceNotReady,

    #[error("packet {packet} is behind the expected packet {expected}")]
    DataLateError { packet: u32, expected: u32 },

    #[error("packet {packet} is ahead of the expected packet {expected}")]
    DataOverrun { packet: u32, expected: u32 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("unsuccessful: {0}")]
    Unsuccessful(&'static str),

    #[error("insufficient resources for {0}")]
    InsufficientResources(&'static str),

    #[error("notification event is not registered")]
    NotFound,

    #[error("notification event is already registered")]
    DuplicateRegistration,

    #[error("pin {pin} has reached its instance limit of {max}")]
    TooManyInstances { pin: u32, max: usize },

    #[error("sideband stream failed: {0}")]
    Sideband(String),

    #[error("invalid stream format: {0}")]
    Format(#[from] FormatError),
}
