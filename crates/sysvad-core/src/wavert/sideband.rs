//! Sideband (bypass) connection hooks
//!
//! Some endpoints route audio over a side channel (Bluetooth, USB) instead
//! of the DMA buffer. The stream opens, starts, suspends and closes that
//! connection as it moves through KS states.

use super::miniport::PinKind;
use thiserror::Error;

/// Failure reported by a sideband device
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SidebandError(pub String);

/// Side-channel device attached to a miniport
pub trait SidebandDevice: Send + Sync {
    /// Stop -> Acquire
    fn stream_open(&self, pin: PinKind) -> Result<(), SidebandError>;
    /// Acquire -> Stop
    fn stream_close(&self, pin: PinKind) -> Result<(), SidebandError>;
    /// Entering Run
    fn stream_start(&self, pin: PinKind) -> Result<(), SidebandError>;
    /// Run -> Pause
    fn stream_suspend(&self, pin: PinKind) -> Result<(), SidebandError>;
    /// Whether the started connection is still healthy
    fn stream_status(&self, pin: PinKind) -> bool;
}
