//! SYSVAD Core - wave-RT streaming engine and swap APO
//!
//! This library simulates the real-time half of a virtual audio adapter:
//!
//! - [`wavert`]: the wave-RT stream (simulated DMA position/timing engine,
//!   packet and notification tracker, KS state machine)
//! - [`apo`]: the channel-swap audio processing objects and their
//!   lock/format negotiation and effect-enable notifications
//! - [`diagnostics`]: bounded event history for glitches and state changes
//!
//! All timing flows through the [`clock::Clock`] trait and all periodic work
//! through [`wavert::timer::NotificationTimer`], so tests can drive time by hand.

pub mod apo;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod event;
pub mod format;
pub mod wavert;

pub use apo::{mfx::SwapApoMfx, sfx::SwapApoSfx, AudioProcessingObject};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DriverConfig;
pub use diagnostics::EventLog;
pub use event::NotificationEvent;
pub use format::{AudioFormat, ProcessingMode};
pub use wavert::{miniport::MiniportWaveRt, stream::WaveRtStream, KsState, StreamError};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Date this library was built (set by build.rs)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// 100ns units per second
pub const HNS_PER_SECOND: u64 = 10_000_000;

/// 100ns units per millisecond
pub const HNS_PER_MS: u64 = 10_000;
