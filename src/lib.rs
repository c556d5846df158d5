//! SYSVAD - virtual audio device simulator
//!
//! This library re-exports the wave-RT streaming core and the swap APOs
//! from `sysvad-core`, and adds [`session::Session`], which wires a render
//! stream, an APO and a loopback capture stream into one running pipeline.

pub mod session;

pub use sysvad_core::apo;
pub use sysvad_core::clock;
pub use sysvad_core::config;
pub use sysvad_core::diagnostics;
pub use sysvad_core::event;
pub use sysvad_core::format;
pub use sysvad_core::wavert;

pub use sysvad_core::{
    AudioFormat, AudioProcessingObject, DriverConfig, KsState, ManualClock, MiniportWaveRt,
    NotificationEvent, ProcessingMode, StreamError, SwapApoMfx, SwapApoSfx, SystemClock, WaveRtStream,
};
pub use sysvad_core::{BUILD_DATE, VERSION};
