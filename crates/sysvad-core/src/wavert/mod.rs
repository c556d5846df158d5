//! Wave-RT miniport and stream
//!
//! The stream has no hardware behind it: a periodic timer stands in for
//! the DMA interrupt, and position is computed from elapsed time and the
//! format's byte rate.

pub mod buffer;
pub mod error;
pub mod miniport;
pub mod packet;
pub mod position;
pub mod save;
pub mod sideband;
pub mod state;
pub mod stream;
pub mod timer;
pub mod tone;

pub use error::StreamError;
pub use state::KsState;
