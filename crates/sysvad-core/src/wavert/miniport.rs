//! Wave-RT miniport: pin table, stream registry and sideband link
//!
//! Streams hold an `Arc` back to their miniport for pin queries, the
//! shared [`DriverConfig`] and the optional sideband device. The miniport
//! tracks which streams are open on each pin and enforces instance limits.

use super::error::StreamError;
use super::sideband::SidebandDevice;
use crate::config::DriverConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Role of a miniport pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PinKind {
    /// Host render (system mix)
    Render,
    /// Offloaded render
    Offload,
    /// Microphone / host capture
    Capture,
    /// Render loopback capture
    Loopback,
}

impl PinKind {
    /// Whether streams on this pin produce data into the buffer
    pub fn is_capture(self) -> bool {
        matches!(self, PinKind::Capture | PinKind::Loopback)
    }
}

/// Static description of one pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinDescriptor {
    pub kind: PinKind,
    pub max_instances: usize,
}

/// Identifier handed out by [`MiniportWaveRt::stream_created`]
pub type StreamId = u64;

/// Wave-RT miniport shared by its streams
pub struct MiniportWaveRt {
    name: String,
    config: DriverConfig,
    pins: Vec<PinDescriptor>,
    sideband: Option<Arc<dyn SidebandDevice>>,
    loopback_tap_point_supported: bool,
    streams: Mutex<Vec<(u32, StreamId)>>,
    next_stream_id: AtomicU64,
}

impl std::fmt::Debug for MiniportWaveRt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniportWaveRt")
            .field("name", &self.name)
            .field("pins", &self.pins)
            .field("sideband", &self.sideband.is_some())
            .finish()
    }
}

impl MiniportWaveRt {
    /// Create a miniport with an explicit pin table
    pub fn new(name: impl Into<String>, config: DriverConfig, pins: Vec<PinDescriptor>) -> Self {
        Self {
            name: name.into(),
            config,
            pins,
            sideband: None,
            loopback_tap_point_supported: false,
            streams: Mutex::new(Vec::new()),
            next_stream_id: AtomicU64::new(1),
        }
    }

    /// Speaker endpoint: pin 0 system render, pin 1 offload, pin 2 loopback
    pub fn speaker(config: DriverConfig) -> Self {
        Self::new(
            "speaker",
            config,
            vec![
                PinDescriptor {
                    kind: PinKind::Render,
                    max_instances: 4,
                },
                PinDescriptor {
                    kind: PinKind::Offload,
                    max_instances: 3,
                },
                PinDescriptor {
                    kind: PinKind::Loopback,
                    max_instances: 1,
                },
            ],
        )
        .with_loopback_tap_point()
    }

    /// Microphone endpoint: pin 0 host capture
    pub fn microphone(config: DriverConfig) -> Self {
        Self::new(
            "microphone",
            config,
            vec![PinDescriptor {
                kind: PinKind::Capture,
                max_instances: 1,
            }],
        )
    }

    /// Attach a sideband device
    pub fn with_sideband(mut self, device: Arc<dyn SidebandDevice>) -> Self {
        self.sideband = Some(device);
        self
    }

    /// Advertise the post-volume/mute loopback tap point
    pub fn with_loopback_tap_point(mut self) -> Self {
        self.loopback_tap_point_supported = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn pin_kind(&self, pin: u32) -> Option<PinKind> {
        self.pins.get(pin as usize).map(|p| p.kind)
    }

    pub fn sideband(&self) -> Option<&Arc<dyn SidebandDevice>> {
        self.sideband.as_ref()
    }

    pub fn is_loopback_tap_point_supported(&self) -> bool {
        self.loopback_tap_point_supported
    }

    /// Register a new stream on `pin`
    pub fn stream_created(&self, pin: u32) -> Result<StreamId, StreamError> {
        let desc = self
            .pins
            .get(pin as usize)
            .ok_or(StreamError::InvalidParameter("unknown pin"))?;
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let open = streams.iter().filter(|(p, _)| *p == pin).count();
        if open >= desc.max_instances {
            return Err(StreamError::TooManyInstances {
                pin,
                max: desc.max_instances,
            });
        }
        streams
            .try_reserve(1)
            .map_err(|_| StreamError::InsufficientResources("stream registration"))?;
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        streams.push((pin, id));
        tracing::debug!(miniport = %self.name, pin, stream = id, "Stream created");
        Ok(id)
    }

    /// Unregister a stream; unknown ids are ignored
    pub fn stream_closed(&self, pin: u32, id: StreamId) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.retain(|&(p, s)| !(p == pin && s == id));
        }
        tracing::debug!(miniport = %self.name, pin, stream = id, "Stream closed");
    }

    /// Streams currently open on `pin`
    pub fn active_streams(&self, pin: u32) -> usize {
        self.streams
            .lock()
            .map(|s| s.iter().filter(|(p, _)| *p == pin).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_pins() {
        let m = MiniportWaveRt::speaker(DriverConfig::default());
        assert_eq!(m.pin_kind(0), Some(PinKind::Render));
        assert_eq!(m.pin_kind(2), Some(PinKind::Loopback));
        assert_eq!(m.pin_kind(3), None);
        assert!(m.is_loopback_tap_point_supported());
        assert!(PinKind::Loopback.is_capture());
        assert!(!PinKind::Offload.is_capture());
    }

    #[test]
    fn test_instance_limit() {
        let m = MiniportWaveRt::microphone(DriverConfig::default());
        let id = m.stream_created(0).unwrap();
        assert_eq!(
            m.stream_created(0),
            Err(StreamError::TooManyInstances { pin: 0, max: 1 })
        );
        m.stream_closed(0, id);
        assert_eq!(m.active_streams(0), 0);
        assert!(m.stream_created(0).is_ok());
    }

    #[test]
    fn test_unknown_pin_rejected() {
        let m = MiniportWaveRt::microphone(DriverConfig::default());
        assert!(matches!(
            m.stream_created(5),
            Err(StreamError::InvalidParameter(_))
        ));
    }
}
