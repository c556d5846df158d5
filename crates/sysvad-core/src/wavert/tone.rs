//! Sine tone source for capture pins
//!
//! Fills the capture buffer with a sine wave in the stream's own sample
//! encoding. Byte ranges may end mid-frame; the partially emitted frame is
//! kept and resumed on the next call so the waveform stays continuous.

use crate::config::{DriverConfig, POST_VOLUME_LOOPBACK_TONE_FREQUENCY};
use crate::format::{AudioFormat, FormatError, SampleFormat};
use std::f64::consts::TAU;

/// Producer of capture data, called from the position engine
pub trait CaptureSource: Send {
    /// Fill `out` with the next bytes of the stream
    fn generate(&mut self, out: &mut [u8]);
}

/// Sine wave generator
///
/// # Example
/// ```
/// use sysvad_core::format::AudioFormat;
/// use sysvad_core::wavert::tone::{CaptureSource, ToneGenerator};
///
/// let mut tone = ToneGenerator::new(1000, 0.5, 0.0, 0.0, AudioFormat::pcm(2, 48000, 16)).unwrap();
/// let mut buf = [0u8; 64];
/// tone.generate(&mut buf);
/// ```
#[derive(Debug)]
pub struct ToneGenerator {
    format: AudioFormat,
    frequency: u32,
    amplitude: f64,
    dc_offset: f64,
    phase: f64,
    phase_step: f64,
    /// Bytes of the current frame
    frame: Vec<u8>,
    /// Next byte of `frame` to emit; 0 means a new frame is due
    frame_pos: usize,
}

impl ToneGenerator {
    /// Create a generator
    ///
    /// # Arguments
    /// * `frequency` - Tone frequency in Hz
    /// * `amplitude` - Peak amplitude as a fraction of full scale
    /// * `dc_offset` - DC offset as a fraction of full scale
    /// * `initial_phase` - Starting phase in radians
    /// * `format` - Output sample encoding
    pub fn new(
        frequency: u32,
        amplitude: f64,
        dc_offset: f64,
        initial_phase: f64,
        format: AudioFormat,
    ) -> Result<Self, FormatError> {
        format.validate()?;
        Ok(Self {
            format,
            frequency,
            amplitude,
            dc_offset,
            phase: initial_phase,
            phase_step: TAU * frequency as f64 / format.sample_rate as f64,
            frame: vec![0; format.block_align() as usize],
            frame_pos: 0,
        })
    }

    /// Generator for a host capture pin, 1 kHz in raw mode and 2 kHz otherwise
    pub fn for_host_pin(
        config: &DriverConfig,
        raw_mode: bool,
        format: AudioFormat,
    ) -> Result<Self, FormatError> {
        let (amp, dc, phase) = config.host_capture_tone.normalized();
        Self::new(config.host_tone_frequency(raw_mode), amp, dc, phase, format)
    }

    /// Generator for a loopback pin
    ///
    /// The post-volume/mute tap point uses its own frequency so tests can
    /// tell the two loopback taps apart.
    pub fn for_loopback_pin(
        config: &DriverConfig,
        post_volume_tap: bool,
        format: AudioFormat,
    ) -> Result<Self, FormatError> {
        let frequency = if post_volume_tap {
            POST_VOLUME_LOOPBACK_TONE_FREQUENCY
        } else {
            config.loopback_capture_tone_frequency
        };
        let (amp, dc, phase) = config.loopback_capture_tone.normalized();
        Self::new(frequency, amp, dc, phase, format)
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    fn render_frame(&mut self) {
        let value = (self.amplitude * self.phase.sin() + self.dc_offset).clamp(-1.0, 1.0);
        self.phase += self.phase_step;
        if self.phase >= TAU {
            self.phase -= TAU;
        }

        let width = self.format.bytes_per_sample() as usize;
        let mut sample = [0u8; 4];
        match (self.format.sample_format, self.format.bits_per_sample) {
            (SampleFormat::Float, _) => {
                sample = (value as f32).to_le_bytes();
            }
            (SampleFormat::Pcm, 8) => {
                sample[0] = (value * 127.0 + 128.0).round() as u8;
            }
            (SampleFormat::Pcm, 16) => {
                sample[..2].copy_from_slice(&((value * i16::MAX as f64) as i16).to_le_bytes());
            }
            (SampleFormat::Pcm, 24) => {
                let v = (value * 8_388_607.0) as i32;
                sample[..3].copy_from_slice(&v.to_le_bytes()[..3]);
            }
            (SampleFormat::Pcm, _) => {
                sample = ((value * i32::MAX as f64) as i32).to_le_bytes();
            }
        }
        for chunk in self.frame.chunks_exact_mut(width) {
            chunk.copy_from_slice(&sample[..width]);
        }
    }
}

impl CaptureSource for ToneGenerator {
    fn generate(&mut self, mut out: &mut [u8]) {
        let frame_len = self.frame.len();
        if frame_len == 0 {
            return;
        }
        while !out.is_empty() {
            if self.frame_pos == 0 {
                self.render_frame();
            }
            let n = out.len().min(frame_len - self.frame_pos);
            out[..n].copy_from_slice(&self.frame[self.frame_pos..self.frame_pos + n]);
            self.frame_pos = (self.frame_pos + n) % frame_len;
            out = &mut out[n..];
        }
    }
}
