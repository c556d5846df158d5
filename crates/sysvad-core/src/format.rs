//! Negotiated audio format
//!
//! Only the fields the streaming core and the APOs look at: sample
//! encoding, channel count, sample rate and bit depth. Block alignment and
//! average bytes per second are derived.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Signed integer PCM
    Pcm,
    /// IEEE float
    Float,
}

/// Signal processing mode requested for a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingMode {
    #[default]
    Default,
    /// Bit-exact passthrough; all optional processing is off
    Raw,
    Communications,
    Speech,
    Media,
    Movie,
    Notification,
}

impl ProcessingMode {
    pub fn is_raw(self) -> bool {
        self == ProcessingMode::Raw
    }
}

/// Reasons a format description is unusable
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("channel count must be non-zero")]
    NoChannels,
    #[error("sample rate must be non-zero")]
    NoSampleRate,
    #[error("unsupported bit depth {bits} for {format:?}")]
    UnsupportedBitDepth { format: SampleFormat, bits: u16 },
    #[error("{channels} channels at {sample_rate} Hz exceed the frame or byte rate limits")]
    RateOutOfRange { channels: u16, sample_rate: u32 },
}

/// Audio format shared by both ends of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Integer PCM format
    ///
    /// # Example
    /// ```
    /// use sysvad_core::format::AudioFormat;
    ///
    /// let fmt = AudioFormat::pcm(2, 48000, 16);
    /// assert_eq!(fmt.block_align(), 4);
    /// assert_eq!(fmt.avg_bytes_per_sec(), 192000);
    /// ```
    pub const fn pcm(channels: u16, sample_rate: u32, bits_per_sample: u16) -> Self {
        Self {
            sample_format: SampleFormat::Pcm,
            channels,
            sample_rate,
            bits_per_sample,
        }
    }

    /// 32-bit float format
    pub const fn float32(channels: u16, sample_rate: u32) -> Self {
        Self {
            sample_format: SampleFormat::Float,
            channels,
            sample_rate,
            bits_per_sample: 32,
        }
    }

    /// Bytes per sample container
    pub const fn bytes_per_sample(&self) -> u32 {
        (self.bits_per_sample as u32).div_ceil(8)
    }

    /// Bytes per frame (all channels)
    pub const fn block_align(&self) -> u32 {
        self.bytes_per_sample() * self.channels as u32
    }

    /// Average bytes per second, the stream's movement rate
    ///
    /// Saturates for formats [`validate`](Self::validate) rejects.
    pub const fn avg_bytes_per_sec(&self) -> u32 {
        self.block_align().saturating_mul(self.sample_rate)
    }

    pub fn is_float32(&self) -> bool {
        self.sample_format == SampleFormat::Float && self.bits_per_sample == 32
    }

    /// Check the format is something the engine can move data for
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.channels == 0 {
            return Err(FormatError::NoChannels);
        }
        if self.sample_rate == 0 {
            return Err(FormatError::NoSampleRate);
        }
        let ok = match self.sample_format {
            SampleFormat::Pcm => matches!(self.bits_per_sample, 8 | 16 | 24 | 32),
            SampleFormat::Float => self.bits_per_sample == 32,
        };
        if !ok {
            return Err(FormatError::UnsupportedBitDepth {
                format: self.sample_format,
                bits: self.bits_per_sample,
            });
        }
        // Block align and byte rate must fit the 16/32-bit WAVE header fields
        let byte_rate = self.block_align().checked_mul(self.sample_rate);
        if self.block_align() > u16::MAX as u32 || byte_rate.is_none() {
            return Err(FormatError::RateOutOfRange {
                channels: self.channels,
                sample_rate: self.sample_rate,
            });
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm(2, 48000, 16)
    }
}
