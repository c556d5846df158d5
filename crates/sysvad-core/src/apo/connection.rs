//! Connection buffers exchanged with the audio engine

use crate::format::AudioFormat;

/// Status of a connection buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferFlags {
    /// Contents undefined; never handed to a correct pipeline
    #[default]
    Invalid,
    /// Buffer holds `valid_frame_count` frames of audio
    Valid,
    /// Buffer should be treated as silence whatever it holds
    Silent,
}

/// One processing-quantum view of a connection buffer
///
/// Samples are interleaved 32-bit float, `channels` per frame.
#[derive(Debug)]
pub struct ConnectionProperty<'a> {
    pub buffer: &'a mut [f32],
    pub valid_frame_count: u32,
    pub flags: BufferFlags,
}

impl<'a> ConnectionProperty<'a> {
    pub fn new(buffer: &'a mut [f32], valid_frame_count: u32, flags: BufferFlags) -> Self {
        Self {
            buffer,
            valid_frame_count,
            flags,
        }
    }
}

/// Connection negotiated at lock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub format: AudioFormat,
    /// Largest frame count a single process call may carry
    pub max_frame_count: u32,
}

impl ConnectionDescriptor {
    pub fn new(format: AudioFormat, max_frame_count: u32) -> Self {
        Self {
            format,
            max_frame_count,
        }
    }
}
