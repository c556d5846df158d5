//! Simulated DMA position engine
//!
//! Converts elapsed time into byte displacement with two fixed-point
//! carry-forwards:
//!
//! - elapsed 100ns time is divided down to whole milliseconds, the
//!   remainder carried to the next update
//! - bytes are computed per millisecond from the movement rate, the
//!   sub-byte remainder carried likewise
//!
//! Summing `elapsed_ms * 10000 + elapsed_carry` over any sequence of
//! updates recovers the exact elapsed time, so position never drifts.

use crate::HNS_PER_MS;

/// Position record shared by the timer path and position queries
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamPosition {
    /// Bytes moved since the stream started; never wraps
    pub linear: u64,
    /// Play offset within the buffer
    pub play: u64,
    /// Write offset within the buffer
    pub write: u64,
    /// Bytes presented, keeps counting after the last buffer is rendered
    pub presentation: u64,
    /// Time of the last position computation (100ns)
    pub dma_timestamp: u64,
    /// Sub-millisecond remainder (100ns)
    pub elapsed_carry: u64,
    /// Sub-byte remainder (bytes * 1000)
    pub byte_carry: u64,
}

/// End-of-stream marker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndOfStream {
    /// EOS packet has been received
    pub received: bool,
    /// Byte offset in the buffer where data ends, `0..=buffer_size`
    pub target: u32,
    /// The cursor reached `target`
    pub last_buffer_rendered: bool,
}

impl EndOfStream {
    /// Bytes the cursor may still move before reaching the target
    ///
    /// Measured forward from `write` in buffer order, so a target behind
    /// the cursor is reached after wrapping.
    pub fn remaining(&self, write: u64, buffer_size: u32) -> u64 {
        if self.last_buffer_rendered {
            return 0;
        }
        let size = buffer_size as u64;
        let target = (self.target as u64).min(size);
        if target >= write {
            target - write
        } else {
            size - write + target
        }
    }
}

/// Result of one position update
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Displacement {
    /// Whole milliseconds consumed from the elapsed time
    pub elapsed_ms: u64,
    /// Bytes the cursor moved
    pub bytes: u64,
    /// Buffer offset the moved range starts at
    pub start_offset: u64,
    /// This update reached the end-of-stream target
    pub reached_end_of_stream: bool,
}

impl StreamPosition {
    /// Advance the simulated cursor to `now_hns`
    ///
    /// # Arguments
    /// * `now_hns` - Current time in 100ns units
    /// * `movement_rate` - Average bytes per second of the stream format
    /// * `buffer_size` - DMA buffer size in bytes (0 = no buffer)
    /// * `eos` - End-of-stream marker; clamps movement while received
    ///
    /// Runs in constant time; the caller transfers data for the returned
    /// range with [`WrapChunks`].
    ///
    /// # Example
    /// ```
    /// use sysvad_core::wavert::position::{EndOfStream, StreamPosition};
    ///
    /// let mut pos = StreamPosition { dma_timestamp: 1_000, ..Default::default() };
    /// let mut eos = EndOfStream::default();
    /// let d = pos.advance(1_000 + 53_300, 192_000, 4096, &mut eos);
    /// assert_eq!(d.bytes, 960);
    /// assert_eq!(pos.elapsed_carry, 3_300);
    /// ```
    pub fn advance(
        &mut self,
        now_hns: u64,
        movement_rate: u32,
        buffer_size: u32,
        eos: &mut EndOfStream,
    ) -> Displacement {
        let elapsed = now_hns
            .saturating_sub(self.dma_timestamp)
            .saturating_add(self.elapsed_carry);
        let elapsed_ms = elapsed / HNS_PER_MS;
        self.elapsed_carry = elapsed % HNS_PER_MS;

        // Widened so any elapsed time reaches the end-of-stream clamp
        let scaled = movement_rate as u128 * elapsed_ms as u128 + self.byte_carry as u128;
        let mut bytes = u64::try_from(scaled / 1000).unwrap_or(u64::MAX);
        self.byte_carry = (scaled % 1000) as u64;

        self.presentation = self.presentation.saturating_add(bytes);
        self.dma_timestamp = now_hns;

        if buffer_size == 0 {
            return Displacement {
                elapsed_ms,
                ..Default::default()
            };
        }

        let mut reached_end_of_stream = false;
        if eos.received {
            let remaining = eos.remaining(self.write, buffer_size);
            bytes = bytes.min(remaining);
            if !eos.last_buffer_rendered && bytes == remaining {
                eos.last_buffer_rendered = true;
                reached_end_of_stream = true;
            }
        }

        let size = buffer_size as u64;
        let start_offset = self.linear % size;
        self.write = (self.write + bytes % size) % size;
        self.play = self.write;
        self.linear = self.linear.saturating_add(bytes);

        Displacement {
            elapsed_ms,
            bytes,
            start_offset,
            reached_end_of_stream,
        }
    }

    /// Zero every field
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Iterator over `(offset, len)` runs of a byte range in a cyclic buffer
///
/// Yields one run per wrap, so a range of `n` bytes produces at most
/// `n / buffer_size + 2` runs.
#[derive(Debug, Clone)]
pub struct WrapChunks {
    offset: usize,
    remaining: u64,
    buffer_size: usize,
}

impl WrapChunks {
    pub fn new(start_offset: u64, bytes: u64, buffer_size: u32) -> Self {
        let buffer_size = buffer_size as usize;
        Self {
            offset: if buffer_size == 0 {
                0
            } else {
                (start_offset % buffer_size as u64) as usize
            },
            remaining: if buffer_size == 0 { 0 } else { bytes },
            buffer_size,
        }
    }
}

impl Iterator for WrapChunks {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let run = (self.buffer_size - self.offset).min(self.remaining as usize);
        let item = (self.offset, run);
        self.offset = (self.offset + run) % self.buffer_size;
        self.remaining -= run as u64;
        Some(item)
    }
}
