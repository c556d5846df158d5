//! Cyclic DMA buffer owned by a stream

use super::error::StreamError;

/// Negotiated buffer geometry, fixed from allocation until free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Buffer size in bytes
    pub size: u32,
    /// Notifications per buffer pass; 0 means polling mode
    pub notifications_per_buffer: u32,
    /// Time between notifications (ms)
    pub notification_interval_ms: u32,
}

impl BufferDescriptor {
    /// Bytes per packet, or 0 in polling mode
    pub fn packet_size(&self) -> u32 {
        if self.notifications_per_buffer == 0 {
            0
        } else {
            self.size / self.notifications_per_buffer
        }
    }

    pub fn is_event_driven(&self) -> bool {
        self.notifications_per_buffer > 0
    }
}

/// Zero-initialized cyclic byte buffer
#[derive(Debug)]
pub struct DmaBuffer {
    data: Vec<u8>,
}

impl DmaBuffer {
    /// Allocate `size` bytes, reporting failure instead of aborting
    pub fn allocate(size: u32) -> Result<Self, StreamError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size as usize)
            .map_err(|_| StreamError::InsufficientResources("DMA buffer"))?;
        data.resize(size as usize, 0);
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `src` into the buffer starting at `offset`, wrapping at the end
    ///
    /// Returns the number of bytes copied (at most one buffer's worth).
    pub fn write_wrapping(&mut self, offset: usize, src: &[u8]) -> usize {
        let len = self.data.len();
        if len == 0 {
            return 0;
        }
        let n = src.len().min(len);
        let start = offset % len;
        let first = n.min(len - start);
        self.data[start..start + first].copy_from_slice(&src[..first]);
        self.data[..n - first].copy_from_slice(&src[first..n]);
        n
    }

    /// Copy from the buffer starting at `offset` into `dst`, wrapping at the end
    pub fn read_wrapping(&self, offset: usize, dst: &mut [u8]) -> usize {
        let len = self.data.len();
        if len == 0 {
            return 0;
        }
        let n = dst.len().min(len);
        let start = offset % len;
        let first = n.min(len - start);
        dst[..first].copy_from_slice(&self.data[start..start + first]);
        dst[first..n].copy_from_slice(&self.data[..n - first]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_size() {
        let d = BufferDescriptor {
            size: 4096,
            notifications_per_buffer: 4,
            notification_interval_ms: 5,
        };
        assert_eq!(d.packet_size(), 1024);
        assert!(d.is_event_driven());

        let polling = BufferDescriptor {
            notifications_per_buffer: 0,
            ..d
        };
        assert_eq!(polling.packet_size(), 0);
    }

    #[test]
    fn test_wrapping_copy() {
        let mut buf = DmaBuffer::allocate(8).unwrap();
        assert_eq!(buf.write_wrapping(6, &[1, 2, 3, 4]), 4);
        assert_eq!(buf.as_slice(), &[3, 4, 0, 0, 0, 0, 1, 2]);

        let mut out = [0u8; 4];
        assert_eq!(buf.read_wrapping(14, &mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_copy_capped_at_buffer_size() {
        let mut buf = DmaBuffer::allocate(4).unwrap();
        assert_eq!(buf.write_wrapping(0, &[9; 10]), 4);
        assert_eq!(buf.as_slice(), &[9; 4]);
    }
}
