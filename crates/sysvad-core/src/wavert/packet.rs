//! Packet bookkeeping for event-driven streams
//!
//! A packet is one notification-sized slice of the buffer. The tracker
//! counts completed packets, remembers what the client last read and
//! wrote, and decides on each timer tick whether a notification interval
//! has elapsed.

use super::error::StreamError;
use super::position::StreamPosition;
use crate::{HNS_PER_MS, HNS_PER_SECOND};

/// `SetWritePacket` flag marking the final packet of the stream
pub const STREAM_FLAG_END_OF_STREAM: u32 = 0x200;

/// Packet returned by a read query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPacket {
    /// 0-based number of the last completed packet
    pub packet_number: u32,
    /// Always 0; no flags are defined
    pub flags: u32,
    /// Performance-counter time at which the packet completed
    pub performance_counter: u64,
    /// Always false; nothing is buffered beyond what the position reveals
    pub more_data: bool,
    /// Packets that completed without being read
    pub dropped: u32,
}

/// Packet and notification timing state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketTracker {
    /// Completed packets since Run (the current in-flight packet number)
    pub packet_counter: i64,
    pub last_os_read_packet: u32,
    pub last_os_write_packet: u32,
    /// Last write offset supplied by the client
    pub current_write_position: u32,
    /// Client supplied a write position since the last completed interval
    pub write_position_updated: bool,
    /// Time of the last tick that completed an interval (100ns)
    pub last_dpc_timestamp: u64,
    /// Time past the interval boundary carried to the next tick (100ns)
    pub dpc_carry: u64,
}

impl Default for PacketTracker {
    fn default() -> Self {
        Self {
            packet_counter: 0,
            last_os_read_packet: u32::MAX,
            last_os_write_packet: u32::MAX,
            current_write_position: 0,
            write_position_updated: false,
            last_dpc_timestamp: 0,
            dpc_carry: 0,
        }
    }
}

impl PacketTracker {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Decide whether a timer tick at `now_hns` completes an interval
    ///
    /// On completion the time beyond the interval is carried forward so
    /// the next notification stays on the original cadence.
    pub fn tick(&mut self, now_hns: u64, interval_ms: u32) -> bool {
        if interval_ms == 0 {
            return false;
        }
        let elapsed = now_hns.saturating_sub(self.last_dpc_timestamp) + self.dpc_carry;
        let interval = interval_ms as u64 * HNS_PER_MS;
        if elapsed / HNS_PER_MS >= interval_ms as u64 {
            self.dpc_carry = elapsed - interval;
            self.last_dpc_timestamp = now_hns;
            return true;
        }
        false
    }

    /// Start a new Run period at `now_hns`
    pub fn resume(&mut self, now_hns: u64) {
        self.last_dpc_timestamp = now_hns;
    }

    /// Bank the time since the last completed interval when leaving Run
    pub fn suspend(&mut self, now_hns: u64) {
        if self.last_dpc_timestamp > 0 {
            self.dpc_carry += now_hns.saturating_sub(self.last_dpc_timestamp);
        }
    }

    /// Consume the "client wrote since last check" flag
    pub fn take_write_position_updated(&mut self) -> bool {
        std::mem::take(&mut self.write_position_updated)
    }

    /// Packet number the client must write next
    ///
    /// While running the current packet is already being transferred,
    /// so the client writes the one after it.
    pub fn expected_write_packet(&self, running: bool) -> u32 {
        let current = self.packet_counter as u32;
        if running {
            current.wrapping_add(1)
        } else {
            current
        }
    }

    /// Validate a client packet number against the expected one
    ///
    /// Uses modulo-2^32 distance so the comparison survives wraparound.
    pub fn check_write_packet(&self, packet: u32, running: bool) -> Result<(), StreamError> {
        let expected = self.expected_write_packet(running);
        let delta = packet.wrapping_sub(expected) as i32;
        if delta < 0 {
            Err(StreamError::DataLateError { packet, expected })
        } else if delta > 0 {
            Err(StreamError::DataOverrun { packet, expected })
        } else {
            Ok(())
        }
    }

    /// Record a client write offset
    ///
    /// Fails if the offset lies past the buffer, or in event mode if the
    /// client repeats its previous non-zero offset.
    pub fn set_current_write_position(
        &mut self,
        position: u32,
        buffer_size: u32,
        event_mode: bool,
    ) -> Result<(), StreamError> {
        if position > buffer_size {
            return Err(StreamError::InvalidParameter("write position beyond buffer"));
        }
        if event_mode && position != 0 && position == self.current_write_position {
            return Err(StreamError::InvalidParameter("repeated write position"));
        }
        self.current_write_position = position;
        self.write_position_updated = true;
        Ok(())
    }
}

/// Compute the completion time of the last finished packet
///
/// Extrapolates backwards from the simulated `(linear, dma_timestamp)`
/// correlation: the bytes between the packet's end and the current
/// position, plus the bytes hidden in the elapsed-time carry, are turned
/// back into time at the movement rate.
///
/// # Arguments
/// * `position` - Snapshot of the stream position
/// * `packet_counter` - Completed packets
/// * `packet_size` - Bytes per packet
/// * `movement_rate` - Average bytes per second
/// * `frequency` - Performance-counter frequency for the result
pub fn packet_completion_time(
    position: &StreamPosition,
    packet_counter: i64,
    packet_size: u32,
    movement_rate: u32,
    frequency: u64,
) -> u64 {
    if movement_rate == 0 {
        return 0;
    }
    let hns = HNS_PER_SECOND as i128;
    let rate = movement_rate as i128;
    let packet_linear = packet_counter as i128 * packet_size as i128;
    let carry_bytes = position.elapsed_carry as i128 * rate / hns;
    let delta_bytes = position.linear as i128 + carry_bytes - packet_linear;
    let delta_hns = delta_bytes * hns / rate;
    let packet_hns = (position.dma_timestamp as i128 - delta_hns).max(0);
    (packet_hns * frequency as i128 / hns) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = PacketTracker::default();
        assert_eq!(t.last_os_read_packet, u32::MAX);
        assert_eq!(t.last_os_write_packet, u32::MAX);
        assert_eq!(t.packet_counter, 0);
    }

    #[test]
    fn test_tick_waits_for_interval() {
        let mut t = PacketTracker::default();
        t.resume(1_000_000);
        for ms in 1..5u64 {
            assert!(!t.tick(1_000_000 + ms * HNS_PER_MS, 5), "tick at {ms}ms");
        }
        assert!(t.tick(1_000_000 + 53_300, 5));
        assert_eq!(t.dpc_carry, 3_300);
        assert_eq!(t.last_dpc_timestamp, 1_053_300);
    }

    #[test]
    fn test_tick_carry_keeps_cadence() {
        let mut t = PacketTracker::default();
        t.resume(10);
        let mut completions = 0;
        // 1ms ticks, each 1.1ms late, over 1 second
        let mut now = 10;
        for _ in 0..1000 {
            now += 11_000;
            if t.tick(now, 10) {
                completions += 1;
            }
        }
        // 1.1s elapsed at 10ms intervals
        assert!((109..=110).contains(&completions), "got {completions}");
    }

    #[test]
    fn test_suspend_resume_preserves_partial_interval() {
        let mut t = PacketTracker::default();
        t.resume(HNS_PER_SECOND);
        t.suspend(HNS_PER_SECOND + 3 * HNS_PER_MS);
        assert_eq!(t.dpc_carry, 3 * HNS_PER_MS);
        // Paused for a long time, then resumed
        t.resume(5 * HNS_PER_SECOND);
        assert!(!t.tick(5 * HNS_PER_SECOND + HNS_PER_MS, 5));
        assert!(t.tick(5 * HNS_PER_SECOND + 2 * HNS_PER_MS, 5));
    }

    #[test]
    fn test_zero_interval_never_completes() {
        let mut t = PacketTracker::default();
        assert!(!t.tick(u64::MAX / 2, 0));
    }

    #[test]
    fn test_write_packet_sequencing() {
        let mut t = PacketTracker::default();
        t.packet_counter = 7;
        assert!(t.check_write_packet(7, false).is_ok());
        assert!(t.check_write_packet(8, true).is_ok());
        assert_eq!(
            t.check_write_packet(6, false),
            Err(StreamError::DataLateError { packet: 6, expected: 7 })
        );
        assert_eq!(
            t.check_write_packet(9, true),
            Err(StreamError::DataOverrun { packet: 9, expected: 8 })
        );
    }

    #[test]
    fn test_write_packet_wraparound() {
        let mut t = PacketTracker::default();
        t.packet_counter = u32::MAX as i64;
        assert!(t.check_write_packet(0, true).is_ok(), "expected packet wraps to 0");
        assert!(matches!(
            t.check_write_packet(u32::MAX - 1, true),
            Err(StreamError::DataLateError { .. })
        ));
    }

    #[test]
    fn test_set_current_write_position() {
        let mut t = PacketTracker::default();
        assert!(t.set_current_write_position(1024, 4096, true).is_ok());
        assert!(t.take_write_position_updated());
        assert!(!t.take_write_position_updated());
        assert!(t.set_current_write_position(1024, 4096, true).is_err());
        assert!(t.set_current_write_position(1024, 4096, false).is_ok());
        assert!(t.set_current_write_position(4097, 4096, false).is_err());
        assert!(t.set_current_write_position(0, 4096, true).is_ok());
        assert!(t.set_current_write_position(0, 4096, true).is_ok());
    }

    #[test]
    fn test_completion_time_on_boundary() {
        // Exactly two packets moved, no carry: packet time is the DMA time
        let pos = StreamPosition {
            linear: 2048,
            dma_timestamp: 10 * HNS_PER_SECOND,
            ..Default::default()
        };
        let t = packet_completion_time(&pos, 2, 1024, 192_000, HNS_PER_SECOND);
        assert_eq!(t, 10 * HNS_PER_SECOND);
    }

    #[test]
    fn test_completion_time_extrapolates_back() {
        // 192 bytes past the packet end at 192000 B/s is 1ms
        let pos = StreamPosition {
            linear: 1024 + 192,
            dma_timestamp: 10 * HNS_PER_SECOND,
            ..Default::default()
        };
        let t = packet_completion_time(&pos, 1, 1024, 192_000, 1_000_000);
        assert_eq!(t, 10 * 1_000_000 - 1_000);
    }

    #[test]
    fn test_completion_time_slightly_ahead() {
        // Truncated position trails the packet end: time lands after the DMA time
        let pos = StreamPosition {
            linear: 960,
            elapsed_carry: 3_300,
            dma_timestamp: 2 * HNS_PER_SECOND,
            ..Default::default()
        };
        let t = packet_completion_time(&pos, 1, 1024, 192_000, HNS_PER_SECOND);
        assert!(t > 2 * HNS_PER_SECOND);
        assert!(t < 2 * HNS_PER_SECOND + HNS_PER_MS);
    }
}
