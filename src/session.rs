//! Simulation session
//!
//! Plays the part of the audio engine against a simulated speaker endpoint:
//!
//! - a render stream on the system pin, fed packet by packet by a client
//!   thread that waits on the stream's notification event
//! - a channel-swap MFX applied to every packet before it is written
//! - a loopback capture stream whose packets the client reads back
//!
//! With `end_of_stream` set, the last packet is flagged EOS and the session
//! waits for the final-buffer notification before stopping.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysvad_core::apo::properties::PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_MFX;
use sysvad_core::apo::{
    ApoInit, AudioProcessingObject, BufferFlags, ConnectionDescriptor, ConnectionProperty,
    MemoryPropertyStore, PropVariant,
};
use sysvad_core::diagnostics::DiagnosticsSnapshot;
use sysvad_core::wavert::buffer::BufferDescriptor;
use sysvad_core::wavert::packet::STREAM_FLAG_END_OF_STREAM;
use sysvad_core::{
    AudioFormat, DriverConfig, KsState, MiniportWaveRt, NotificationEvent, StreamError, SwapApoMfx,
    WaveRtStream,
};

/// System render pin of the speaker endpoint
const RENDER_PIN: u32 = 0;
/// Loopback pin of the speaker endpoint
const LOOPBACK_PIN: u32 = 2;
/// Longest the client blocks on a notification before re-checking stop
const CLIENT_WAIT: Duration = Duration::from_millis(50);
/// Frequency of the test signal written to the render stream
const SIGNAL_FREQUENCY: f32 = 440.0;

/// Parameters of one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Render buffer length (ms)
    pub buffer_ms: u32,
    /// Notifications per buffer pass
    pub notifications: u32,
    /// How long the client keeps writing packets
    pub duration: Duration,
    /// Flag the last packet as end of stream
    pub end_of_stream: bool,
    pub driver: DriverConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            buffer_ms: 20,
            notifications: 4,
            duration: Duration::from_secs(1),
            end_of_stream: false,
            driver: DriverConfig::default(),
        }
    }
}

impl SessionConfig {
    /// 16-bit PCM stream format
    pub fn format(&self) -> AudioFormat {
        AudioFormat::pcm(self.channels, self.sample_rate, 16)
    }

    /// Requested buffer size in bytes, whole frames per notification
    pub fn buffer_size(&self) -> u32 {
        let format = self.format();
        let bytes = format.avg_bytes_per_sec() as u64 * self.buffer_ms as u64 / 1000;
        let granule = format.block_align() as u64 * self.notifications.max(1) as u64;
        (bytes - bytes % granule).max(granule) as u32
    }
}

/// Final state of one stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub pin: u32,
    pub linear_position: u64,
    pub final_state: KsState,
    pub diagnostics: DiagnosticsSnapshot,
}

/// Result of a session run
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub format: AudioFormat,
    pub buffer_size: u32,
    pub notification_interval_ms: u32,
    pub packets_written: u64,
    pub late_packets: u64,
    pub packets_read: u64,
    pub end_of_stream_delivered: bool,
    pub effect_enabled: bool,
    pub render: StreamSummary,
    pub loopback: StreamSummary,
}

#[derive(Debug, Default)]
struct ClientStats {
    packets_written: u64,
    late_packets: u64,
    packets_read: u64,
    end_of_stream_delivered: bool,
}

/// Render stream, APO and loopback stream on one speaker miniport
pub struct Session {
    config: SessionConfig,
    render: Arc<WaveRtStream>,
    loopback: Arc<WaveRtStream>,
    apo: SwapApoMfx,
}

impl Session {
    /// Create the miniport, both streams and an initialized APO
    pub fn new(config: SessionConfig) -> Result<Self> {
        let miniport = Arc::new(MiniportWaveRt::speaker(config.driver.clone()));
        let format = config.format();

        let render = WaveRtStream::builder(Arc::clone(&miniport), RENDER_PIN, format)
            .build()
            .context("Failed to create render stream")?;
        let loopback = WaveRtStream::builder(Arc::clone(&miniport), LOOPBACK_PIN, format)
            .loopback_post_volume_tap(true)
            .build()
            .context("Failed to create loopback stream")?;

        let store = Arc::new(
            MemoryPropertyStore::new().with(PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_MFX, PropVariant::U32(1)),
        );
        let mut apo = SwapApoMfx::new();
        apo.initialize(ApoInit::SystemEffects { properties: store })
            .context("Failed to initialize APO")?;

        Ok(Self {
            config,
            render: Arc::new(render),
            loopback: Arc::new(loopback),
            apo,
        })
    }

    /// Run until the configured duration elapses or `stop` is set
    pub fn run(self, stop: Arc<AtomicBool>) -> Result<SessionSummary> {
        let Session {
            config,
            render,
            loopback,
            mut apo,
        } = self;
        let started_at = Utc::now();
        let format = config.format();

        let descriptor = render
            .allocate_buffer_with_notification(config.notifications, config.buffer_size())
            .context("Failed to allocate render buffer")?;
        loopback
            .allocate_buffer_with_notification(config.notifications, config.buffer_size())
            .context("Failed to allocate loopback buffer")?;

        let frames = descriptor.packet_size() / format.block_align();
        let connection = ConnectionDescriptor::new(
            AudioFormat::float32(format.channels, format.sample_rate),
            frames,
        );
        apo.lock_for_process(&[connection], &[connection])
            .context("Failed to lock APO")?;

        let event = NotificationEvent::new();
        render.register_notification_event(&event)?;

        for stream in [&render, &loopback] {
            for state in [KsState::Acquire, KsState::Pause, KsState::Run] {
                stream
                    .set_state(state)
                    .with_context(|| format!("Failed to enter {state} on pin {}", stream.pin()))?;
            }
        }

        tracing::info!(
            buffer_size = descriptor.size,
            interval_ms = descriptor.notification_interval_ms,
            duration_ms = config.duration.as_millis() as u64,
            "Session running"
        );

        let client = {
            let render = Arc::clone(&render);
            let loopback = Arc::clone(&loopback);
            let event = event.clone();
            let stop = Arc::clone(&stop);
            let client_config = config.clone();
            std::thread::Builder::new()
                .name("sysvad-client".to_string())
                .spawn(move || {
                    let stats = client_loop(
                        &render,
                        &loopback,
                        &apo,
                        &event,
                        &stop,
                        &client_config,
                        descriptor,
                    );
                    (stats, apo.is_effect_enabled())
                })
                .context("Failed to spawn client thread")?
        };
        let (stats, effect_enabled) = client
            .join()
            .map_err(|_| anyhow!("Client thread panicked"))?;

        if let Err(e) = render.unregister_notification_event(&event) {
            tracing::warn!(error = %e, "Failed to unregister render notification event");
        }
        let render_summary = stop_stream(&render)?;
        let loopback_summary = stop_stream(&loopback)?;

        let summary = SessionSummary {
            started_at,
            finished_at: Utc::now(),
            format,
            buffer_size: descriptor.size,
            notification_interval_ms: descriptor.notification_interval_ms,
            packets_written: stats.packets_written,
            late_packets: stats.late_packets,
            packets_read: stats.packets_read,
            end_of_stream_delivered: stats.end_of_stream_delivered,
            effect_enabled,
            render: render_summary,
            loopback: loopback_summary,
        };

        tracing::info!(
            packets_written = summary.packets_written,
            packets_read = summary.packets_read,
            underruns = summary.render.diagnostics.underruns,
            "Session finished"
        );
        Ok(summary)
    }
}

/// Record the final position, then stop the stream
fn stop_stream(stream: &WaveRtStream) -> Result<StreamSummary> {
    let linear_position = stream.get_linear_buffer_position()?.position;
    stream.set_state(KsState::Stop)?;
    Ok(StreamSummary {
        pin: stream.pin(),
        linear_position,
        final_state: stream.state(),
        diagnostics: stream.diagnostics(),
    })
}

/// Convert float samples to little-endian 16-bit PCM
fn float_to_pcm16(samples: &[f32], out: &mut [u8]) {
    for (sample, bytes) in samples.iter().zip(out.chunks_exact_mut(2)) {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.copy_from_slice(&value.to_le_bytes());
    }
}

fn client_loop(
    render: &WaveRtStream,
    loopback: &WaveRtStream,
    apo: &SwapApoMfx,
    event: &NotificationEvent,
    stop: &AtomicBool,
    config: &SessionConfig,
    descriptor: BufferDescriptor,
) -> ClientStats {
    let format = render.format();
    let channels = format.channels as usize;
    let packet_size = descriptor.packet_size();
    let frames = (packet_size / format.block_align()) as usize;

    let mut scratch = vec![0.0f32; frames * channels];
    let mut pcm = vec![0u8; packet_size as usize];
    let mut capture = vec![0u8; packet_size as usize];
    let phase_step = std::f32::consts::TAU * SIGNAL_FREQUENCY / format.sample_rate as f32;
    let mut phase = 0.0f32;

    let deadline = Instant::now() + config.duration;
    let final_wait = Duration::from_millis(
        descriptor.notification_interval_ms as u64 * descriptor.notifications_per_buffer as u64 * 2 + 100,
    );
    let mut stats = ClientStats::default();

    while !stop.load(Ordering::SeqCst) {
        let finishing = Instant::now() >= deadline;
        if finishing && !config.end_of_stream {
            break;
        }

        if event.wait_timeout(CLIENT_WAIT) {
            let packet = match render.get_packet_count() {
                Ok(count) => count.wrapping_add(1),
                Err(e) => {
                    tracing::warn!(error = %e, "Packet count query failed");
                    break;
                }
            };

            // Tone on the first channel only, so the swap is visible downstream
            for frame in scratch.chunks_exact_mut(channels) {
                frame.fill(0.0);
                frame[0] = phase.sin() * 0.5;
                phase = (phase + phase_step) % std::f32::consts::TAU;
            }
            let mut connection = ConnectionProperty::new(&mut scratch, frames as u32, BufferFlags::Valid);
            apo.process(&mut connection, None);
            float_to_pcm16(&scratch, &mut pcm);

            let offset = (packet % descriptor.notifications_per_buffer) * packet_size;
            if let Err(e) = render.write_buffer(offset, &pcm) {
                tracing::warn!(error = %e, "Render buffer write failed");
                break;
            }

            let (flags, eos_length) = if finishing {
                (STREAM_FLAG_END_OF_STREAM, packet_size / 2)
            } else {
                (0, 0)
            };
            let accepted = match render.set_write_packet(packet, flags, eos_length) {
                Ok(()) => {
                    stats.packets_written += 1;
                    true
                }
                Err(StreamError::DataLateError { .. }) | Err(StreamError::DataOverrun { .. }) => {
                    stats.late_packets += 1;
                    tracing::debug!(packet, "Client missed its packet slot");
                    false
                }
                Err(e) => {
                    tracing::warn!(packet, error = %e, "Write packet rejected");
                    break;
                }
            };

            if finishing && accepted {
                let until = Instant::now() + final_wait;
                while !render.diagnostics().last_buffer_rendered && Instant::now() < until {
                    event.wait_timeout(CLIENT_WAIT);
                }
                stats.end_of_stream_delivered = render.diagnostics().last_buffer_rendered;
                break;
            }
        }

        if finishing && Instant::now() > deadline + final_wait {
            tracing::warn!("End of stream could not be queued in time");
            break;
        }

        loop {
            match loopback.get_read_packet() {
                Ok(read) => {
                    let offset = (read.packet_number % descriptor.notifications_per_buffer) * packet_size;
                    if loopback.read_buffer(offset, &mut capture).is_ok() {
                        stats.packets_read += 1;
                    }
                }
                Err(StreamError::DeviceNotReady) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Loopback read failed");
                    break;
                }
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buffer_geometry() {
        let config = SessionConfig::default();
        assert_eq!(config.buffer_size(), 3840);
        assert_eq!(config.format().block_align(), 4);
    }

    #[test]
    fn test_buffer_size_rounded_to_notifications() {
        let config = SessionConfig {
            sample_rate: 44100,
            notifications: 3,
            ..SessionConfig::default()
        };
        // 3528 bytes for 20ms, trimmed to a multiple of 4 * 3
        assert_eq!(config.buffer_size(), 3528);

        let tiny = SessionConfig {
            buffer_ms: 0,
            ..SessionConfig::default()
        };
        assert_eq!(tiny.buffer_size(), 16);
    }

    #[test]
    fn test_float_to_pcm16() {
        let mut out = [0u8; 6];
        float_to_pcm16(&[1.0, -2.0, 0.0], &mut out);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), -i16::MAX);
        assert_eq!(i16::from_le_bytes([out[4], out[5]]), 0);
    }
}
