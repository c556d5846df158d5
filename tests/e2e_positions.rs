//! E2E tests for the simulated DMA position engine
//!
//! Drives a render stream with a hand-advanced clock and checks the
//! position queries against the byte math of the stream format.

use std::sync::Arc;
use sysvad::format::AudioFormat;
use sysvad::wavert::timer::ManualTimer;
use sysvad::{DriverConfig, KsState, ManualClock, MiniportWaveRt, StreamError, WaveRtStream};

/// Clock value when the stream enters Run (100ns ticks)
const BASE_TICKS: u64 = 1_000;

fn render_stream(format: AudioFormat) -> (WaveRtStream, ManualClock) {
    let config = DriverConfig {
        do_not_create_data_files: true,
        ..DriverConfig::default()
    };
    let miniport = Arc::new(MiniportWaveRt::speaker(config));
    let clock = ManualClock::new(10_000_000);
    clock.set_ticks(BASE_TICKS);
    let stream = WaveRtStream::builder(miniport, 0, format)
        .clock(Arc::new(clock.clone()))
        .timer(Box::new(ManualTimer::new()))
        .build()
        .unwrap();
    (stream, clock)
}

fn run(stream: &WaveRtStream) {
    for state in [KsState::Acquire, KsState::Pause, KsState::Run] {
        stream.set_state(state).unwrap();
    }
}

/// Test position follows elapsed time and wraps at the buffer end
#[test]
fn test_position_advances_and_wraps() {
    let (stream, clock) = render_stream(AudioFormat::pcm(2, 48000, 16));
    stream.allocate_buffer_with_notification(4, 4096).unwrap();
    run(&stream);

    clock.advance_ms(10);
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 1920);
    let pos = stream.get_position().unwrap();
    assert_eq!(pos.play_offset, 1920);
    assert_eq!(pos.write_offset, 1920);

    clock.advance_ms(12);
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 4224);
    assert_eq!(
        stream.get_position().unwrap().play_offset,
        128,
        "Play offset should wrap at the 4096-byte buffer end"
    );
}

/// Test sub-millisecond time is carried, not lost
#[test]
fn test_sub_millisecond_time_carried() {
    let (stream, clock) = render_stream(AudioFormat::pcm(2, 48000, 16));
    stream.allocate_buffer_with_notification(4, 4096).unwrap();
    run(&stream);

    clock.advance_hns(5_500);
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 0);
    clock.advance_hns(5_500);
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 192);
}

/// Test fractional bytes per millisecond do not drift
#[test]
fn test_fractional_byte_rate_exact() {
    // 176.4 bytes per millisecond
    let (stream, clock) = render_stream(AudioFormat::pcm(2, 44100, 16));
    stream.allocate_audio_buffer(17640).unwrap();
    run(&stream);

    for _ in 0..10 {
        clock.advance_ms(1);
        stream.get_linear_buffer_position().unwrap();
    }
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 1764);
}

/// Test the reported performance counter is the query time
#[test]
fn test_performance_counter_reported() {
    let (stream, clock) = render_stream(AudioFormat::pcm(2, 48000, 16));
    stream.allocate_buffer_with_notification(4, 4096).unwrap();
    run(&stream);

    clock.advance_ms(3);
    let linear = stream.get_linear_buffer_position().unwrap();
    assert_eq!(linear.performance_counter, BASE_TICKS + 30_000);
}

/// Test Pause freezes the position and Run resumes from it
#[test]
fn test_pause_freezes_position() {
    let (stream, clock) = render_stream(AudioFormat::pcm(2, 48000, 16));
    stream.allocate_buffer_with_notification(4, 4096).unwrap();
    run(&stream);

    clock.advance_ms(3);
    stream.set_state(KsState::Pause).unwrap();
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 576);

    clock.advance_ms(10);
    assert_eq!(
        stream.get_linear_buffer_position().unwrap().position,
        576,
        "Position must not move while paused"
    );

    stream.set_state(KsState::Run).unwrap();
    clock.advance_ms(1);
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 768);
}

/// Test presentation position is reported in frames for event-driven streams
#[test]
fn test_presentation_position_in_frames() {
    let (stream, clock) = render_stream(AudioFormat::pcm(2, 48000, 16));
    stream.allocate_buffer_with_notification(4, 4096).unwrap();
    run(&stream);

    clock.advance_ms(10);
    let presentation = stream.get_presentation_position().unwrap();
    assert_eq!(presentation.position_in_blocks, 480);
    assert_eq!(presentation.performance_counter, BASE_TICKS + 100_000);
}

/// Test polling-mode streams move but have no presentation position
#[test]
fn test_polling_mode_position() {
    let (stream, clock) = render_stream(AudioFormat::pcm(2, 48000, 16));
    let descriptor = stream.allocate_audio_buffer(4098).unwrap();
    assert_eq!(descriptor.size, 4096);
    assert!(!descriptor.is_event_driven());
    run(&stream);

    clock.advance_ms(5);
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 960);
    assert_eq!(
        stream.get_presentation_position(),
        Err(StreamError::NotSupported)
    );
}

/// Test Stop rewinds every position to zero
#[test]
fn test_stop_rewinds_position() {
    let (stream, clock) = render_stream(AudioFormat::pcm(2, 48000, 16));
    stream.allocate_buffer_with_notification(4, 4096).unwrap();
    run(&stream);

    clock.advance_ms(7);
    assert!(stream.get_linear_buffer_position().unwrap().position > 0);
    stream.set_state(KsState::Stop).unwrap();

    let pos = stream.get_position().unwrap();
    assert_eq!((pos.play_offset, pos.write_offset), (0, 0));
    assert_eq!(stream.get_linear_buffer_position().unwrap().position, 0);
}
