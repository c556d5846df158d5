//! Wave-RT stream: simulated DMA engine for one pin instance
//!
//! Provides:
//! - Buffer allocation in polling or event-driven (notification) mode
//! - Position queries (`get_position`, linear and presentation positions)
//! - Packet queries for event-driven clients (`get_read_packet`,
//!   `set_write_packet`, `get_packet_count`)
//! - KS state transitions that arm and cancel the notification timer
//!
//! ## Locking
//!
//! Everything the timer callback touches lives in one `Mutex<StreamInner>`:
//! position, packet bookkeeping, EOS marker, notification list and the
//! buffer itself. The callback holds that lock for its whole run. State
//! transitions serialize on a separate control lock and never hold the
//! position lock while cancelling the timer, because cancel waits for the
//! callback to finish.

use super::buffer::{BufferDescriptor, DmaBuffer};
use super::error::StreamError;
use super::miniport::{MiniportWaveRt, PinKind, StreamId};
use super::packet::{packet_completion_time, PacketTracker, ReadPacket, STREAM_FLAG_END_OF_STREAM};
use super::position::{Displacement, EndOfStream, StreamPosition, WrapChunks};
use super::save::{RenderSink, SaveData, WorkItems};
use super::state::KsState;
use super::timer::{NotificationTimer, ThreadTimer, TimerAction, TimerCallback};
use super::tone::{CaptureSource, ToneGenerator};
use crate::clock::{Clock, SystemClock};
use crate::diagnostics::{DiagnosticsSnapshot, EventLog, MiniportEvent, MiniportEventKind};
use crate::event::NotificationEvent;
use crate::format::{AudioFormat, ProcessingMode};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Longest a Stop waits for pending render data to reach disk
const WORK_ITEM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Play and write offsets within the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPosition {
    pub play_offset: u64,
    pub write_offset: u64,
}

/// Presentation position of a render stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationPosition {
    /// Frames presented since the stream started
    pub position_in_blocks: u64,
    /// Performance counter when the position was sampled
    pub performance_counter: u64,
}

/// Linear byte position with its sampling time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearPosition {
    pub position: u64,
    pub performance_counter: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct StreamInner {
    state: KsState,
    position: StreamPosition,
    eos: EndOfStream,
    packets: PacketTracker,
    descriptor: Option<BufferDescriptor>,
    buffer: Option<DmaBuffer>,
    notifications: Vec<NotificationEvent>,
    capture_source: Option<Box<dyn CaptureSource>>,
    render_sink: Option<Box<dyn RenderSink>>,
    events: EventLog,
    sideband_open: bool,
    sideband_started: bool,
    content_id: u32,
}

impl StreamInner {
    fn buffer_size(&self) -> u32 {
        self.descriptor.map(|d| d.size).unwrap_or(0)
    }

    fn event_descriptor(&self) -> Result<BufferDescriptor, StreamError> {
        self.descriptor
            .filter(BufferDescriptor::is_event_driven)
            .ok_or(StreamError::NotSupported)
    }

    fn record(&mut self, kind: MiniportEventKind) {
        let linear = self.position.linear;
        let write = self.packets.current_write_position as u64;
        self.events.record(kind, linear, write);
    }

    /// Advance the cursor and move data for the displaced range
    fn update_position(&mut self, now_hns: u64, movement_rate: u32, capture: bool) -> Displacement {
        let size = self.buffer_size();
        let d = self
            .position
            .advance(now_hns, movement_rate, size, &mut self.eos);

        if d.bytes > 0 {
            if let Some(buffer) = self.buffer.as_mut() {
                let data = buffer.as_mut_slice();
                if capture {
                    if let Some(source) = self.capture_source.as_mut() {
                        for (offset, len) in WrapChunks::new(d.start_offset, d.bytes, size) {
                            source.generate(&mut data[offset..offset + len]);
                        }
                    }
                } else if let Some(sink) = self.render_sink.as_mut() {
                    for (offset, len) in WrapChunks::new(d.start_offset, d.bytes, size) {
                        sink.write(&data[offset..offset + len]);
                    }
                }
            }
        }

        if d.reached_end_of_stream {
            self.record(MiniportEventKind::LastBufferRendered);
            tracing::debug!(
                linear = self.position.linear,
                eos_position = self.eos.target,
                "Last buffer rendered"
            );
        }
        d
    }

    fn reset(&mut self) {
        self.position.reset();
        self.packets.reset();
        self.eos = EndOfStream::default();
    }
}

struct StreamShared {
    pin: u32,
    kind: PinKind,
    format: AudioFormat,
    movement_rate: u32,
    clock: Arc<dyn Clock>,
    miniport: Arc<MiniportWaveRt>,
    inner: Mutex<StreamInner>,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        lock(&self.inner)
    }

    fn sideband_healthy(&self) -> bool {
        self.miniport
            .sideband()
            .map(|s| s.stream_status(self.kind))
            .unwrap_or(true)
    }

    /// Lock, update the position if running, and hand the state to `f`
    fn with_current_position<T>(
        &self,
        f: impl FnOnce(&mut StreamInner, u64) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        let mut inner = self.lock();
        let qpc = self.clock.query_performance_counter();
        if inner.state == KsState::Run {
            let now = crate::clock::ks_convert_performance_time(self.clock.frequency(), qpc);
            inner.update_position(now, self.movement_rate, self.kind.is_capture());
        }
        f(&mut *inner, qpc)
    }

    /// Timer expiry: emulates the DMA interrupt
    fn on_timer_tick(&self) -> TimerAction {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = self.clock.now_hns();

        let Some(descriptor) = inner.descriptor else {
            return TimerAction::Continue;
        };
        let completed = inner
            .packets
            .tick(now, descriptor.notification_interval_ms);
        if !completed && !inner.eos.received {
            return TimerAction::Continue;
        }

        inner.update_position(now, self.movement_rate, self.kind.is_capture());
        if !inner.eos.received {
            inner.packets.packet_counter += 1;
        }

        if inner.sideband_started && !self.sideband_healthy() {
            return TimerAction::Continue;
        }
        if inner.state != KsState::Run {
            return TimerAction::Continue;
        }

        let wrote = inner.packets.take_write_position_updated();
        if !self.kind.is_capture() && !wrote && !inner.eos.received {
            inner.record(MiniportEventKind::GlitchReport { underrun: true });
            tracing::trace!(
                pin = self.pin,
                linear = inner.position.linear,
                "Render buffer underrun"
            );
        }

        if completed || inner.eos.last_buffer_rendered {
            if completed {
                inner.record(MiniportEventKind::BufferComplete);
            }
            for event in &inner.notifications {
                event.signal();
            }
        }

        if inner.eos.last_buffer_rendered {
            tracing::debug!(pin = self.pin, "Final buffer delivered, cancelling notification timer");
            return TimerAction::Cancel;
        }
        TimerAction::Continue
    }
}

/// Builder for [`WaveRtStream`]
///
/// Collaborators default to the real implementations: [`SystemClock`],
/// [`ThreadTimer`], a [`ToneGenerator`] on capture pins and a
/// [`SaveData`] sink on render pins (unless data files are disabled).
pub struct WaveRtStreamBuilder {
    miniport: Arc<MiniportWaveRt>,
    pin: u32,
    format: AudioFormat,
    processing_mode: ProcessingMode,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Box<dyn NotificationTimer>>,
    capture_source: Option<Box<dyn CaptureSource>>,
    render_sink: Option<Box<dyn RenderSink>>,
    loopback_post_volume_tap: bool,
}

impl WaveRtStreamBuilder {
    pub fn processing_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing_mode = mode;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn timer(mut self, timer: Box<dyn NotificationTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Replace the default tone generator (capture pins only)
    pub fn capture_source(mut self, source: Box<dyn CaptureSource>) -> Self {
        self.capture_source = Some(source);
        self
    }

    /// Replace the default WAV sink (render pins only); used even when
    /// data files are disabled in the config
    pub fn render_sink(mut self, sink: Box<dyn RenderSink>) -> Self {
        self.render_sink = Some(sink);
        self
    }

    /// Request the post-volume/mute loopback tap point
    pub fn loopback_post_volume_tap(mut self, enabled: bool) -> Self {
        self.loopback_post_volume_tap = enabled;
        self
    }

    /// Create the stream and register it with the miniport
    pub fn build(self) -> Result<WaveRtStream, StreamError> {
        self.format.validate()?;
        let kind = self
            .miniport
            .pin_kind(self.pin)
            .ok_or(StreamError::InvalidParameter("unknown pin"))?;
        let config = self.miniport.config();

        let capture_source: Option<Box<dyn CaptureSource>> = if kind.is_capture() {
            match self.capture_source {
                Some(source) => Some(source),
                None => {
                    let tone = if kind == PinKind::Loopback {
                        let post_volume = self.loopback_post_volume_tap
                            && self.miniport.is_loopback_tap_point_supported();
                        ToneGenerator::for_loopback_pin(config, post_volume, self.format)?
                    } else {
                        ToneGenerator::for_host_pin(
                            config,
                            self.processing_mode.is_raw(),
                            self.format,
                        )?
                    };
                    Some(Box::new(tone))
                }
            }
        } else {
            None
        };

        let timer: Box<dyn NotificationTimer> = match self.timer {
            Some(timer) => timer,
            None => Box::new(
                ThreadTimer::new(&format!("wavert-timer-{}-{}", self.miniport.name(), self.pin))
                    .map_err(|_| StreamError::InsufficientResources("notification timer"))?,
            ),
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);

        let stream_id = self.miniport.stream_created(self.pin)?;

        let render_sink: Option<Box<dyn RenderSink>> = if kind.is_capture() {
            None
        } else {
            match self.render_sink {
                Some(sink) => Some(sink),
                None if !config.do_not_create_data_files => Some(Box::new(SaveData::new(
                    config.data_file_dir.clone(),
                    format!("sysvad_{}_pin{}_s{}", self.miniport.name(), self.pin, stream_id),
                    self.format,
                ))),
                None => None,
            }
        };
        let work_items = render_sink.as_ref().map(|s| s.work_items());

        let movement_rate = self.format.avg_bytes_per_sec();
        let timer_period = Duration::from_millis(config.timer_period_ms.max(1) as u64);

        tracing::info!(
            miniport = %self.miniport.name(),
            pin = self.pin,
            kind = ?kind,
            mode = ?self.processing_mode,
            movement_rate,
            "Wave-RT stream created"
        );

        let inner = StreamInner {
            state: KsState::Stop,
            position: StreamPosition::default(),
            eos: EndOfStream::default(),
            packets: PacketTracker::default(),
            descriptor: None,
            buffer: None,
            notifications: Vec::new(),
            capture_source,
            render_sink,
            events: EventLog::new(config.event_log_capacity),
            sideband_open: false,
            sideband_started: false,
            content_id: 0,
        };

        Ok(WaveRtStream {
            shared: Arc::new(StreamShared {
                pin: self.pin,
                kind,
                format: self.format,
                movement_rate,
                clock,
                miniport: self.miniport,
                inner: Mutex::new(inner),
            }),
            timer,
            control: Mutex::new(()),
            stream_id,
            work_items,
            processing_mode: self.processing_mode,
            timer_period,
        })
    }
}

/// One open stream on a wave-RT pin
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use sysvad_core::{DriverConfig, KsState, MiniportWaveRt, WaveRtStream};
/// use sysvad_core::clock::ManualClock;
/// use sysvad_core::format::AudioFormat;
/// use sysvad_core::wavert::timer::ManualTimer;
///
/// let config = DriverConfig { do_not_create_data_files: true, ..Default::default() };
/// let miniport = Arc::new(MiniportWaveRt::speaker(config));
/// let stream = WaveRtStream::builder(miniport, 0, AudioFormat::pcm(2, 48000, 16))
///     .clock(Arc::new(ManualClock::new(10_000_000)))
///     .timer(Box::new(ManualTimer::new()))
///     .build()
///     .unwrap();
/// stream.allocate_buffer_with_notification(4, 4096).unwrap();
/// stream.set_state(KsState::Acquire).unwrap();
/// assert_eq!(stream.get_position().unwrap().play_offset, 0);
/// ```
pub struct WaveRtStream {
    shared: Arc<StreamShared>,
    timer: Box<dyn NotificationTimer>,
    control: Mutex<()>,
    stream_id: StreamId,
    work_items: Option<WorkItems>,
    processing_mode: ProcessingMode,
    timer_period: Duration,
}

impl WaveRtStream {
    /// Start building a stream on `pin` of `miniport`
    pub fn builder(
        miniport: Arc<MiniportWaveRt>,
        pin: u32,
        format: AudioFormat,
    ) -> WaveRtStreamBuilder {
        WaveRtStreamBuilder {
            miniport,
            pin,
            format,
            processing_mode: ProcessingMode::Default,
            clock: None,
            timer: None,
            capture_source: None,
            render_sink: None,
            loopback_post_volume_tap: false,
        }
    }

    pub fn pin(&self) -> u32 {
        self.shared.pin
    }

    pub fn kind(&self) -> PinKind {
        self.shared.kind
    }

    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.processing_mode
    }

    /// Average bytes per second moved by the simulated DMA engine
    pub fn movement_rate(&self) -> u32 {
        self.shared.movement_rate
    }

    pub fn state(&self) -> KsState {
        self.shared.lock().state
    }

    pub fn buffer_descriptor(&self) -> Option<BufferDescriptor> {
        self.shared.lock().descriptor
    }

    /// Allocate the cyclic buffer for event-driven streaming
    ///
    /// # Arguments
    /// * `notification_count` - Notifications per buffer pass
    /// * `requested_size` - Requested buffer size in bytes
    ///
    /// The size is trimmed down to a multiple of both the block alignment
    /// and the notification count, so every packet holds whole frames.
    pub fn allocate_buffer_with_notification(
        &self,
        notification_count: u32,
        requested_size: u32,
    ) -> Result<BufferDescriptor, StreamError> {
        let block_align = self.shared.format.block_align();
        if requested_size == 0 || requested_size < block_align {
            return Err(StreamError::Unsuccessful("requested size smaller than one frame"));
        }
        if notification_count == 0 || requested_size % notification_count != 0 {
            return Err(StreamError::InvalidParameter(
                "size must be a non-zero multiple of the notification count",
            ));
        }
        let granule = block_align as u64 * notification_count as u64;
        let size = (requested_size as u64 - requested_size as u64 % granule) as u32;
        if size == 0 {
            return Err(StreamError::Unsuccessful("no whole frame per notification"));
        }
        let buffer_ms = (size as u64 * 1000 / self.shared.movement_rate as u64) as u32;
        let descriptor = BufferDescriptor {
            size,
            notifications_per_buffer: notification_count,
            notification_interval_ms: buffer_ms / notification_count,
        };
        self.install_buffer(descriptor)?;
        tracing::info!(
            pin = self.shared.pin,
            size,
            notifications = notification_count,
            interval_ms = descriptor.notification_interval_ms,
            "Allocated buffer with notification"
        );
        Ok(descriptor)
    }

    /// Allocate the cyclic buffer for polling clients (no notifications)
    pub fn allocate_audio_buffer(&self, requested_size: u32) -> Result<BufferDescriptor, StreamError> {
        let block_align = self.shared.format.block_align();
        if requested_size == 0 || requested_size < block_align {
            return Err(StreamError::Unsuccessful("requested size smaller than one frame"));
        }
        let descriptor = BufferDescriptor {
            size: requested_size - requested_size % block_align,
            notifications_per_buffer: 0,
            notification_interval_ms: 0,
        };
        self.install_buffer(descriptor)?;
        tracing::info!(pin = self.shared.pin, size = descriptor.size, "Allocated audio buffer");
        Ok(descriptor)
    }

    fn install_buffer(&self, descriptor: BufferDescriptor) -> Result<(), StreamError> {
        let _control = lock(&self.control);
        let mut inner = self.shared.lock();
        if inner.buffer.is_some() {
            return Err(StreamError::InvalidDeviceState);
        }
        if inner.state == KsState::Run {
            return Err(StreamError::InvalidDeviceState);
        }
        let buffer = DmaBuffer::allocate(descriptor.size)?;
        if let Some(sink) = inner.render_sink.as_mut() {
            sink.set_max_write_size(descriptor.size as usize * 4)?;
        }
        inner.buffer = Some(buffer);
        inner.descriptor = Some(descriptor);
        Ok(())
    }

    /// Release the cyclic buffer
    pub fn free_buffer(&self) -> Result<(), StreamError> {
        let _control = lock(&self.control);
        let mut inner = self.shared.lock();
        if inner.state == KsState::Run {
            return Err(StreamError::InvalidDeviceState);
        }
        inner.buffer = None;
        inner.descriptor = None;
        Ok(())
    }

    /// Add an event to signal at every completed packet
    pub fn register_notification_event(&self, event: &NotificationEvent) -> Result<(), StreamError> {
        let mut inner = self.shared.lock();
        if inner.notifications.iter().any(|e| e.same_as(event)) {
            return Err(StreamError::DuplicateRegistration);
        }
        inner
            .notifications
            .try_reserve(1)
            .map_err(|_| StreamError::InsufficientResources("notification registration"))?;
        inner.notifications.push(event.clone());
        Ok(())
    }

    /// Remove a registered event; it is never signaled after this returns
    pub fn unregister_notification_event(&self, event: &NotificationEvent) -> Result<(), StreamError> {
        let mut inner = self.shared.lock();
        let idx = inner
            .notifications
            .iter()
            .position(|e| e.same_as(event))
            .ok_or(StreamError::NotFound)?;
        inner.notifications.remove(idx);
        Ok(())
    }

    /// Number of registered notification events
    pub fn notification_count(&self) -> usize {
        self.shared.lock().notifications.len()
    }

    /// Move the stream to a new KS state
    ///
    /// Leaving Run cancels the notification timer and waits for any
    /// in-flight callback before touching shared state. Entering Stop
    /// resets position, packet and EOS state, then waits for pending render
    /// data to be persisted.
    pub fn set_state(&self, to: KsState) -> Result<(), StreamError> {
        let _control = lock(&self.control);
        let from = self.state();
        from.check_transition(to)?;
        if from == to && to != KsState::Stop {
            return Ok(());
        }

        match to {
            KsState::Stop => {
                if from == KsState::Run {
                    self.leave_run();
                }
                self.close_sideband();
                {
                    let mut inner = self.shared.lock();
                    inner.record(MiniportEventKind::PinState(to));
                    inner.reset();
                    inner.state = KsState::Stop;
                }
                tracing::info!(pin = self.shared.pin, %from, %to, "Pin state change");
                if let Some(work_items) = &self.work_items {
                    if !work_items.wait_all(WORK_ITEM_DRAIN_TIMEOUT) {
                        tracing::warn!(
                            pin = self.shared.pin,
                            pending = work_items.pending(),
                            "Timed out waiting for render data to be saved"
                        );
                    }
                }
                return Ok(());
            }
            KsState::Acquire => {
                if from == KsState::Stop {
                    self.open_sideband()?;
                }
            }
            KsState::Pause => {
                if from == KsState::Run {
                    self.leave_run();
                    let mut inner = self.shared.lock();
                    let now = self.shared.clock.now_hns();
                    inner.update_position(now, self.shared.movement_rate, self.shared.kind.is_capture());
                }
            }
            KsState::Run => {
                self.start_sideband()?;
                let interval_ms = {
                    let mut inner = self.shared.lock();
                    let now = self.shared.clock.now_hns();
                    inner.position.dma_timestamp = now;
                    inner.packets.resume(now);
                    inner.record(MiniportEventKind::PinState(to));
                    inner.state = KsState::Run;
                    inner.descriptor.map(|d| d.notification_interval_ms).unwrap_or(0)
                };
                tracing::info!(pin = self.shared.pin, %from, %to, "Pin state change");
                if interval_ms > 0 {
                    self.arm_timer();
                }
                return Ok(());
            }
        }

        {
            let mut inner = self.shared.lock();
            inner.record(MiniportEventKind::PinState(to));
            inner.state = to;
        }
        tracing::info!(pin = self.shared.pin, %from, %to, "Pin state change");
        Ok(())
    }

    fn arm_timer(&self) {
        let weak = Arc::downgrade(&self.shared);
        let callback: TimerCallback = Arc::new(move || match weak.upgrade() {
            Some(shared) => shared.on_timer_tick(),
            None => TimerAction::Cancel,
        });
        self.timer.set(self.timer_period, callback);
    }

    /// Run -> Pause/Stop: cancel the timer, bank partial interval, suspend sideband
    fn leave_run(&self) {
        self.timer.cancel();
        let started = {
            let mut inner = self.shared.lock();
            let now = self.shared.clock.now_hns();
            if inner.descriptor.map(|d| d.notification_interval_ms > 0).unwrap_or(false) {
                inner.packets.suspend(now);
            }
            std::mem::take(&mut inner.sideband_started)
        };
        if started {
            if let Some(sideband) = self.shared.miniport.sideband() {
                if let Err(e) = sideband.stream_suspend(self.shared.kind) {
                    tracing::error!(pin = self.shared.pin, error = %e, "Sideband suspend failed");
                }
            }
        }
    }

    fn open_sideband(&self) -> Result<(), StreamError> {
        let Some(sideband) = self.shared.miniport.sideband() else {
            return Ok(());
        };
        if self.shared.lock().sideband_open {
            return Ok(());
        }
        sideband
            .stream_open(self.shared.kind)
            .map_err(|e| StreamError::Sideband(e.0))?;
        self.shared.lock().sideband_open = true;
        Ok(())
    }

    fn start_sideband(&self) -> Result<(), StreamError> {
        let Some(sideband) = self.shared.miniport.sideband() else {
            return Ok(());
        };
        if self.shared.lock().sideband_started {
            return Ok(());
        }
        sideband
            .stream_start(self.shared.kind)
            .map_err(|e| StreamError::Sideband(e.0))?;
        self.shared.lock().sideband_started = true;
        Ok(())
    }

    fn close_sideband(&self) {
        let open = std::mem::take(&mut self.shared.lock().sideband_open);
        if !open {
            return;
        }
        if let Some(sideband) = self.shared.miniport.sideband() {
            if let Err(e) = sideband.stream_close(self.shared.kind) {
                tracing::error!(pin = self.shared.pin, error = %e, "Sideband close failed");
            }
        }
    }

    /// Current play and write offsets, updated first when running
    pub fn get_position(&self) -> Result<AudioPosition, StreamError> {
        {
            let inner = self.shared.lock();
            if inner.sideband_started && !self.shared.sideband_healthy() {
                return Err(StreamError::InvalidDeviceState);
            }
        }
        self.shared.with_current_position(|inner, _| {
            Ok(AudioPosition {
                play_offset: inner.position.play,
                write_offset: inner.position.write,
            })
        })
    }

    /// Linear byte position and the performance counter it was sampled at
    pub fn get_linear_buffer_position(&self) -> Result<LinearPosition, StreamError> {
        self.shared.with_current_position(|inner, qpc| {
            Ok(LinearPosition {
                position: inner.position.linear,
                performance_counter: qpc,
            })
        })
    }

    /// Presentation position in frames (event-driven streams only)
    pub fn get_presentation_position(&self) -> Result<PresentationPosition, StreamError> {
        let block_align = self.shared.format.block_align() as u64;
        self.shared.with_current_position(|inner, qpc| {
            inner.event_descriptor()?;
            Ok(PresentationPosition {
                position_in_blocks: inner.position.presentation / block_align,
                performance_counter: qpc,
            })
        })
    }

    /// Number of completed packets, updated first when running
    pub fn get_packet_count(&self) -> Result<u32, StreamError> {
        self.shared.lock().event_descriptor()?;
        self.shared
            .with_current_position(|inner, _| Ok(inner.packets.packet_counter as u32))
    }

    /// Last completed packet not yet read by the client
    ///
    /// Fails with `DeviceNotReady` when nothing new has completed. Packets
    /// skipped since the previous read are reported in `dropped` and
    /// logged as a glitch.
    pub fn get_read_packet(&self) -> Result<ReadPacket, StreamError> {
        let mut inner = self.shared.lock();
        let descriptor = inner.event_descriptor()?;
        if inner.state < KsState::Pause {
            return Err(StreamError::InvalidDeviceState);
        }

        let counter = inner.packets.packet_counter;
        // u32::MAX while the first packet is still in flight
        let available = counter.wrapping_sub(1) as u32;
        let last = inner.packets.last_os_read_packet;
        if available == last {
            return Err(StreamError::DeviceNotReady);
        }

        let dropped = available.wrapping_sub(last).wrapping_sub(1);
        if dropped > 0 {
            inner.record(MiniportEventKind::DroppedPackets(dropped));
            tracing::debug!(
                pin = self.shared.pin,
                dropped,
                packet = available,
                "Capture packets dropped"
            );
        }

        let performance_counter = packet_completion_time(
            &inner.position,
            counter,
            descriptor.packet_size(),
            self.shared.movement_rate,
            self.shared.clock.frequency(),
        );
        inner.packets.last_os_read_packet = available;

        Ok(ReadPacket {
            packet_number: available,
            flags: 0,
            performance_counter,
            more_data: false,
            dropped,
        })
    }

    /// Tell the stream the client has written `packet_number`
    ///
    /// # Arguments
    /// * `packet_number` - Must equal the expected next packet
    /// * `flags` - [`STREAM_FLAG_END_OF_STREAM`] marks the final packet
    /// * `eos_length` - Valid bytes in the final packet
    pub fn set_write_packet(
        &self,
        packet_number: u32,
        flags: u32,
        eos_length: u32,
    ) -> Result<(), StreamError> {
        let mut inner = self.shared.lock();
        let descriptor = inner.event_descriptor()?;
        if inner.eos.received {
            return Err(StreamError::InvalidDeviceState);
        }

        let running = inner.state == KsState::Run;
        inner.packets.check_write_packet(packet_number, running)?;

        let packet_size = descriptor.packet_size();
        let mut write_position = (packet_number % descriptor.notifications_per_buffer) * packet_size;

        if flags & STREAM_FLAG_END_OF_STREAM != 0 {
            if eos_length > packet_size {
                return Err(StreamError::InvalidParameter("EOS length exceeds packet size"));
            }
            write_position += eos_length;
            inner.packets.last_os_write_packet = packet_number;
            inner.packets.current_write_position = write_position;
            inner.eos = EndOfStream {
                received: true,
                target: write_position,
                last_buffer_rendered: false,
            };
            tracing::debug!(
                pin = self.shared.pin,
                packet = packet_number,
                eos_position = write_position,
                "End of stream received"
            );
            return Ok(());
        }

        let previous = inner.packets.last_os_write_packet;
        inner.packets.last_os_write_packet = packet_number;
        if let Err(e) =
            inner
                .packets
                .set_current_write_position(write_position, descriptor.size, true)
        {
            inner.packets.last_os_write_packet = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Set the client write offset directly (render streams)
    pub fn set_write_position(&self, offset: u32) -> Result<(), StreamError> {
        if self.shared.kind.is_capture() {
            return Err(StreamError::NotSupported);
        }
        let mut inner = self.shared.lock();
        let descriptor = inner.descriptor.ok_or(StreamError::InvalidDeviceState)?;
        if inner.eos.received {
            return Err(StreamError::InvalidDeviceState);
        }
        inner
            .packets
            .set_current_write_position(offset, descriptor.size, descriptor.is_event_driven())
    }

    /// Apply content rights; copy-protected content is not written to disk
    pub fn set_content_id(&self, content_id: u32, copy_protect: bool) {
        let mut inner = self.shared.lock();
        inner.content_id = content_id;
        if let Some(sink) = inner.render_sink.as_mut() {
            sink.disable(copy_protect);
        }
    }

    pub fn content_id(&self) -> u32 {
        self.shared.lock().content_id
    }

    /// Copy client data into the buffer at `offset`, wrapping at the end
    pub fn write_buffer(&self, offset: u32, data: &[u8]) -> Result<usize, StreamError> {
        let mut inner = self.shared.lock();
        let buffer = inner.buffer.as_mut().ok_or(StreamError::InvalidDeviceState)?;
        Ok(buffer.write_wrapping(offset as usize, data))
    }

    /// Copy buffer contents at `offset` into `out`, wrapping at the end
    pub fn read_buffer(&self, offset: u32, out: &mut [u8]) -> Result<usize, StreamError> {
        let inner = self.shared.lock();
        let buffer = inner.buffer.as_ref().ok_or(StreamError::InvalidDeviceState)?;
        Ok(buffer.read_wrapping(offset as usize, out))
    }

    /// Running diagnostic totals
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.lock().events.snapshot()
    }

    /// Copy of the recorded diagnostic events, oldest first
    pub fn events(&self) -> Vec<MiniportEvent> {
        self.shared.lock().events.events().cloned().collect()
    }

    /// Whether the notification timer is armed
    pub fn is_timer_armed(&self) -> bool {
        self.timer.is_armed()
    }
}

impl Drop for WaveRtStream {
    fn drop(&mut self) {
        self.timer.cancel();
        let started = {
            let mut inner = self.shared.lock();
            inner.notifications.clear();
            std::mem::take(&mut inner.sideband_started)
        };
        if started {
            if let Some(sideband) = self.shared.miniport.sideband() {
                if let Err(e) = sideband.stream_suspend(self.shared.kind) {
                    tracing::warn!(pin = self.shared.pin, error = %e, "Sideband suspend failed on close");
                }
            }
        }
        self.close_sideband();
        self.shared.miniport.stream_closed(self.shared.pin, self.stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DriverConfig;
    use crate::wavert::sideband::{SidebandDevice, SidebandError};
    use crate::wavert::timer::ManualTimer;
    use std::sync::atomic::{AtomicBool, Ordering};

    const BASE_TICKS: u64 = 1_000_000_000;

    struct Harness {
        stream: WaveRtStream,
        clock: ManualClock,
        timer: ManualTimer,
    }

    fn config() -> DriverConfig {
        DriverConfig {
            do_not_create_data_files: true,
            ..Default::default()
        }
    }

    fn harness_on(miniport: MiniportWaveRt, pin: u32) -> Harness {
        let clock = ManualClock::new(10_000_000);
        clock.set_ticks(BASE_TICKS);
        let timer = ManualTimer::new();
        let stream = WaveRtStream::builder(Arc::new(miniport), pin, AudioFormat::pcm(2, 48000, 16))
            .clock(Arc::new(clock.clone()))
            .timer(Box::new(timer.clone()))
            .build()
            .unwrap();
        Harness { stream, clock, timer }
    }

    fn render() -> Harness {
        harness_on(MiniportWaveRt::speaker(config()), 0)
    }

    fn run(h: &Harness) {
        h.stream.set_state(KsState::Acquire).unwrap();
        h.stream.set_state(KsState::Pause).unwrap();
        h.stream.set_state(KsState::Run).unwrap();
    }

    #[test]
    fn test_allocation_validation() {
        let h = render();
        assert!(matches!(
            h.stream.allocate_buffer_with_notification(4, 0),
            Err(StreamError::Unsuccessful(_))
        ));
        assert!(matches!(
            h.stream.allocate_buffer_with_notification(4, 3),
            Err(StreamError::Unsuccessful(_))
        ));
        assert!(matches!(
            h.stream.allocate_buffer_with_notification(0, 4096),
            Err(StreamError::InvalidParameter(_))
        ));
        assert!(matches!(
            h.stream.allocate_buffer_with_notification(3, 4096),
            Err(StreamError::InvalidParameter(_))
        ));

        let d = h.stream.allocate_buffer_with_notification(4, 4096).unwrap();
        assert_eq!(d.size, 4096);
        assert_eq!(d.notification_interval_ms, 5);
        assert_eq!(
            h.stream.allocate_buffer_with_notification(4, 4096),
            Err(StreamError::InvalidDeviceState),
            "second allocation without free must fail"
        );
        h.stream.free_buffer().unwrap();
        assert!(h.stream.buffer_descriptor().is_none());
    }

    #[test]
    fn test_allocation_trims_to_whole_frames_per_packet() {
        let h = render();
        // 4100 / 2 = 2050 bytes per packet, not a whole number of 4-byte frames
        let d = h.stream.allocate_buffer_with_notification(2, 4100).unwrap();
        assert_eq!(d.size, 4096);
        assert_eq!(d.packet_size() % 4, 0);
    }

    #[test]
    fn test_polling_buffer_rejects_packet_calls() {
        let h = render();
        let d = h.stream.allocate_audio_buffer(4099).unwrap();
        assert_eq!(d.size, 4096);
        assert_eq!(d.notifications_per_buffer, 0);
        assert_eq!(h.stream.get_read_packet(), Err(StreamError::NotSupported));
        assert_eq!(h.stream.set_write_packet(0, 0, 0), Err(StreamError::NotSupported));
        assert_eq!(h.stream.get_packet_count(), Err(StreamError::NotSupported));

        run(&h);
        assert!(!h.stream.is_timer_armed(), "polling mode never arms the timer");
        h.clock.advance_ms(10);
        assert_eq!(h.stream.get_position().unwrap().play_offset, 1920);
    }

    #[test]
    fn test_duplicate_registration() {
        let h = render();
        let event = NotificationEvent::new();
        h.stream.register_notification_event(&event).unwrap();
        assert_eq!(
            h.stream.register_notification_event(&event.clone()),
            Err(StreamError::DuplicateRegistration)
        );
        h.stream.unregister_notification_event(&event).unwrap();
        assert_eq!(
            h.stream.unregister_notification_event(&event),
            Err(StreamError::NotFound)
        );
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let h = render();
        assert_eq!(h.stream.set_state(KsState::Run), Err(StreamError::InvalidDeviceState));
        assert_eq!(h.stream.state(), KsState::Stop);
    }

    #[test]
    fn test_timer_signals_on_interval() {
        let h = render();
        h.stream.allocate_buffer_with_notification(4, 4096).unwrap();
        let event = NotificationEvent::new();
        h.stream.register_notification_event(&event).unwrap();
        run(&h);
        assert_eq!(h.timer.period(), Some(Duration::from_millis(1)));

        for _ in 0..4 {
            h.clock.advance_ms(1);
            h.timer.fire();
            assert!(!event.is_signaled());
        }
        h.clock.advance_ms(1);
        h.timer.fire();
        assert!(event.try_take(), "fifth millisecond completes the 5ms interval");
        assert_eq!(h.stream.get_packet_count().unwrap(), 1);
    }

    #[test]
    fn test_unregistered_event_not_signaled() {
        let h = render();
        h.stream.allocate_buffer_with_notification(4, 4096).unwrap();
        let event = NotificationEvent::new();
        h.stream.register_notification_event(&event).unwrap();
        run(&h);
        h.stream.unregister_notification_event(&event).unwrap();
        h.clock.advance_ms(6);
        h.timer.fire();
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_underrun_reported_when_client_silent() {
        let h = render();
        h.stream.allocate_buffer_with_notification(4, 4096).unwrap();
        run(&h);
        h.clock.advance_ms(5);
        h.timer.fire();
        assert_eq!(h.stream.diagnostics().underruns, 1);

        h.stream.set_write_packet(2, 0, 0).unwrap();
        h.clock.advance_ms(5);
        h.timer.fire();
        assert_eq!(h.stream.diagnostics().underruns, 1, "client wrote in time");
    }

    #[test]
    fn test_pause_freezes_position() {
        let h = render();
        h.stream.allocate_buffer_with_notification(4, 4096).unwrap();
        run(&h);
        h.clock.advance_ms(3);
        h.stream.set_state(KsState::Pause).unwrap();
        assert!(!h.timer.is_armed());
        let paused = h.stream.get_linear_buffer_position().unwrap().position;
        assert_eq!(paused, 576);

        h.clock.advance_ms(100);
        assert_eq!(h.stream.get_linear_buffer_position().unwrap().position, paused);

        h.stream.set_state(KsState::Run).unwrap();
        h.clock.advance_ms(1);
        assert_eq!(
            h.stream.get_linear_buffer_position().unwrap().position,
            paused + 192,
            "no jump across the pause"
        );
    }

    #[test]
    fn test_pause_carries_partial_interval() {
        let h = render();
        h.stream.allocate_buffer_with_notification(4, 4096).unwrap();
        let event = NotificationEvent::new();
        h.stream.register_notification_event(&event).unwrap();
        run(&h);
        h.clock.advance_ms(3);
        h.stream.set_state(KsState::Pause).unwrap();
        h.clock.advance_ms(50);
        h.stream.set_state(KsState::Run).unwrap();
        h.clock.advance_ms(2);
        h.timer.fire();
        assert!(event.try_take(), "3ms before pause + 2ms after completes the interval");
    }

    #[test]
    fn test_capture_fills_buffer_with_tone() {
        let h = harness_on(MiniportWaveRt::microphone(config()), 0);
        h.stream.allocate_buffer_with_notification(2, 1920).unwrap();
        run(&h);
        h.clock.advance_ms(5);
        h.stream.get_position().unwrap();
        let mut data = vec![0u8; 960];
        h.stream.read_buffer(0, &mut data).unwrap();
        assert!(data.iter().any(|&b| b != 0), "tone should have been written");
    }

    #[test]
    fn test_content_protection_reaches_sink() {
        struct Flag(Arc<AtomicBool>);
        impl RenderSink for Flag {
            fn write(&mut self, _data: &[u8]) {}
            fn set_max_write_size(&mut self, _bytes: usize) -> Result<(), StreamError> {
                Ok(())
            }
            fn disable(&mut self, disabled: bool) {
                self.0.store(disabled, Ordering::SeqCst);
            }
            fn work_items(&self) -> WorkItems {
                WorkItems::default()
            }
        }

        let flag = Arc::new(AtomicBool::new(false));
        let stream = WaveRtStream::builder(
            Arc::new(MiniportWaveRt::speaker(config())),
            0,
            AudioFormat::default(),
        )
        .timer(Box::new(ManualTimer::new()))
        .render_sink(Box::new(Flag(Arc::clone(&flag))))
        .build()
        .unwrap();
        stream.set_content_id(7, true);
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(stream.content_id(), 7);
    }

    struct FlakySideband {
        healthy: AtomicBool,
        log: Mutex<Vec<&'static str>>,
    }

    impl SidebandDevice for FlakySideband {
        fn stream_open(&self, _pin: PinKind) -> Result<(), SidebandError> {
            self.log.lock().unwrap().push("open");
            Ok(())
        }
        fn stream_close(&self, _pin: PinKind) -> Result<(), SidebandError> {
            self.log.lock().unwrap().push("close");
            Ok(())
        }
        fn stream_start(&self, _pin: PinKind) -> Result<(), SidebandError> {
            self.log.lock().unwrap().push("start");
            Ok(())
        }
        fn stream_suspend(&self, _pin: PinKind) -> Result<(), SidebandError> {
            self.log.lock().unwrap().push("suspend");
            Ok(())
        }
        fn stream_status(&self, _pin: PinKind) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_sideband_lifecycle_and_health() {
        let sideband = Arc::new(FlakySideband {
            healthy: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
        });
        let miniport = MiniportWaveRt::speaker(config()).with_sideband(sideband.clone());
        let h = harness_on(miniport, 0);
        h.stream.allocate_buffer_with_notification(4, 4096).unwrap();
        run(&h);
        assert!(h.stream.get_position().is_ok());

        sideband.healthy.store(false, Ordering::SeqCst);
        assert_eq!(h.stream.get_position(), Err(StreamError::InvalidDeviceState));

        h.stream.set_state(KsState::Pause).unwrap();
        h.stream.set_state(KsState::Acquire).unwrap();
        h.stream.set_state(KsState::Stop).unwrap();
        assert_eq!(
            *sideband.log.lock().unwrap(),
            vec!["open", "start", "suspend", "close"]
        );
    }

    #[test]
    fn test_drop_unregisters_from_miniport() {
        let miniport = Arc::new(MiniportWaveRt::microphone(config()));
        let stream = WaveRtStream::builder(Arc::clone(&miniport), 0, AudioFormat::default())
            .timer(Box::new(ManualTimer::new()))
            .build()
            .unwrap();
        assert_eq!(miniport.active_streams(0), 1);
        assert!(matches!(
            WaveRtStream::builder(Arc::clone(&miniport), 0, AudioFormat::default())
                .timer(Box::new(ManualTimer::new()))
                .build(),
            Err(StreamError::TooManyInstances { .. })
        ));
        drop(stream);
        assert_eq!(miniport.active_streams(0), 0);
    }
}
