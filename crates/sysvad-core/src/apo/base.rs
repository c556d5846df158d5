//! State shared by every APO: registration, initialization and lock
//!
//! Lifecycle:
//! 1. `initialize` once with one of the [`ApoInit`] variants
//! 2. `lock_for_process` validates the connection formats
//! 3. `process` runs once per quantum on the real-time thread
//! 4. `unlock_for_process` before renegotiating

use super::connection::{BufferFlags, ConnectionDescriptor, ConnectionProperty};
use super::dsp;
use super::error::ApoError;
use super::properties::PropertyStore;
use super::work_queue::RealTimeWorkQueue;
use super::ApoInit;
use crate::format::{AudioFormat, ProcessingMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Static registration data of an APO class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationProperties {
    pub friendly_name: &'static str,
    pub copyright: &'static str,
    pub major_version: u32,
    pub minor_version: u32,
    /// Input and output may share one buffer
    pub in_place: bool,
    pub min_input_connections: u32,
    pub max_input_connections: u32,
    pub min_output_connections: u32,
    pub max_output_connections: u32,
    pub max_instances: u32,
}

impl RegistrationProperties {
    /// Single-input, single-output, in-place registration
    pub const fn new(friendly_name: &'static str) -> Self {
        Self {
            friendly_name,
            copyright: "SYSVAD sample",
            major_version: 1,
            minor_version: 0,
            in_place: true,
            min_input_connections: 1,
            max_input_connections: 1,
            min_output_connections: 1,
            max_output_connections: 1,
            max_instances: u32::MAX,
        }
    }
}

/// Formats fixed by a successful lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedFormats {
    pub input: AudioFormat,
    pub output: AudioFormat,
    pub max_frame_count: u32,
}

/// Common APO state
pub struct ApoBase {
    registration: RegistrationProperties,
    initialized: bool,
    locked: Option<LockedFormats>,
    processing_mode: ProcessingMode,
    system_effects_store: Option<Arc<dyn PropertyStore>>,
    user_store: Option<Arc<dyn PropertyStore>>,
    work_queue: Option<Arc<RealTimeWorkQueue>>,
    spatial_audio_active: AtomicBool,
}

impl ApoBase {
    pub fn new(registration: RegistrationProperties) -> Self {
        Self {
            registration,
            initialized: false,
            locked: None,
            processing_mode: ProcessingMode::Default,
            system_effects_store: None,
            user_store: None,
            work_queue: None,
            spatial_audio_active: AtomicBool::new(false),
        }
    }

    pub fn registration(&self) -> &RegistrationProperties {
        &self.registration
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }

    pub fn locked_formats(&self) -> Option<LockedFormats> {
        self.locked
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.processing_mode
    }

    /// Samples per frame of the locked input, 0 before lock
    pub fn samples_per_frame(&self) -> u32 {
        self.locked.map(|l| l.input.channels as u32).unwrap_or(0)
    }

    /// Store handed over by `SystemEffects`/`SystemEffects2` initialization
    pub fn system_effects_store(&self) -> Option<&Arc<dyn PropertyStore>> {
        self.system_effects_store.as_ref()
    }

    /// User store handed over by `SystemEffects3` initialization
    pub fn user_store(&self) -> Option<&Arc<dyn PropertyStore>> {
        self.user_store.as_ref()
    }

    /// Whichever store effect settings should be read from
    pub fn effects_store(&self) -> Option<&Arc<dyn PropertyStore>> {
        self.system_effects_store.as_ref().or(self.user_store.as_ref())
    }

    pub fn work_queue(&self) -> Option<&Arc<RealTimeWorkQueue>> {
        self.work_queue.as_ref()
    }

    pub fn is_spatial_audio_active(&self) -> bool {
        self.spatial_audio_active.load(Ordering::Acquire)
    }

    pub fn set_spatial_audio_active(&self, active: bool) {
        self.spatial_audio_active.store(active, Ordering::Release);
    }

    /// Record the initialization data; fails if already initialized
    pub fn initialize(&mut self, init: ApoInit) -> Result<(), ApoError> {
        if self.initialized {
            return Err(ApoError::AlreadyInitialized);
        }
        match init {
            ApoInit::SystemEffects { properties } => {
                self.system_effects_store = Some(properties);
                self.processing_mode = ProcessingMode::Default;
            }
            ApoInit::SystemEffects2 {
                properties,
                processing_mode,
            } => {
                self.system_effects_store = Some(properties);
                self.processing_mode = processing_mode;
            }
            ApoInit::SystemEffects3 {
                user_store,
                processing_mode,
                work_queue,
            } => {
                self.user_store = Some(user_store);
                self.processing_mode = processing_mode;
                self.work_queue = Some(work_queue);
            }
        }
        self.initialized = true;
        tracing::debug!(
            apo = self.registration.friendly_name,
            mode = ?self.processing_mode,
            "APO initialized"
        );
        Ok(())
    }

    /// Check a connection set against the registration and each other
    ///
    /// Nothing is committed; call [`commit_lock`](Self::commit_lock) once
    /// every other lock step has succeeded.
    pub fn validate_connections(
        &self,
        inputs: &[ConnectionDescriptor],
        outputs: &[ConnectionDescriptor],
    ) -> Result<LockedFormats, ApoError> {
        if !self.initialized {
            return Err(ApoError::NotInitialized);
        }
        if self.locked.is_some() {
            return Err(ApoError::AlreadyLocked);
        }
        let reg = &self.registration;
        let inputs_ok = (reg.min_input_connections as usize..=reg.max_input_connections as usize)
            .contains(&inputs.len());
        let outputs_ok = (reg.min_output_connections as usize..=reg.max_output_connections as usize)
            .contains(&outputs.len());
        if !inputs_ok || !outputs_ok {
            return Err(ApoError::NumConnectionsInvalid {
                inputs: inputs.len(),
                outputs: outputs.len(),
            });
        }

        let input = inputs[0];
        let output = outputs[0];
        if !input.format.is_float32() || !output.format.is_float32() {
            return Err(ApoError::InvalidConnectionFormat("connections must be 32-bit float"));
        }
        if input.format.validate().is_err() {
            return Err(ApoError::InvalidConnectionFormat("input format is malformed"));
        }
        if input.format.sample_rate != output.format.sample_rate {
            return Err(ApoError::InvalidConnectionFormat("sample rate differs between input and output"));
        }
        if input.format.channels != output.format.channels {
            return Err(ApoError::InvalidConnectionFormat("channel count differs between input and output"));
        }
        if input.max_frame_count == 0 {
            return Err(ApoError::InvalidConnectionFormat("zero max frame count"));
        }

        Ok(LockedFormats {
            input: input.format,
            output: output.format,
            max_frame_count: input.max_frame_count.min(output.max_frame_count),
        })
    }

    pub fn commit_lock(&mut self, formats: LockedFormats) {
        self.locked = Some(formats);
        tracing::debug!(
            apo = self.registration.friendly_name,
            channels = formats.input.channels,
            rate = formats.input.sample_rate,
            max_frames = formats.max_frame_count,
            "APO locked for processing"
        );
    }

    pub fn unlock(&mut self) -> Result<(), ApoError> {
        if self.locked.take().is_none() {
            return Err(ApoError::NotLocked);
        }
        tracing::debug!(apo = self.registration.friendly_name, "APO unlocked");
        Ok(())
    }

    /// Run one quantum: silence fill, in-place transform, copy out, flag propagation
    ///
    /// `output` of `None` means the output shares the input buffer. An
    /// `Invalid` input, or a call before lock, is ignored.
    pub fn process_connection<F>(
        &self,
        input: &mut ConnectionProperty<'_>,
        output: Option<&mut ConnectionProperty<'_>>,
        transform: F,
    ) where
        F: FnOnce(&mut [f32], u32, u32),
    {
        let Some(locked) = self.locked else {
            return;
        };
        match input.flags {
            BufferFlags::Invalid => return,
            BufferFlags::Valid | BufferFlags::Silent => {}
        }

        let channels = locked.input.channels as u32;
        let frames = input.valid_frame_count;

        if input.flags == BufferFlags::Silent {
            dsp::write_silence(input.buffer, frames, channels);
        }

        transform(input.buffer, frames, channels);

        if let Some(output) = output {
            dsp::copy_frames(output.buffer, input.buffer, frames, channels);
            output.flags = input.flags;
            output.valid_frame_count = frames;
        }
    }
}
