//! Channel-swap audio processing objects
//!
//! Two effects share one implementation skeleton ([`base::ApoBase`]):
//!
//! - [`mfx::SwapApoMfx`]: mode effect, swaps the first two channels and
//!   ramps per-channel gain down by `1/channels`
//! - [`sfx::SwapApoSfx`]: stream effect, plain swap, user-toggleable
//!
//! ## Real-time contract
//!
//! `process` takes `&self`, never allocates, never blocks and never
//! fails. Everything it reads is either fixed at lock time (coefficients,
//! channel count) or an atomic (the enable flag), so property-change
//! notifications may run concurrently from another thread.

pub mod base;
pub mod connection;
pub mod dsp;
pub mod effects;
pub mod error;
pub mod formats;
pub mod mfx;
pub mod properties;
pub mod sfx;
pub mod work_queue;

pub use connection::{BufferFlags, ConnectionDescriptor, ConnectionProperty};
pub use effects::{EffectId, EffectsControl, SystemEffect, SystemEffectState, SWAP_EFFECT_ID};
pub use error::{ApoError, PropertyError, WorkQueueError};
pub use formats::FormatSupport;
pub use properties::{MemoryPropertyStore, PropVariant, PropertyKey, PropertyStore};
pub use work_queue::RealTimeWorkQueue;

use crate::event::NotificationEvent;
use crate::format::{AudioFormat, ProcessingMode};
use base::{ApoBase, RegistrationProperties};
use std::sync::Arc;

/// Initialization data, one variant per host generation
pub enum ApoInit {
    /// Effect settings store only; mode is Default
    SystemEffects {
        properties: Arc<dyn PropertyStore>,
    },
    /// Effect settings store plus processing mode
    SystemEffects2 {
        properties: Arc<dyn PropertyStore>,
        processing_mode: ProcessingMode,
    },
    /// User property store, processing mode and a real-time work queue
    SystemEffects3 {
        user_store: Arc<dyn PropertyStore>,
        processing_mode: ProcessingMode,
        work_queue: Arc<RealTimeWorkQueue>,
    },
}

/// Notification kinds an APO can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApoNotificationType {
    EndpointPropertyChange,
    AudioEnvironmentStateChange,
}

/// Notification delivered by the host
pub enum ApoNotification {
    /// A property of the endpoint the APO runs on changed
    EndpointPropertyChange { key: PropertyKey },
    /// The audio environment changed; `properties` holds the new state
    AudioEnvironmentStateChange { properties: Arc<dyn PropertyStore> },
}

/// Interface the audio engine drives
///
/// Implementors supply lifecycle and processing; format negotiation,
/// effect lists and change notifications are shared.
pub trait AudioProcessingObject: Send + Sync {
    fn base(&self) -> &ApoBase;

    fn effects(&self) -> &EffectsControl;

    /// One-time setup; a second call fails with `AlreadyInitialized`
    fn initialize(&mut self, init: ApoInit) -> Result<(), ApoError>;

    /// Validate connections and fix processing resources
    fn lock_for_process(
        &mut self,
        inputs: &[ConnectionDescriptor],
        outputs: &[ConnectionDescriptor],
    ) -> Result<(), ApoError>;

    fn unlock_for_process(&mut self) -> Result<(), ApoError>;

    /// Real-time entry point; `output` of `None` processes in place
    fn process(&self, input: &mut ConnectionProperty<'_>, output: Option<&mut ConnectionProperty<'_>>);

    fn registration(&self) -> &RegistrationProperties {
        self.base().registration()
    }

    /// Delay added between input and output, in 100ns units
    fn latency(&self) -> u64 {
        0
    }

    fn processing_mode(&self) -> ProcessingMode {
        self.base().processing_mode()
    }

    fn is_locked(&self) -> bool {
        self.base().is_locked()
    }

    /// Whether the effect is currently applied by `process`
    fn is_effect_enabled(&self) -> bool {
        self.effects().is_enabled()
    }

    fn format_count(&self) -> usize {
        formats::custom_formats().len()
    }

    fn format(&self, index: usize) -> Result<AudioFormat, ApoError> {
        formats::custom_formats()
            .get(index)
            .map(|f| f.format)
            .ok_or(ApoError::InvalidArgument("format index out of range"))
    }

    fn format_representation(&self, index: usize) -> Result<&'static str, ApoError> {
        formats::format_representation(index)
    }

    fn is_output_format_supported(
        &self,
        input: Option<&AudioFormat>,
        requested: &AudioFormat,
    ) -> Result<FormatSupport, ApoError> {
        formats::is_output_format_supported(input, requested)
    }

    /// Active effect ids; `event` replaces any previously registered change event
    fn get_effects_list(&self, event: Option<NotificationEvent>) -> Vec<EffectId> {
        self.effects().effects_list(event, self.processing_mode())
    }

    /// Effects the OS may expose; `event` replaces any previously registered change event
    fn get_controllable_system_effects_list(&self, event: Option<NotificationEvent>) -> Vec<SystemEffect> {
        self.effects()
            .controllable_effects(event, self.processing_mode())
    }

    fn set_audio_system_effect_state(&self, id: EffectId, state: SystemEffectState) -> Result<(), ApoError> {
        self.effects().set_state(id, state)
    }

    /// Endpoint property change delivered through the settings store
    ///
    /// Only relevant for APOs initialized with a settings store
    /// (`SystemEffects`/`SystemEffects2`).
    fn on_property_value_changed(&self, key: &PropertyKey) {
        let Some(store) = self.base().system_effects_store() else {
            return;
        };
        if self.effects().depends_on(key) {
            self.effects().refresh(store.as_ref(), self.processing_mode());
        }
    }

    /// Notifications to subscribe to
    ///
    /// Environment changes are requested only when the host supports them.
    fn notification_registrations(&self, environment_supported: bool) -> Vec<ApoNotificationType> {
        let mut types = vec![ApoNotificationType::EndpointPropertyChange];
        if environment_supported {
            types.push(ApoNotificationType::AudioEnvironmentStateChange);
        }
        types
    }

    fn handle_notification(&self, notification: &ApoNotification) {
        match notification {
            ApoNotification::EndpointPropertyChange { key } => {
                if !self.effects().depends_on(key) {
                    return;
                }
                if let Some(store) = self.base().user_store() {
                    tracing::debug!(
                        apo = self.registration().friendly_name,
                        pid = key.pid,
                        "Endpoint property changed"
                    );
                    self.effects().refresh(store.as_ref(), self.processing_mode());
                }
            }
            ApoNotification::AudioEnvironmentStateChange { properties } => {
                if let Ok(PropVariant::Bool(active)) =
                    properties.get_value(&properties::PKEY_AUDIO_ENVIRONMENT_SPATIAL_AUDIO_ACTIVE)
                {
                    self.base().set_spatial_audio_active(active);
                    tracing::debug!(
                        apo = self.registration().friendly_name,
                        spatial_audio_active = active,
                        "Audio environment changed"
                    );
                }
            }
        }
    }
}
