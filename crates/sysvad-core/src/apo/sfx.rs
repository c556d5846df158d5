//! Channel-swap stream effect (SFX)

use super::base::{ApoBase, RegistrationProperties};
use super::connection::{ConnectionDescriptor, ConnectionProperty};
use super::dsp;
use super::effects::{EffectsControl, SWAP_EFFECT_ID};
use super::error::ApoError;
use super::properties::PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_SFX;
use super::{ApoInit, AudioProcessingObject};

const REGISTRATION: RegistrationProperties = RegistrationProperties::new("SwapApoSfx");

/// Channel-swap SFX; the user may toggle it through the OS
pub struct SwapApoSfx {
    base: ApoBase,
    effects: EffectsControl,
}

impl Default for SwapApoSfx {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapApoSfx {
    pub fn new() -> Self {
        Self {
            base: ApoBase::new(REGISTRATION),
            effects: EffectsControl::new(
                REGISTRATION.friendly_name,
                SWAP_EFFECT_ID,
                PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_SFX,
                true,
            ),
        }
    }
}

impl AudioProcessingObject for SwapApoSfx {
    fn base(&self) -> &ApoBase {
        &self.base
    }

    fn effects(&self) -> &EffectsControl {
        &self.effects
    }

    fn initialize(&mut self, init: ApoInit) -> Result<(), ApoError> {
        self.base.initialize(init)?;
        if let Some(store) = self.base.effects_store() {
            self.effects
                .initialize(store.as_ref(), self.base.processing_mode());
        }
        Ok(())
    }

    fn lock_for_process(
        &mut self,
        inputs: &[ConnectionDescriptor],
        outputs: &[ConnectionDescriptor],
    ) -> Result<(), ApoError> {
        let formats = self.base.validate_connections(inputs, outputs)?;
        self.base.commit_lock(formats);
        Ok(())
    }

    fn unlock_for_process(&mut self) -> Result<(), ApoError> {
        self.base.unlock()
    }

    fn process(&self, input: &mut ConnectionProperty<'_>, output: Option<&mut ConnectionProperty<'_>>) {
        let apply = !self.base.processing_mode().is_raw() && self.effects.is_enabled();
        self.base
            .process_connection(input, output, |frames, count, channels| {
                if apply {
                    dsp::process_swap(frames, count, channels);
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apo::connection::BufferFlags;
    use crate::apo::effects::SystemEffectState;
    use crate::apo::properties::{MemoryPropertyStore, PropVariant, PropertyStore};
    use crate::event::NotificationEvent;
    use crate::format::{AudioFormat, ProcessingMode};
    use std::sync::Arc;

    fn locked(store: Arc<MemoryPropertyStore>) -> SwapApoSfx {
        let mut apo = SwapApoSfx::new();
        apo.initialize(ApoInit::SystemEffects { properties: store })
            .unwrap();
        let conn = ConnectionDescriptor::new(AudioFormat::float32(2, 48000), 256);
        apo.lock_for_process(&[conn], &[conn]).unwrap();
        apo
    }

    #[test]
    fn test_disabled_by_default() {
        let apo = locked(Arc::new(MemoryPropertyStore::new()));
        let mut buf = vec![1.0f32, 2.0];
        let mut input = ConnectionProperty::new(&mut buf, 1, BufferFlags::Valid);
        apo.process(&mut input, None);
        assert_eq!(buf, vec![1.0, 2.0]);
    }

    #[test]
    fn test_property_change_toggles_processing() {
        let store = Arc::new(MemoryPropertyStore::new());
        let apo = locked(Arc::clone(&store));
        let event = NotificationEvent::new();
        apo.get_effects_list(Some(event.clone()));

        store
            .set_value(&PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_SFX, PropVariant::U32(1))
            .unwrap();
        apo.on_property_value_changed(&PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_SFX);
        assert!(event.try_take());
        assert_eq!(apo.get_effects_list(None), vec![SWAP_EFFECT_ID]);

        let mut buf = vec![1.0f32, 2.0];
        let mut input = ConnectionProperty::new(&mut buf, 1, BufferFlags::Valid);
        apo.process(&mut input, None);
        assert_eq!(buf, vec![2.0, 1.0]);
    }

    #[test]
    fn test_user_can_set_state() {
        let apo = locked(Arc::new(MemoryPropertyStore::new()));
        let effects = apo.get_controllable_system_effects_list(None);
        assert_eq!(effects.len(), 1);
        assert!(effects[0].can_set_state);

        apo.set_audio_system_effect_state(SWAP_EFFECT_ID, SystemEffectState::On)
            .unwrap();
        assert!(apo.is_effect_enabled());
    }

    #[test]
    fn test_silent_input_zeroed() {
        let apo = locked(Arc::new(MemoryPropertyStore::new()));
        let mut inbuf = vec![0.7f32; 4];
        let mut outbuf = vec![0.3f32; 4];
        let mut input = ConnectionProperty::new(&mut inbuf, 2, BufferFlags::Silent);
        let mut output = ConnectionProperty::new(&mut outbuf, 0, BufferFlags::Valid);
        apo.process(&mut input, Some(&mut output));
        assert_eq!(output.flags, BufferFlags::Silent);
        assert_eq!(outbuf, vec![0.0; 4]);
        assert_eq!(inbuf, vec![0.0; 4]);
    }

    #[test]
    fn test_latency_is_zero() {
        let apo = SwapApoSfx::new();
        assert_eq!(apo.latency(), 0);
        assert_eq!(apo.registration().max_input_connections, 1);
        assert_eq!(apo.processing_mode(), ProcessingMode::Default);
    }
}
