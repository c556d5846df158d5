//! Channel-swap mode effect (MFX)
//!
//! Swaps the first two channels and scales channel `i` by
//! `1 - i/channels`. Mono streams pass through. When initialized with a
//! real-time work queue, every lock posts one work item to it.

use super::base::{ApoBase, RegistrationProperties};
use super::connection::{ConnectionDescriptor, ConnectionProperty};
use super::dsp;
use super::effects::{EffectsControl, SWAP_EFFECT_ID};
use super::error::ApoError;
use super::properties::PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_MFX;
use super::{ApoInit, AudioProcessingObject};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const REGISTRATION: RegistrationProperties = RegistrationProperties::new("SwapApoMfx");

/// Channel-swap MFX
pub struct SwapApoMfx {
    base: ApoBase,
    effects: EffectsControl,
    coefficients: Vec<f32>,
    work_items_completed: Arc<AtomicU64>,
}

impl Default for SwapApoMfx {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapApoMfx {
    pub fn new() -> Self {
        Self {
            base: ApoBase::new(REGISTRATION),
            effects: EffectsControl::new(
                REGISTRATION.friendly_name,
                SWAP_EFFECT_ID,
                PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_MFX,
                false,
            ),
            coefficients: Vec::new(),
            work_items_completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Per-channel gains fixed at lock time
    pub fn coefficients(&self) -> &[f32] {
        &self.coefficients
    }

    /// Real-time work items that have run to completion
    pub fn work_items_completed(&self) -> u64 {
        self.work_items_completed.load(Ordering::Acquire)
    }
}

/// Work done on the real-time queue alongside processing
fn do_work_on_real_time_thread() -> Result<(), ApoError> {
    Ok(())
}

fn swap_coefficients(channels: u32) -> Result<Vec<f32>, ApoError> {
    let mut coefficients = Vec::new();
    coefficients
        .try_reserve_exact(channels as usize)
        .map_err(|_| ApoError::OutOfMemory("swap coefficients"))?;
    dsp::swap_scale_coefficients(channels, &mut coefficients);
    Ok(coefficients)
}

impl AudioProcessingObject for SwapApoMfx {
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
        let coefficients = swap_coefficients(formats.input.channels as u32)?;

        // Last fallible step; nothing is queued for a refused lock
        if let Some(queue) = self.base.work_queue() {
            let completed = Arc::clone(&self.work_items_completed);
            queue.put_work_item(move || {
                if let Err(e) = do_work_on_real_time_thread() {
                    tracing::warn!(error = %e, "Real-time work item failed");
                }
                completed.fetch_add(1, Ordering::AcqRel);
            })?;
        }

        self.coefficients = coefficients;
        self.base.commit_lock(formats);
        Ok(())
    }

    fn unlock_for_process(&mut self) -> Result<(), ApoError> {
        self.base.unlock()?;
        self.coefficients.clear();
        Ok(())
    }

    fn process(&self, input: &mut ConnectionProperty<'_>, output: Option<&mut ConnectionProperty<'_>>) {
        let apply = !self.base.processing_mode().is_raw() && self.effects.is_enabled();
        self.base
            .process_connection(input, output, |frames, count, channels| {
                if apply && channels > 1 {
                    dsp::process_swap_scale(frames, count, channels, &self.coefficients);
                }
            });
    }
}
