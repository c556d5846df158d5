//! Effect list, enable flag and change notification
//!
//! The enable flag is read on the real-time path, so it is an atomic. The
//! effect list and the registered change event are guarded by one mutex,
//! taken only from the control path.

use super::error::ApoError;
use super::properties::{effects_enabled, PropertyKey, PropertyStore};
use crate::event::NotificationEvent;
use crate::format::ProcessingMode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// System effect identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectId(pub u128);

/// Identifier of the channel-swap effect
pub const SWAP_EFFECT_ID: EffectId = EffectId(0xb8ec75ba_00ed_434c_a732_064a0f00788e);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEffectState {
    Off,
    On,
}

impl From<bool> for SystemEffectState {
    fn from(on: bool) -> Self {
        if on {
            SystemEffectState::On
        } else {
            SystemEffectState::Off
        }
    }
}

/// One entry of the controllable effects list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemEffect {
    pub id: EffectId,
    pub state: SystemEffectState,
    /// Whether the user may toggle the effect through the OS
    pub can_set_state: bool,
}

#[derive(Debug)]
struct EffectsInner {
    effect: SystemEffect,
    changed_event: Option<NotificationEvent>,
}

/// Enable state of a single-effect APO
#[derive(Debug)]
pub struct EffectsControl {
    name: &'static str,
    enable_key: PropertyKey,
    enabled: AtomicBool,
    inner: Mutex<EffectsInner>,
}

impl EffectsControl {
    /// Create a control for `id`, initially disabled
    pub fn new(name: &'static str, id: EffectId, enable_key: PropertyKey, can_set_state: bool) -> Self {
        Self {
            name,
            enable_key,
            enabled: AtomicBool::new(false),
            inner: Mutex::new(EffectsInner {
                effect: SystemEffect {
                    id,
                    state: SystemEffectState::Off,
                    can_set_state,
                },
                changed_event: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EffectsInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Property key holding this effect's own enable flag
    pub fn enable_key(&self) -> PropertyKey {
        self.enable_key
    }

    /// Cached enable flag; safe to call from the real-time path
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether `key` is one of the properties the enable flag depends on
    pub fn depends_on(&self, key: &PropertyKey) -> bool {
        *key == self.enable_key || *key == super::properties::PKEY_AUDIO_ENDPOINT_DISABLE_SYSFX
    }

    /// Set the flag from the store at initialize time, without signaling
    pub fn initialize(&self, store: &dyn PropertyStore, mode: ProcessingMode) {
        let enabled = match effects_enabled(store, &self.enable_key, mode) {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::warn!(apo = self.name, error = %e, "Could not read effect settings, effect disabled");
                false
            }
        };
        let mut inner = self.lock();
        self.enabled.store(enabled, Ordering::Release);
        inner.effect.state = enabled.into();
        tracing::debug!(apo = self.name, enabled, mode = ?mode, "Effect state initialized");
    }

    /// Recompute the flag from the store; signal the change event once if it flipped
    ///
    /// A failed read keeps the cached value. Returns whether the flag changed.
    pub fn refresh(&self, store: &dyn PropertyStore, mode: ProcessingMode) -> bool {
        let mut inner = self.lock();
        let enabled = match effects_enabled(store, &self.enable_key, mode) {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::warn!(apo = self.name, error = %e, "Property read failed, keeping cached effect state");
                return false;
            }
        };
        let previous = self.enabled.swap(enabled, Ordering::AcqRel);
        if previous == enabled {
            return false;
        }
        inner.effect.state = enabled.into();
        if let Some(event) = &inner.changed_event {
            event.signal();
        }
        tracing::info!(apo = self.name, enabled, "Effect enable changed");
        true
    }

    fn replace_event(inner: &mut EffectsInner, event: Option<NotificationEvent>) {
        inner.changed_event = event;
    }

    /// Ids of active effects; replaces the registered change event
    ///
    /// Empty in Raw mode or while the effect is disabled.
    pub fn effects_list(&self, event: Option<NotificationEvent>, mode: ProcessingMode) -> Vec<EffectId> {
        let mut inner = self.lock();
        Self::replace_event(&mut inner, event);
        if mode.is_raw() || !self.is_enabled() {
            return Vec::new();
        }
        vec![inner.effect.id]
    }

    /// Effects the OS may show to the user; replaces the registered change event
    pub fn controllable_effects(
        &self,
        event: Option<NotificationEvent>,
        mode: ProcessingMode,
    ) -> Vec<SystemEffect> {
        let mut inner = self.lock();
        Self::replace_event(&mut inner, event);
        if mode.is_raw() {
            return Vec::new();
        }
        vec![inner.effect]
    }

    /// Set an effect's state by id
    ///
    /// The change event is signaled when the state actually changes. For a
    /// user-settable effect the new state also drives processing.
    pub fn set_state(&self, id: EffectId, state: SystemEffectState) -> Result<(), ApoError> {
        let mut inner = self.lock();
        if inner.effect.id != id {
            return Err(ApoError::NotFound);
        }
        if inner.effect.state == state {
            return Ok(());
        }
        inner.effect.state = state;
        if inner.effect.can_set_state {
            self.enabled
                .store(state == SystemEffectState::On, Ordering::Release);
        }
        if let Some(event) = &inner.changed_event {
            event.signal();
        }
        tracing::info!(apo = self.name, state = ?state, "System effect state changed");
        Ok(())
    }

    /// Drop the registered change event
    pub fn clear_event(&self) {
        self.lock().changed_event = None;
    }
}
