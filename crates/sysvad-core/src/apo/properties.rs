//! Endpoint property store
//!
//! Effect enable state lives in a property store shared with the control
//! panel. The APO only reads it; writes come from the UI side.

use super::error::PropertyError;
use crate::format::ProcessingMode;
use std::collections::HashMap;
use std::sync::Mutex;

/// Property identifier: format id plus property id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyKey {
    pub fmtid: u128,
    pub pid: u32,
}

impl PropertyKey {
    pub const fn new(fmtid: u128, pid: u32) -> Self {
        Self { fmtid, pid }
    }
}

/// Master switch: non-zero disables every system effect on the endpoint
pub const PKEY_AUDIO_ENDPOINT_DISABLE_SYSFX: PropertyKey =
    PropertyKey::new(0x1da5d803_d492_4edd_8c23_e0c0ffee7f0e, 5);

/// Enable flag for the channel-swap stream effect
pub const PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_SFX: PropertyKey =
    PropertyKey::new(0xa44531ef_5377_4944_ae15_53789a9629c7, 2);

/// Enable flag for the channel-swap mode effect
pub const PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_MFX: PropertyKey =
    PropertyKey::new(0xa44531ef_5377_4944_ae15_53789a9629c7, 3);

/// Spatial audio rendering active on the endpoint
pub const PKEY_AUDIO_ENVIRONMENT_SPATIAL_AUDIO_ACTIVE: PropertyKey =
    PropertyKey::new(0x2b5d9d3c_5f5b_4a4e_9c08_6b1a5f7e0d21, 2);

/// Typed property value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PropVariant {
    #[default]
    Empty,
    U32(u32),
    Bool(bool),
    Str(String),
}

/// Read/write access to a set of properties
pub trait PropertyStore: Send + Sync {
    /// Value of `key`, or [`PropVariant::Empty`] if unset
    fn get_value(&self, key: &PropertyKey) -> Result<PropVariant, PropertyError>;

    fn set_value(&self, key: &PropertyKey, value: PropVariant) -> Result<(), PropertyError>;
}

/// In-memory property store
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: Mutex<HashMap<PropertyKey, PropVariant>>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(self, key: PropertyKey, value: PropVariant) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key, value);
        }
        self
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get_value(&self, key: &PropertyKey) -> Result<PropVariant, PropertyError> {
        let values = self
            .values
            .lock()
            .map_err(|_| PropertyError::Unavailable("store lock poisoned".into()))?;
        Ok(values.get(key).cloned().unwrap_or_default())
    }

    fn set_value(&self, key: &PropertyKey, value: PropVariant) -> Result<(), PropertyError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| PropertyError::Unavailable("store lock poisoned".into()))?;
        values.insert(*key, value);
        Ok(())
    }
}

/// Combined enable state for one effect
///
/// Enabled only when the master disable is not set (absent counts as not
/// set), the effect's own enable is a non-zero `U32`, and the mode is not
/// Raw. Raw wins over both properties.
///
/// # Example
/// ```
/// use sysvad_core::apo::properties::*;
/// use sysvad_core::format::ProcessingMode;
///
/// let store = MemoryPropertyStore::new()
///     .with(PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_MFX, PropVariant::U32(1));
/// let key = PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_MFX;
/// assert!(effects_enabled(&store, &key, ProcessingMode::Default).unwrap());
/// assert!(!effects_enabled(&store, &key, ProcessingMode::Raw).unwrap());
/// ```
pub fn effects_enabled(
    store: &dyn PropertyStore,
    enable_key: &PropertyKey,
    mode: ProcessingMode,
) -> Result<bool, PropertyError> {
    let master_disabled = matches!(
        store.get_value(&PKEY_AUDIO_ENDPOINT_DISABLE_SYSFX)?,
        PropVariant::U32(v) if v != 0
    );
    let effect_enabled = matches!(store.get_value(enable_key)?, PropVariant::U32(v) if v != 0);
    Ok(!master_disabled && effect_enabled && !mode.is_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: PropertyKey = PKEY_ENDPOINT_ENABLE_CHANNEL_SWAP_SFX;

    fn store(master: Option<u32>, enable: Option<u32>) -> MemoryPropertyStore {
        let mut s = MemoryPropertyStore::new();
        if let Some(v) = master {
            s = s.with(PKEY_AUDIO_ENDPOINT_DISABLE_SYSFX, PropVariant::U32(v));
        }
        if let Some(v) = enable {
            s = s.with(KEY, PropVariant::U32(v));
        }
        s
    }

    #[test]
    fn test_enabled_combination() {
        let mode = ProcessingMode::Default;
        assert!(effects_enabled(&store(Some(0), Some(1)), &KEY, mode).unwrap());
        assert!(effects_enabled(&store(None, Some(1)), &KEY, mode).unwrap());
        assert!(!effects_enabled(&store(Some(1), Some(1)), &KEY, mode).unwrap());
        assert!(!effects_enabled(&store(Some(0), Some(0)), &KEY, mode).unwrap());
        assert!(!effects_enabled(&store(Some(0), None), &KEY, mode).unwrap());
    }

    #[test]
    fn test_raw_mode_overrides() {
        for master in [None, Some(0), Some(1)] {
            for enable in [None, Some(0), Some(1)] {
                assert!(
                    !effects_enabled(&store(master, enable), &KEY, ProcessingMode::Raw).unwrap(),
                    "raw must disable (master={master:?}, enable={enable:?})"
                );
            }
        }
    }

    #[test]
    fn test_wrong_type_counts_as_unset() {
        let s = MemoryPropertyStore::new().with(KEY, PropVariant::Bool(true));
        assert!(!effects_enabled(&s, &KEY, ProcessingMode::Media).unwrap());
    }

    #[test]
    fn test_set_and_get() {
        let s = MemoryPropertyStore::new();
        assert_eq!(s.get_value(&KEY).unwrap(), PropVariant::Empty);
        s.set_value(&KEY, PropVariant::U32(7)).unwrap();
        assert_eq!(s.get_value(&KEY).unwrap(), PropVariant::U32(7));
    }
}
