//! Driver-wide configuration
//!
//! Replaces the driver's process-wide flags and registry tone settings with
//! a JSON-backed struct that is handed to every stream at construction.
//! Missing fields fall back to their defaults so old files keep loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Host capture tone in raw processing mode (Hz)
pub const RAW_MODE_TONE_FREQUENCY: u32 = 1000;

/// Host capture tone in all other processing modes (Hz)
pub const DEFAULT_MODE_TONE_FREQUENCY: u32 = 2000;

/// Loopback tone at the post-volume/mute tap point (Hz)
pub const POST_VOLUME_LOOPBACK_TONE_FREQUENCY: u32 = 4000;

fn default_data_file_dir() -> PathBuf {
    std::env::temp_dir().join("sysvad")
}

fn default_timer_period_ms() -> u32 {
    1
}

fn default_event_log_capacity() -> usize {
    1024
}

fn default_loopback_tone_frequency() -> u32 {
    3000
}

fn default_tone_amplitude() -> i32 {
    50
}

/// Sine tone settings for one kind of capture pin
///
/// Values use the registry's integer units: amplitude and DC offset in
/// percent of full scale, initial phase in 1/10000 radian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneSettings {
    #[serde(default = "default_tone_amplitude")]
    pub amplitude: i32,
    #[serde(default)]
    pub dc_offset: i32,
    #[serde(default)]
    pub initial_phase: i32,
}

impl Default for ToneSettings {
    fn default() -> Self {
        Self {
            amplitude: default_tone_amplitude(),
            dc_offset: 0,
            initial_phase: 0,
        }
    }
}

impl ToneSettings {
    /// Clamp and scale to generator units: `(amplitude, dc_offset, phase_radians)`
    ///
    /// Amplitude and offset are clamped to ±100 each, then scaled so their
    /// absolute sum never exceeds full scale. Phase is clamped to ±π.
    ///
    /// # Example
    /// ```
    /// use sysvad_core::config::ToneSettings;
    ///
    /// let tone = ToneSettings { amplitude: 80, dc_offset: 80, initial_phase: 0 };
    /// let (amp, dc, _) = tone.normalized();
    /// assert!((amp - 0.5).abs() < 1e-9);
    /// assert!((dc - 0.5).abs() < 1e-9);
    /// ```
    pub fn normalized(&self) -> (f64, f64, f64) {
        let amplitude = self.amplitude.clamp(-100, 100);
        let dc_offset = self.dc_offset.clamp(-100, 100);
        let abs_sum = amplitude.abs() + dc_offset.abs();
        let scale = if abs_sum > 100 { abs_sum as f64 } else { 100.0 };
        let phase = self.initial_phase.clamp(-31416, 31416);
        (
            amplitude as f64 / scale,
            dc_offset as f64 / scale,
            phase as f64 / 10000.0,
        )
    }
}

/// Configuration shared by the miniport and all of its streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Do not persist render data to disk
    #[serde(default)]
    pub do_not_create_data_files: bool,
    /// Directory for rendered WAV captures
    #[serde(default = "default_data_file_dir")]
    pub data_file_dir: PathBuf,
    /// Period of the notification timer (ms)
    #[serde(default = "default_timer_period_ms")]
    pub timer_period_ms: u32,
    /// Maximum diagnostic events kept per stream
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
    /// Override for the host capture tone (None = choose by processing mode)
    #[serde(default)]
    pub host_capture_tone_frequency: Option<u32>,
    /// Loopback capture tone (Hz)
    #[serde(default = "default_loopback_tone_frequency")]
    pub loopback_capture_tone_frequency: u32,
    #[serde(default)]
    pub host_capture_tone: ToneSettings,
    #[serde(default)]
    pub loopback_capture_tone: ToneSettings,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            do_not_create_data_files: false,
            data_file_dir: default_data_file_dir(),
            timer_period_ms: default_timer_period_ms(),
            event_log_capacity: default_event_log_capacity(),
            host_capture_tone_frequency: None,
            loopback_capture_tone_frequency: default_loopback_tone_frequency(),
            host_capture_tone: ToneSettings::default(),
            loopback_capture_tone: ToneSettings::default(),
        }
    }
}

impl DriverConfig {
    /// Load config from disk, falling back to defaults on any error
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded driver config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse driver config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No driver config found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Driver config saved");
        Ok(())
    }

    /// Host capture tone frequency for the given processing mode
    pub fn host_tone_frequency(&self, raw_mode: bool) -> u32 {
        self.host_capture_tone_frequency.unwrap_or(if raw_mode {
            RAW_MODE_TONE_FREQUENCY
        } else {
            DEFAULT_MODE_TONE_FREQUENCY
        })
    }
}
