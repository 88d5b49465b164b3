//! Audio Configuration
//!
//! Call audio settings persisted as JSON, with `VC_AUDIO_*` environment
//! overrides applied on top.

use std::env;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audio::{FrameFormat, DEFAULT_CHANNELS, DEFAULT_FRAME_DURATION_MS, DEFAULT_SAMPLE_RATE};

/// Default audio bit rate in kbit/s
pub const DEFAULT_AUDIO_BIT_RATE: u32 = 64;
pub const MIN_AUDIO_BIT_RATE: u32 = 6;
pub const MAX_AUDIO_BIT_RATE: u32 = 510;

/// Default VAD threshold on the 0-100 volume scale
pub const DEFAULT_VAD_THRESHOLD: f32 = 5.0;

const SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];
const FRAME_DURATIONS_MS: [u32; 4] = [10, 20, 40, 60];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AudioSettings {
    /// Capture device selection; `None` uses the platform default
    pub input_device: Option<usize>,
    /// Playback device selection; `None` uses the platform default
    pub output_device: Option<usize>,
    pub vad_threshold: f32,
    pub chat_audio_channels: u8,
    /// kbit/s
    pub audio_bit_rate: u32,
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub capture_poll_interval_ms: u64,
    pub vad_hold_ms: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            chat_audio_channels: DEFAULT_CHANNELS,
            audio_bit_rate: DEFAULT_AUDIO_BIT_RATE,
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            capture_poll_interval_ms: 10,
            vad_hold_ms: 250,
        }
    }
}

impl AudioSettings {
    /// Clamp values to valid ranges and replace unusable ones with defaults.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        self.vad_threshold = if self.vad_threshold.is_nan() {
            defaults.vad_threshold
        } else {
            self.vad_threshold.clamp(0.0, 100.0)
        };
        if !matches!(self.chat_audio_channels, 1 | 2) {
            self.chat_audio_channels = defaults.chat_audio_channels;
        }
        self.audio_bit_rate = self
            .audio_bit_rate
            .clamp(MIN_AUDIO_BIT_RATE, MAX_AUDIO_BIT_RATE);
        if !SAMPLE_RATES.contains(&self.sample_rate) {
            self.sample_rate = defaults.sample_rate;
        }
        if !FRAME_DURATIONS_MS.contains(&self.frame_duration_ms) {
            self.frame_duration_ms = defaults.frame_duration_ms;
        }
        self.capture_poll_interval_ms = self.capture_poll_interval_ms.clamp(1, 100);
        self.vad_hold_ms = self.vad_hold_ms.min(5000);
        self
    }

    /// Load settings from `path`. A missing or corrupt file yields defaults.
    pub fn load(path: &Path) -> Self {
        let settings = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), "Corrupt audio settings, using defaults: {e}");
                Self::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No audio settings file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), "Failed to read audio settings, using defaults: {e}");
                Self::default()
            }
        };
        settings.validated()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `VC_AUDIO_*` environment variables.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides looked up by environment variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .map(|v| v.trim().parse::<T>())
                .transpose()
                .with_context(|| format!("{key} has an invalid value"))
        }

        if let Some(v) = parse("VC_AUDIO_INPUT_DEVICE", lookup("VC_AUDIO_INPUT_DEVICE"))? {
            self.input_device = Some(v);
        }
        if let Some(v) = parse("VC_AUDIO_OUTPUT_DEVICE", lookup("VC_AUDIO_OUTPUT_DEVICE"))? {
            self.output_device = Some(v);
        }
        if let Some(v) = parse("VC_AUDIO_VAD_THRESHOLD", lookup("VC_AUDIO_VAD_THRESHOLD"))? {
            self.vad_threshold = v;
        }
        if let Some(v) = parse("VC_AUDIO_CHANNELS", lookup("VC_AUDIO_CHANNELS"))? {
            self.chat_audio_channels = v;
        }
        if let Some(v) = parse("VC_AUDIO_BIT_RATE", lookup("VC_AUDIO_BIT_RATE"))? {
            self.audio_bit_rate = v;
        }
        if let Some(v) = parse("VC_AUDIO_SAMPLE_RATE", lookup("VC_AUDIO_SAMPLE_RATE"))? {
            self.sample_rate = v;
        }
        if let Some(v) = parse("VC_AUDIO_FRAME_MS", lookup("VC_AUDIO_FRAME_MS"))? {
            self.frame_duration_ms = v;
        }
        if let Some(v) = parse("VC_AUDIO_POLL_MS", lookup("VC_AUDIO_POLL_MS"))? {
            self.capture_poll_interval_ms = v;
        }
        if let Some(v) = parse("VC_AUDIO_VAD_HOLD_MS", lookup("VC_AUDIO_VAD_HOLD_MS"))? {
            self.vad_hold_ms = v;
        }
        Ok(self.validated())
    }

    /// Frame format calls are transmitted with
    pub const fn frame_format(&self) -> FrameFormat {
        FrameFormat::new(
            self.sample_rate,
            self.frame_duration_ms,
            self.chat_audio_channels,
        )
    }

    pub const fn capture_poll_interval(&self) -> Duration {
        Duration::from_millis(self.capture_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AudioSettings::default();
        assert_eq!(settings.frame_format(), FrameFormat::new(48000, 20, 2));
        assert_eq!(settings.audio_bit_rate, 64);
        assert_eq!(settings.capture_poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_validated_clamps_ranges() {
        let settings = AudioSettings {
            vad_threshold: -4.0,
            chat_audio_channels: 6,
            audio_bit_rate: 10_000,
            sample_rate: 44100,
            frame_duration_ms: 15,
            capture_poll_interval_ms: 0,
            ..AudioSettings::default()
        }
        .validated();

        assert_eq!(settings.vad_threshold, 0.0);
        assert_eq!(settings.chat_audio_channels, 2);
        assert_eq!(settings.audio_bit_rate, MAX_AUDIO_BIT_RATE);
        assert_eq!(settings.sample_rate, 48000);
        assert_eq!(settings.frame_duration_ms, 20);
        assert_eq!(settings.capture_poll_interval_ms, 1);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AudioSettings::load(&dir.path().join("audio.json"));
        assert_eq!(settings, AudioSettings::default());
    }

    #[test]
    fn test_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(AudioSettings::load(&path), AudioSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.json");
        std::fs::write(&path, r#"{ "vad_threshold": 12.5, "input_device": 1 }"#).unwrap();

        let settings = AudioSettings::load(&path);
        assert_eq!(settings.vad_threshold, 12.5);
        assert_eq!(settings.input_device, Some(1));
        assert_eq!(settings.audio_bit_rate, DEFAULT_AUDIO_BIT_RATE);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audio.json");
        let settings = AudioSettings {
            output_device: Some(2),
            chat_audio_channels: 1,
            ..AudioSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(AudioSettings::load(&path), settings);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VC_AUDIO_BIT_RATE", "32"),
            ("VC_AUDIO_CHANNELS", " 1 "),
            ("VC_AUDIO_INPUT_DEVICE", "3"),
        ]
        .into_iter()
        .collect();

        let settings = AudioSettings::default()
            .with_overrides(|key| vars.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(settings.audio_bit_rate, 32);
        assert_eq!(settings.chat_audio_channels, 1);
        assert_eq!(settings.input_device, Some(3));
        assert_eq!(settings.output_device, None);
    }

    #[test]
    fn test_invalid_override_is_an_error() {
        let err = AudioSettings::default()
            .with_overrides(|key| (key == "VC_AUDIO_SAMPLE_RATE").then(|| "fast".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("VC_AUDIO_SAMPLE_RATE"));
    }
}
