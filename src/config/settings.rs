//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Every section is `#[serde(default)]`, so a partial `settings.toml` only
//! overrides the keys it names.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Settings sent to the remote speech service in the setup message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model identifier, including the `models/` prefix.
    pub model: String,
    /// Prebuilt voice used for synthesized replies (e.g. `"Zephyr"`).
    pub voice_name: String,
    /// Optional system instruction text.  `None` omits it from setup.
    pub system_instruction: Option<String>,
    /// Requested response modality.  Only `"AUDIO"` is played back.
    pub response_modality: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".into(),
            voice_name: "Zephyr".into(),
            system_instruction: None,
            response_modality: "AUDIO".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Settings for the capture and output devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name; `None` means the system default.
    pub input_device: Option<String>,
    /// Output device name; `None` means the system default.
    pub output_device: Option<String>,
    /// Samples per captured frame at the device rate.
    pub block_size: usize,
    /// Capture frames that may wait between the device callback and the
    /// session loop before new blocks are dropped.
    pub capture_queue_blocks: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            block_size: 4096,
            capture_queue_blocks: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// VisualizerConfig
// ---------------------------------------------------------------------------

/// Spectrum analyser settings for the visualizer feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    /// FFT window length in samples (power of two).  Yields `fft_size / 2`
    /// bins.
    pub fft_size: usize,
    /// Frame rate of `VisualizerFeed::subscribe`.
    pub refresh_hz: u32,
    /// Time smoothing constant (0.0 – 1.0).  Higher = slower decay.
    pub smoothing: f32,
    /// Magnitude in dB mapped to bin value 0.
    pub min_decibels: f32,
    /// Magnitude in dB mapped to bin value 1.
    pub max_decibels: f32,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            fft_size: 64,
            refresh_hz: 60,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_live::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote session setup.
    pub session: SessionConfig,
    /// Device selection and capture framing.
    pub audio: AudioConfig,
    /// Visualizer analyser settings.
    pub visualizer: VisualizerConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns `true` when no `settings.toml` file exists yet.
    pub fn is_first_run() -> bool {
        !AppPaths::new().settings_file.exists()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = AppConfig::default();
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");
        assert_eq!(original, loaded);
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn default_values() {
        let cfg = AppConfig::default();

        assert_eq!(
            cfg.session.model,
            "models/gemini-2.5-flash-native-audio-preview-09-2025"
        );
        assert_eq!(cfg.session.voice_name, "Zephyr");
        assert_eq!(cfg.session.response_modality, "AUDIO");
        assert!(cfg.session.system_instruction.is_none());
        assert_eq!(cfg.audio.block_size, 4096);
        assert_eq!(cfg.audio.capture_queue_blocks, 1);
        assert!(cfg.audio.input_device.is_none());
        assert_eq!(cfg.visualizer.fft_size, 64);
        assert_eq!(cfg.visualizer.refresh_hz, 60);
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("modified.toml");

        let mut cfg = AppConfig::default();
        cfg.session.voice_name = "Puck".into();
        cfg.session.system_instruction = Some("Answer briefly.".into());
        cfg.audio.input_device = Some("USB Microphone".into());
        cfg.audio.block_size = 2048;
        cfg.visualizer.smoothing = 0.5;

        cfg.save_to(&path).expect("save");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.session.voice_name, "Puck");
        assert_eq!(
            loaded.session.system_instruction.as_deref(),
            Some("Answer briefly.")
        );
        assert_eq!(loaded.audio.input_device.as_deref(), Some("USB Microphone"));
        assert_eq!(loaded.audio.block_size, 2048);
        assert_eq!(loaded.visualizer.smoothing, 0.5);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[audio]\nblock_size = 1024\n").expect("write");

        let loaded = AppConfig::load_from(&path).expect("load");
        assert_eq!(loaded.audio.block_size, 1024);
        assert_eq!(loaded.audio.capture_queue_blocks, 1);
        assert_eq!(loaded.session, SessionConfig::default());
    }
}
