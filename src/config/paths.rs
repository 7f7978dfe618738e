//! Cross-platform application paths using the `dirs` crate.
//!
//! Config dir (settings):
//!   Windows: %APPDATA%\voice-live\
//!   macOS:   ~/Library/Application Support/voice-live/
//!   Linux:   ~/.config/voice-live/

use std::path::{Path, PathBuf};

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory holding `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "voice-live";
    const SETTINGS_FILE: &'static str = "settings.toml";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::under(&base)
    }

    /// Resolve the layout below an explicit base directory.
    pub fn under(base: &Path) -> Self {
        let config_dir = base.join(Self::APP_NAME);
        let settings_file = config_dir.join(Self::SETTINGS_FILE);
        Self {
            config_dir,
            settings_file,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
