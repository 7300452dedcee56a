//! Cross-platform configuration paths using the `dirs` crate.
//!
//! Layout:
//!
//!   Windows: %APPDATA%\pcm-capture\settings.toml
//!   macOS:   ~/Library/Application Support/pcm-capture/settings.toml
//!   Linux:   ~/.config/pcm-capture/settings.toml

use std::path::PathBuf;

/// Resolved configuration directory and file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory holding `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "pcm-capture";

    /// Resolves all paths using the `dirs` crate, falling back to the current
    /// directory when the platform has no config directory.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);
        let settings_file = config_dir.join("settings.toml");

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
