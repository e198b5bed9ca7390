use crate::audio::AudioMode;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AirwaveConfig {
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of the radio-browser JSON API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Client-side cap on the number of stations kept per listing
    #[serde(default)]
    pub max_results: Option<usize>,
}

fn default_base_url() -> String {
    "https://de1.api.radio-browser.info/json".into()
}

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_max_retries() -> u32 {
    3
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            max_results: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// How long a new stream may take to report ready before it is failed
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
    #[serde(default)]
    pub audio: AudioMode,
}

const fn default_ready_timeout() -> u64 {
    15_000
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout(),
            audio: AudioMode::default(),
        }
    }
}

impl PlaybackConfig {
    #[must_use]
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// External player executable used by the terminal front end
    #[serde(default = "default_player_command")]
    pub command: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_player_command() -> String {
    "mpv".into()
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            command: default_player_command(),
            extra_args: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    #[serde(default = "default_recents_capacity")]
    pub recents_capacity: usize,
}

const fn default_recents_capacity() -> usize {
    100
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            recents_capacity: default_recents_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to the cache directory
    #[serde(default)]
    pub enabled: bool,
}

impl AirwaveConfig {
    /// Get the config file path (~/.config/airwave/config.toml)
    #[must_use]
    pub fn config_path() -> PathBuf {
        crate::paths::config_path()
    }

    /// Load config from file or create template on first run
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, if it
    /// fails validation, or if it did not exist (a template is written first).
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(&config_path, CONFIG_TEMPLATE)?;

            return Err(CoreError::ConfigNotFound { path: config_path });
        }

        let content = fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the rest of the application cannot work with
    ///
    /// # Errors
    ///
    /// Returns the first invalid or missing field.
    pub fn validate(&self) -> Result<()> {
        if self.directory.base_url.trim().is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "directory.base_url".into(),
            });
        }
        if self.player.command.trim().is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "player.command".into(),
            });
        }
        if self.playback.ready_timeout_ms == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "playback.ready_timeout_ms must be greater than zero".into(),
            });
        }
        if self.library.recents_capacity == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "library.recents_capacity must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

pub const CONFIG_TEMPLATE: &str = r#"# Airwave Configuration
# ~/.config/airwave/config.toml

[directory]
# Any radio-browser mirror works here
base_url = "https://de1.api.radio-browser.info/json"
timeout_secs = 10
max_retries = 3
# Keep at most this many stations per listing
# max_results = 500

[playback]
# Give up on a station that has not started playing after this long
ready_timeout_ms = 15000

[playback.audio]
stays_active_in_background = true
plays_in_silent_mode = true
duck_others = true
play_through_earpiece = false

[player]
# Player used by the terminal front end (must support --input-ipc-server)
command = "mpv"
extra_args = []

[library]
# Number of recently played stations to remember
recents_capacity = 100

[logging]
# Also write logs to ~/.cache/airwave/airwave.log
enabled = false
"#;
