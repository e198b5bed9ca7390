//! Path constants for configuration, library and log files.

use std::path::PathBuf;

/// The name of the configuration directory under ~/.config/
pub const CONFIG_DIR_NAME: &str = "airwave";

/// The name of the main configuration file
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// The name of the favorites/recents database file
pub const LIBRARY_DB_FILE_NAME: &str = "library.db";

/// The name of the log file written when file logging is enabled
pub const LOG_FILE_NAME: &str = "airwave.log";

/// Get the configuration directory path (~/.config/airwave/)
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(CONFIG_DIR_NAME)
}

/// Get the config file path (~/.config/airwave/config.toml)
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

/// Get the library database path (`~/.config/airwave/library.db`)
#[must_use]
pub fn library_db_path() -> PathBuf {
    config_dir().join(LIBRARY_DB_FILE_NAME)
}

/// Get the log file path (`~/.cache/airwave/airwave.log`)
#[must_use]
pub fn log_file_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_DIR_NAME)
        .join(LOG_FILE_NAME)
}
