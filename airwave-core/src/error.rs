use crate::session::SessionError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Config file not found at {path}. A template has been created - please review it and restart.")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid config: {message}")]
    ConfigInvalid { message: String },

    #[error("Missing required config field: {field}")]
    ConfigMissingField { field: String },

    #[error("Failed to parse config file: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    // Device permission errors (raised by front ends, e.g. location lookups)
    #[error("Permission denied: {permission}")]
    PermissionDenied { permission: String },

    // Station directory errors
    #[error("Station directory request failed: {reason}")]
    Directory { reason: String },

    // Playback session errors
    #[error(transparent)]
    Session(#[from] SessionError),

    // Library errors
    #[error("Library database error: {0}")]
    Library(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Network errors
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Network middleware failed: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
