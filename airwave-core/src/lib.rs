pub mod audio;
pub mod config;
pub mod directory;
pub mod error;
pub mod library;
pub mod paths;
pub mod session;
pub mod station;
pub mod time;

pub use audio::{
    AudioBackend, AudioMode, BackendError, Generation, StreamEvent, StreamEventSender,
    StreamHandle, StreamStatus,
};
pub use config::{
    AirwaveConfig, DirectoryConfig, LibraryConfig, LoggingConfig, PlaybackConfig, PlayerConfig,
    CONFIG_TEMPLATE,
};

/// Re-export toml error type for config parsing error handling
pub use toml::de::Error as TomlParseError;
pub use directory::{StationDirectory, StationFilter};
pub use error::{CoreError, Result};
pub use library::StationLibrary;
pub use paths::{
    config_dir, library_db_path, log_file_path, CONFIG_DIR_NAME, CONFIG_FILE_NAME,
    LIBRARY_DB_FILE_NAME, LOG_FILE_NAME,
};
pub use session::{
    Direction, Notice, NoticeSeverity, PlaybackPhase, PlaybackSession, SelectOutcome,
    SessionError, SessionEvent, SessionSnapshot,
};
pub use station::{Country, Facet, Language, Station, StationId, Tag};
pub use time::DurationExt;
