use crate::error::Result;
use crate::station::{Station, StationId};
use chrono::Utc;
use rusqlite::OptionalExtension;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "airwave::library";

/// Storage key for the favorites list
pub const FAVORITES_KEY: &str = "favoriteStations";

/// Storage key for the recently played list
pub const RECENTS_KEY: &str = "recentStations";

/// Default number of recently played stations kept
pub const DEFAULT_RECENTS_CAPACITY: usize = 100;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// SQLite-backed favorites and recently played lists
pub struct StationLibrary {
    conn: Connection,
    recents_capacity: usize,
}

impl StationLibrary {
    /// Open the library at the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or opened.
    pub async fn new(recents_capacity: usize) -> Result<Self> {
        let path = crate::paths::library_db_path();
        Self::open(&path, recents_capacity).await
    }

    /// Open a library at a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(path: &Path, recents_capacity: usize) -> Result<Self> {
        info!(target: LOG_TARGET, "Opening station library at {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            Ok(())
        })
        .await?;

        Ok(Self::with_connection(conn, recents_capacity))
    }

    /// Open a library that lives only as long as the returned value
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub async fn open_in_memory(recents_capacity: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .await?;

        Ok(Self::with_connection(conn, recents_capacity))
    }

    fn with_connection(conn: Connection, recents_capacity: usize) -> Self {
        Self {
            conn,
            recents_capacity: recents_capacity.max(1),
        }
    }

    /// Favorite stations in the order they were added
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn favorites(&self) -> Result<Vec<Station>> {
        self.load_list(FAVORITES_KEY).await
    }

    /// Replace the favorites list
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be encoded or stored.
    pub async fn save_favorites(&self, stations: &[Station]) -> Result<()> {
        self.store_list(FAVORITES_KEY, stations).await
    }

    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn is_favorite(&self, id: &StationId) -> Result<bool> {
        Ok(self.favorites().await?.iter().any(|s| &s.id == id))
    }

    /// Add `station` to favorites, or remove it if already present.
    ///
    /// Returns whether the station is a favorite afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the favorites cannot be read or stored.
    pub async fn toggle_favorite(&self, station: &Station) -> Result<bool> {
        let mut favorites = self.favorites().await?;
        let was_favorite = favorites.iter().any(|s| s.same_station(station));

        if was_favorite {
            favorites.retain(|s| !s.same_station(station));
            info!(target: LOG_TARGET, "Removed {} from favorites", station.name);
        } else {
            favorites.push(station.clone());
            info!(target: LOG_TARGET, "Added {} to favorites", station.name);
        }

        self.save_favorites(&favorites).await?;
        Ok(!was_favorite)
    }

    /// Recently played stations, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn recents(&self) -> Result<Vec<Station>> {
        self.load_list(RECENTS_KEY).await
    }

    /// Record `station` as the most recently played
    ///
    /// # Errors
    ///
    /// Returns an error if the recents cannot be read or stored.
    pub async fn add_recent(&self, station: &Station) -> Result<()> {
        let mut recents = self.recents().await?;
        recents.retain(|s| !s.same_station(station));
        recents.insert(0, station.clone());
        recents.truncate(self.recents_capacity);

        debug!(target: LOG_TARGET, "Recorded recent station {} ({} kept)", station.name, recents.len());
        self.store_list(RECENTS_KEY, &recents).await
    }

    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub async fn clear_recents(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![RECENTS_KEY])?;
                Ok(())
            })
            .await?;
        info!(target: LOG_TARGET, "Cleared recently played stations");
        Ok(())
    }

    async fn load_list(&self, key: &'static str) -> Result<Vec<Station>> {
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM kv WHERE key = ?1",
                        rusqlite::params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;

        let Some(raw) = raw else {
            return Ok(Vec::new());
        };

        match serde_json::from_str(&raw) {
            Ok(stations) => Ok(stations),
            Err(e) => {
                warn!(target: LOG_TARGET, "Discarding unreadable {} entry: {}", key, e);
                Ok(Vec::new())
            }
        }
    }

    async fn store_list(&self, key: &'static str, stations: &[Station]) -> Result<()> {
        let value = serde_json::to_string(stations)?;
        let now = Utc::now().timestamp();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r"
                    INSERT INTO kv (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                ",
                    rusqlite::params![key, value, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Checkpoint WAL for clean shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the WAL checkpoint fails.
    pub async fn checkpoint(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }
}
