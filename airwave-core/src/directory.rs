//! Station directory seam.
//!
//! The directory is where station lists come from. The session never talks
//! to it; screens fetch a list here and hand it to the session as the
//! navigation context of a selection.

use crate::error::Result;
use crate::station::{Country, Language, Station, Tag};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;

/// Which slice of the directory to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationFilter {
    Country(String),
    Language(String),
    Tag(String),
    /// Free-text search on station names
    Search(String),
}

impl StationFilter {
    /// The filter's value as entered by the user
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Country(v) | Self::Language(v) | Self::Tag(v) | Self::Search(v) => v,
        }
    }

    /// Short label for logs and headings
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Country(_) => "country",
            Self::Language(_) => "language",
            Self::Tag(_) => "tag",
            Self::Search(_) => "search",
        }
    }
}

impl fmt::Display for StationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.value())
    }
}

/// Source of station lists and the facets used to browse them
#[async_trait]
pub trait StationDirectory: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// List stations matching `filter`
    async fn stations(&self, filter: &StationFilter) -> Result<Vec<Station>>;

    /// All countries, as served by the directory
    async fn countries(&self) -> Result<Vec<Country>>;

    /// Languages ranked by station count
    async fn languages(&self) -> Result<Vec<Language>>;

    /// Tags ranked by station count
    async fn tags(&self) -> Result<Vec<Tag>>;

    /// Stations near the listener.
    ///
    /// Starts from the country's stations, keeps only those in `state` when
    /// any match, then adds stations in the language of the first result.
    async fn nearby(&self, country: &str, state: Option<&str>) -> Result<Vec<Station>> {
        let in_country = self
            .stations(&StationFilter::Country(country.to_string()))
            .await?;
        let local = narrow_to_state(in_country, state);

        let language = local
            .first()
            .map(|s| s.language.clone())
            .filter(|l| !l.trim().is_empty());

        let same_language = match language {
            Some(language) => self.stations(&StationFilter::Language(language)).await?,
            None => Vec::new(),
        };

        Ok(merge_nearby(local, same_language))
    }
}

/// Keep stations in `state` when at least one matches, otherwise keep all.
#[must_use]
pub fn narrow_to_state(stations: Vec<Station>, state: Option<&str>) -> Vec<Station> {
    let Some(state) = state.map(str::trim).filter(|s| !s.is_empty()) else {
        return stations;
    };

    let in_state: Vec<Station> = stations
        .iter()
        .filter(|s| s.state.eq_ignore_ascii_case(state))
        .cloned()
        .collect();

    if in_state.is_empty() {
        stations
    } else {
        in_state
    }
}

/// Concatenate, de-duplicate by id (first wins) and sort by votes descending.
#[must_use]
pub fn merge_nearby(local: Vec<Station>, extra: Vec<Station>) -> Vec<Station> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Station> = local
        .into_iter()
        .chain(extra)
        .filter(|s| seen.insert(s.id.clone()))
        .collect();
    merged.sort_by(|a, b| b.votes.cmp(&a.votes));
    merged
}

/// Apply the optional client-side result cap
#[must_use]
pub fn truncate(mut stations: Vec<Station>, max_results: Option<usize>) -> Vec<Station> {
    if let Some(max) = max_results {
        stations.truncate(max);
    }
    stations
}
