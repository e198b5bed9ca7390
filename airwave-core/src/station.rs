//! Station records as served by the station directory.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque station identifier (`stationuuid` in the directory API).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A playable internet radio station.
///
/// Field names follow the directory's JSON shape so that lists fetched from
/// the directory and lists persisted in the library share one encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    #[serde(rename = "stationuuid")]
    pub id: StationId,
    pub name: String,
    /// Stream locator
    #[serde(rename = "url")]
    pub stream_url: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub language: String,
    /// Region within the country, when the directory knows it
    #[serde(default)]
    pub state: String,
    /// Icon/artwork reference
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub favicon: Option<String>,
    #[serde(default)]
    pub votes: u64,
    #[serde(default)]
    pub tags: String,
}

impl Station {
    /// Create a station with only the identity and stream locator filled in
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        stream_url: impl Into<String>,
    ) -> Self {
        Self {
            id: StationId::new(id),
            name: name.into(),
            stream_url: stream_url.into(),
            country: String::new(),
            language: String::new(),
            state: String::new(),
            favicon: None,
            votes: 0,
            tags: String::new(),
        }
    }

    #[must_use]
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    #[must_use]
    pub const fn with_votes(mut self, votes: u64) -> Self {
        self.votes = votes;
        self
    }

    /// Check whether two records refer to the same station
    #[must_use]
    pub fn same_station(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.country.is_empty(), self.language.is_empty()) {
            (true, true) => f.write_str(&self.name),
            (false, true) => write!(f, "{} ({})", self.name, self.country),
            (true, false) => write!(f, "{} ({})", self.name, self.language),
            (false, false) => write!(f, "{} ({} - {})", self.name, self.country, self.language),
        }
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Index of `station` in `list`, matched by identifier.
///
/// When a list carries duplicate identifiers the first occurrence wins.
#[must_use]
pub fn position_in(list: &[Station], station: &Station) -> Option<usize> {
    list.iter().position(|s| s.same_station(station))
}

/// Case-insensitive substring filter on station names.
#[must_use]
pub fn filter_by_name(stations: &[Station], query: &str) -> Vec<Station> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return stations.to_vec();
    }
    stations
        .iter()
        .filter(|s| s.name.to_lowercase().contains(&query))
        .cloned()
        .collect()
}

/// A directory facet (country, language or tag) with its station count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub name: String,
    #[serde(default)]
    pub stationcount: u64,
    /// ISO 3166-1 code, only present for countries
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub iso_3166_1: Option<String>,
}

pub type Country = Facet;
pub type Language = Facet;
pub type Tag = Facet;

/// Sort facets by station count (descending) and drop unnamed entries.
#[must_use]
pub fn rank_facets(mut facets: Vec<Facet>) -> Vec<Facet> {
    facets.retain(|f| !f.name.trim().is_empty());
    facets.sort_by(|a, b| b.stationcount.cmp(&a.stationcount));
    facets
}

/// Case-insensitive substring filter on facet names.
#[must_use]
pub fn filter_facets(facets: &[Facet], query: &str) -> Vec<Facet> {
    let query = query.trim().to_lowercase();
    facets
        .iter()
        .filter(|f| !f.name.is_empty() && f.name.to_lowercase().contains(&query))
        .cloned()
        .collect()
}
