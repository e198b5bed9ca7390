use airwave_core::station::filter_by_name;
use airwave_core::{Facet, Station, StationId};
use std::collections::HashSet;
use std::fmt::Write;

/// The station list currently on screen.
///
/// Whatever is visible here is the navigation context handed to the session
/// when the user plays a station from it.
#[derive(Debug, Clone, Default)]
pub struct StationListing {
    title: String,
    all: Vec<Station>,
    visible: Vec<Station>,
    query: Option<String>,
}

impl StationListing {
    /// Replace the listing and clear any name filter
    pub fn show(&mut self, title: impl Into<String>, stations: Vec<Station>) {
        self.title = title.into();
        self.visible.clone_from(&stations);
        self.all = stations;
        self.query = None;
    }

    /// Narrow the listing by station name; an empty query restores it
    pub fn filter(&mut self, query: &str) {
        let query = query.trim();
        if query.is_empty() {
            self.query = None;
            self.visible.clone_from(&self.all);
        } else {
            self.query = Some(query.to_string());
            self.visible = filter_by_name(&self.all, query);
        }
    }

    pub fn stations(&self) -> &[Station] {
        &self.visible
    }

    /// Station by its 1-based number on screen
    pub fn station_at(&self, number: usize) -> Option<&Station> {
        number.checked_sub(1).and_then(|i| self.visible.get(i))
    }

    /// Text rendering with the current station and favorites marked
    pub fn render(&self, current: Option<&StationId>, favorites: &HashSet<StationId>) -> String {
        let mut out = String::new();
        let heading = match &self.query {
            Some(query) => format!("{} (filter: {query})", self.title),
            None => self.title.clone(),
        };
        let _ = writeln!(out, "{heading} - {} stations", self.visible.len());

        if self.visible.is_empty() {
            out.push_str("  No stations found");
            return out;
        }

        let width = self.visible.len().to_string().len();
        for (i, station) in self.visible.iter().enumerate() {
            let playing = if current == Some(&station.id) { '>' } else { ' ' };
            let favorite = if favorites.contains(&station.id) { '*' } else { ' ' };
            let _ = writeln!(out, "{playing}{favorite}{:>width$}. {station}", i + 1);
        }
        out.truncate(out.trim_end().len());
        out
    }
}

/// Render a facet list, optionally filtered by name
pub fn render_facets(title: &str, facets: &[Facet]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{title} - {}", facets.len());
    for facet in facets {
        match &facet.iso_3166_1 {
            Some(code) => {
                let _ = writeln!(out, "  {} [{code}] ({})", facet.name, facet.stationcount);
            }
            None => {
                let _ = writeln!(out, "  {} ({})", facet.name, facet.stationcount);
            }
        }
    }
    out.truncate(out.trim_end().len());
    out
}
