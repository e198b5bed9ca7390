use crate::commands::{Command, FacetKind, HELP};
use crate::screen::{render_facets, StationListing};
use airwave_core::station::filter_facets;
use airwave_core::{
    CoreError, Direction, Facet, PlaybackPhase, PlaybackSession, SelectOutcome, SessionError,
    StationDirectory, StationFilter, StationId, StationLibrary,
};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, error, warn};

const LOG_TARGET: &str = "airwave::app";

/// Terminal front end state: what is listed, and the services behind it
pub struct App {
    session: Arc<PlaybackSession>,
    directory: Arc<dyn StationDirectory>,
    library: StationLibrary,
    listing: StationListing,
}

impl App {
    pub fn new(
        session: Arc<PlaybackSession>,
        directory: Arc<dyn StationDirectory>,
        library: StationLibrary,
    ) -> Self {
        Self {
            session,
            directory,
            library,
            listing: StationListing::default(),
        }
    }

    pub const fn library(&self) -> &StationLibrary {
        &self.library
    }

    /// Run one command and print its result
    pub async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        debug!(target: LOG_TARGET, "Command: {:?}", command);

        let result = match command {
            Command::Quit => return ControlFlow::Break(()),
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Facets { kind, filter } => self.show_facets(kind, filter.as_deref()).await,
            Command::Browse(filter) => self.browse(&filter).await,
            Command::Nearby { country, state } => self.nearby(&country, state.as_deref()).await,
            Command::Filter(query) => {
                self.listing.filter(&query);
                self.print_listing().await
            }
            Command::List => self.print_listing().await,
            Command::Play(number) => {
                self.play(number).await;
                Ok(())
            }
            Command::Toggle => {
                self.toggle().await;
                Ok(())
            }
            Command::Next => {
                self.switch(Direction::Next).await;
                Ok(())
            }
            Command::Prev => {
                self.switch(Direction::Previous).await;
                Ok(())
            }
            Command::Favorite(number) => self.toggle_favorite(number).await,
            Command::Favorites => self.show_favorites().await,
            Command::Recents => self.show_recents().await,
            Command::Status => {
                self.print_status();
                Ok(())
            }
        };

        if let Err(e) = result {
            report(&e);
        }
        ControlFlow::Continue(())
    }

    async fn show_facets(&self, kind: FacetKind, filter: Option<&str>) -> Result<(), CoreError> {
        let facets: Vec<Facet> = match kind {
            FacetKind::Countries => self.directory.countries().await?,
            FacetKind::Languages => self.directory.languages().await?,
            FacetKind::Tags => self.directory.tags().await?,
        };
        let facets = match filter {
            Some(query) => filter_facets(&facets, query),
            None => facets,
        };
        println!("{}", render_facets(kind.as_str(), &facets));
        Ok(())
    }

    async fn browse(&mut self, filter: &StationFilter) -> Result<(), CoreError> {
        let stations = self.directory.stations(filter).await?;
        self.listing.show(filter.to_string(), stations);
        self.print_listing().await
    }

    async fn nearby(&mut self, country: &str, state: Option<&str>) -> Result<(), CoreError> {
        let stations = self.directory.nearby(country, state).await?;
        let title = match state {
            Some(state) => format!("nearby: {state}, {country}"),
            None => format!("nearby: {country}"),
        };
        self.listing.show(title, stations);
        self.print_listing().await
    }

    async fn show_favorites(&mut self) -> Result<(), CoreError> {
        let stations = self.library.favorites().await?;
        self.listing.show("favorites", stations);
        self.print_listing().await
    }

    async fn show_recents(&mut self) -> Result<(), CoreError> {
        let stations = self.library.recents().await?;
        self.listing.show("recently played", stations);
        self.print_listing().await
    }

    async fn play(&self, number: usize) {
        let Some(station) = self.listing.station_at(number).cloned() else {
            println!("No station {number} in the current list");
            return;
        };
        let outcome = self
            .session
            .select(station, self.listing.stations().to_vec())
            .await;
        self.after_select(outcome).await;
    }

    async fn switch(&self, direction: Direction) {
        let outcome = self
            .session
            .switch(direction, self.listing.stations().to_vec())
            .await;
        self.after_select(outcome).await;
    }

    async fn after_select(&self, outcome: Result<SelectOutcome, SessionError>) {
        match outcome {
            Ok(SelectOutcome::Started(station)) => {
                println!("Tuning in to {station}...");
                if let Err(e) = self.library.add_recent(&station).await {
                    warn!(target: LOG_TARGET, "Failed to record recent station: {}", e);
                }
            }
            Ok(SelectOutcome::Paused) => println!("Paused"),
            Ok(SelectOutcome::Resumed) => println!("Playing"),
            Err(SessionError::RedundantTransitionDropped) => {
                debug!(target: LOG_TARGET, "Selection ignored, a transition is already running");
            }
            // Notices for the rest are printed by the session event listener
            Err(e) => debug!(target: LOG_TARGET, "Selection failed: {}", e),
        }
    }

    async fn toggle(&self) {
        match self.session.toggle_play_pause().await {
            Ok(Some(PlaybackPhase::Paused)) => println!("Paused"),
            Ok(Some(_)) => println!("Playing"),
            Ok(None) => println!("Nothing to pause or resume"),
            Err(e) => debug!(target: LOG_TARGET, "Play/pause failed: {}", e),
        }
    }

    async fn toggle_favorite(&self, number: Option<usize>) -> Result<(), CoreError> {
        let station = match number {
            Some(n) => self.listing.station_at(n).cloned(),
            None => self.session.current_station(),
        };
        let Some(station) = station else {
            println!("No station to add to favorites");
            return Ok(());
        };

        if self.library.toggle_favorite(&station).await? {
            println!("Added {} to favorites", station.name);
        } else {
            println!("Removed {} from favorites", station.name);
        }
        Ok(())
    }

    async fn print_listing(&self) -> Result<(), CoreError> {
        let favorites: HashSet<StationId> = self
            .library
            .favorites()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let current = self.session.current_station().map(|s| s.id);
        println!("{}", self.listing.render(current.as_ref(), &favorites));
        Ok(())
    }

    fn print_status(&self) {
        let snapshot = self.session.snapshot();
        match snapshot.station {
            Some(station) if snapshot.is_buffering => {
                println!("{} - {} (buffering)", station, snapshot.phase);
            }
            Some(station) => println!("{} - {}", station, snapshot.phase),
            None => println!("Nothing playing"),
        }
    }
}

fn report(e: &CoreError) {
    error!(target: LOG_TARGET, "{}", e);
    match e {
        CoreError::Network(_) | CoreError::Middleware(_) | CoreError::Directory { .. } => {
            println!("Could not reach the station directory. Please try again.");
        }
        _ => println!("Something went wrong: {e}"),
    }
}
