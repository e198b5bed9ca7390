use airwave_core::StationFilter;
use std::str::FromStr;
use thiserror::Error;

/// Which facet list to show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetKind {
    Countries,
    Languages,
    Tags,
}

impl FacetKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Countries => "countries",
            Self::Languages => "languages",
            Self::Tags => "tags",
        }
    }
}

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Facets {
        kind: FacetKind,
        filter: Option<String>,
    },
    Browse(StationFilter),
    Nearby {
        country: String,
        state: Option<String>,
    },
    /// Narrow the current listing by station name; empty clears
    Filter(String),
    List,
    /// 1-based index into the current listing
    Play(usize),
    Toggle,
    Next,
    Prev,
    /// Toggle a favorite: the listed station at the index, or the current station
    Favorite(Option<usize>),
    Favorites,
    Recents,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Type a command, or 'help' for a list")]
    Empty,

    #[error("Unknown command '{0}', type 'help' for a list")]
    Unknown(String),

    #[error("'{command}' needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("'{0}' is not a station number")]
    InvalidNumber(String),
}

pub const HELP: &str = "\
Browse
  countries [filter]           list countries
  languages [filter]           list languages by station count
  tags [filter]                list tags by station count
  country <name>               stations in a country
  language <name>              stations in a language
  tag <name>                   stations with a tag
  search <query>               stations whose name matches
  nearby <country>[, <state>]  popular stations near you
  filter <text>                narrow the current list (no text clears)
  list                         show the current list again

Playback
  play <n>                     play station n from the list (again to pause/resume)
  toggle                       pause or resume
  next | prev                  move through the list the station was picked from
  status                       what is playing

Library
  fav [n]                      toggle favorite for station n or the current one
  favorites                    list favorites
  recents                      list recently played

  help                         show this help
  quit                         stop playback and exit";

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(w, r)| (w, r.trim()));
        let arg = (!rest.is_empty()).then(|| rest.to_string());

        match word.to_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            "countries" => Ok(Self::Facets { kind: FacetKind::Countries, filter: arg }),
            "languages" => Ok(Self::Facets { kind: FacetKind::Languages, filter: arg }),
            "tags" => Ok(Self::Facets { kind: FacetKind::Tags, filter: arg }),
            "country" => required(arg, "country", "a country name")
                .map(|v| Self::Browse(StationFilter::Country(v))),
            "language" => required(arg, "language", "a language name")
                .map(|v| Self::Browse(StationFilter::Language(v))),
            "tag" => required(arg, "tag", "a tag name").map(|v| Self::Browse(StationFilter::Tag(v))),
            "search" | "find" => {
                required(arg, "search", "a search query").map(|v| Self::Browse(StationFilter::Search(v)))
            }
            "nearby" => {
                let value = required(arg, "nearby", "a country name")?;
                let (country, state) = match value.split_once(',') {
                    Some((country, state)) => {
                        let state = state.trim();
                        (country.trim().to_string(), (!state.is_empty()).then(|| state.to_string()))
                    }
                    None => (value, None),
                };
                Ok(Self::Nearby { country, state })
            }
            "filter" => Ok(Self::Filter(rest.to_string())),
            "list" | "ls" => Ok(Self::List),
            "play" | "p" => {
                let value = required(arg, "play", "a station number")?;
                station_number(&value).map(Self::Play)
            }
            "toggle" | "pause" | "resume" => Ok(Self::Toggle),
            "next" | "n" => Ok(Self::Next),
            "prev" | "previous" => Ok(Self::Prev),
            "fav" => arg
                .as_deref()
                .map(station_number)
                .transpose()
                .map(Self::Favorite),
            "favorites" | "favs" => Ok(Self::Favorites),
            "recents" | "recent" => Ok(Self::Recents),
            "status" => Ok(Self::Status),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn required(
    arg: Option<String>,
    command: &'static str,
    argument: &'static str,
) -> Result<String, CommandError> {
    arg.ok_or(CommandError::MissingArgument { command, argument })
}

fn station_number(value: &str) -> Result<usize, CommandError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(CommandError::InvalidNumber(value.trim().to_string())),
    }
}
