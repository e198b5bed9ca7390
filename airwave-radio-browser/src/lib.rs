use airwave_core::directory::{truncate, StationDirectory, StationFilter};
use airwave_core::station::rank_facets;
use airwave_core::{Country, CoreError, DirectoryConfig, Facet, Language, Station, Tag};
use async_trait::async_trait;
use const_format::concatcp;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const LOG_TARGET: &str = "airwave::radio_browser";

const USER_AGENT: &str = concatcp!("Airwave/", env!("CARGO_PKG_VERSION"));

/// Connect timeout for HTTP requests (5 seconds)
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// radio-browser.info station directory
pub struct RadioBrowserClient {
    client: ClientWithMiddleware,
    base_url: String,
    max_results: Option<usize>,
}

impl RadioBrowserClient {
    /// Create a client for the public mirror with default timeout and retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self, CoreError> {
        Self::from_config(&DirectoryConfig::default())
    }

    /// Create a client from the `[directory]` config section.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is not an absolute http(s) URL or the
    /// HTTP client cannot be created.
    pub fn from_config(config: &DirectoryConfig) -> Result<Self, CoreError> {
        let base_url = normalize_base_url(&config.base_url)?;

        // Base client with timeout
        let base_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        // Wrap with retry middleware (exponential backoff)
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(config.max_retries);
        let client = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        info!(target: LOG_TARGET, "Using station directory at {}", base_url);
        Ok(Self {
            client,
            base_url,
            max_results: config.max_results,
        })
    }

    /// Absolute URL for a station listing
    #[must_use]
    pub fn stations_url(&self, filter: &StationFilter) -> String {
        stations_url(&self.base_url, filter)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CoreError> {
        debug!(target: LOG_TARGET, "GET {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        debug!(target: LOG_TARGET, "Response status: {}", status);

        if !status.is_success() {
            warn!(target: LOG_TARGET, "Directory returned status {} for {}", status, url);
            return Err(CoreError::Directory {
                reason: format!("radio-browser returned status: {status}"),
            });
        }

        Ok(response.json().await?)
    }

    async fn facets(&self, endpoint: &str) -> Result<Vec<Facet>, CoreError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        self.get_json(&url).await
    }
}

#[async_trait]
impl StationDirectory for RadioBrowserClient {
    fn name(&self) -> &'static str {
        "radio-browser"
    }

    async fn stations(&self, filter: &StationFilter) -> Result<Vec<Station>, CoreError> {
        info!(target: LOG_TARGET, "Fetching stations ({})", filter);

        let url = self.stations_url(filter);
        let stations: Vec<Station> = self.get_json(&url).await?;
        let total = stations.len();
        let stations = truncate(stations, self.max_results);

        info!(
            target: LOG_TARGET,
            "Fetched {} stations ({} kept) for {}", total, stations.len(), filter
        );
        Ok(stations)
    }

    async fn countries(&self) -> Result<Vec<Country>, CoreError> {
        let mut countries = self.facets("countries").await?;
        countries.retain(|c| !c.name.trim().is_empty());
        debug!(target: LOG_TARGET, "Fetched {} countries", countries.len());
        Ok(countries)
    }

    async fn languages(&self) -> Result<Vec<Language>, CoreError> {
        let languages = rank_facets(self.facets("languages").await?);
        debug!(target: LOG_TARGET, "Fetched {} languages", languages.len());
        Ok(languages)
    }

    async fn tags(&self) -> Result<Vec<Tag>, CoreError> {
        let tags = rank_facets(self.facets("tags").await?);
        debug!(target: LOG_TARGET, "Fetched {} tags", tags.len());
        Ok(tags)
    }
}

fn normalize_base_url(raw: &str) -> Result<String, CoreError> {
    let parsed = Url::parse(raw.trim()).map_err(|e| CoreError::ConfigInvalid {
        message: format!("directory.base_url {raw:?} is not a valid URL: {e}"),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CoreError::ConfigInvalid {
            message: format!("directory.base_url must use http or https, got {}", parsed.scheme()),
        });
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn stations_url(base_url: &str, filter: &StationFilter) -> String {
    let value = urlencoding::encode(filter.value());
    match filter {
        StationFilter::Country(_) => format!("{base_url}/stations/bycountry/{value}"),
        StationFilter::Language(_) => format!("{base_url}/stations/bylanguage/{value}"),
        StationFilter::Tag(_) => format!("{base_url}/stations/bytag/{value}"),
        StationFilter::Search(_) => format!("{base_url}/stations/search?name={value}"),
    }
}
