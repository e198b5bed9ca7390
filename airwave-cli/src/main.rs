mod app;
mod commands;
#[cfg(unix)]
mod player;
mod screen;

use crate::app::App;
use crate::commands::Command;
use airwave_core::{
    AirwaveConfig, AudioBackend, CoreError, NoticeSeverity, PlaybackPhase, PlaybackSession,
    PlayerConfig, SessionEvent, StationDirectory, StationLibrary,
};
use airwave_radio_browser::RadioBrowserClient;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const APP_NAME: &str = "Airwave";

/// How long background tasks get to finish once the command loop exits
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

fn main() {
    // Check config for logging.enabled before full config load
    let file_logging_enabled = check_file_logging_enabled();
    init_tracing(file_logging_enabled);

    let config = match AirwaveConfig::load_or_create() {
        Ok(config) => config,
        Err(CoreError::ConfigNotFound { path }) => {
            println!(
                "Created a configuration file at {}. Using defaults for now.",
                path.display()
            );
            AirwaveConfig::default()
        }
        Err(CoreError::ConfigParseError(parse_error)) => {
            eprintln!(
                "Your configuration file at {} has a syntax error and cannot be loaded:\n\n{parse_error}",
                AirwaveConfig::config_path().display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Create tokio runtime for background tasks
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    // Create shared cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    // Set up Ctrl+C handler to trigger graceful shutdown
    let ctrlc_token = cancel_token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down gracefully...");
        ctrlc_token.cancel();
    }) {
        error!("Failed to set Ctrl+C handler: {}", e);
    }

    let result = runtime.block_on(run(config, cancel_token));

    // Stdin reads run on a blocking thread that cannot be interrupted
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    if let Err(e) = result {
        error!("{e}");
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: AirwaveConfig, cancel_token: CancellationToken) -> Result<(), CoreError> {
    let library = StationLibrary::new(config.library.recents_capacity).await?;

    let directory: Arc<dyn StationDirectory> =
        Arc::new(RadioBrowserClient::from_config(&config.directory)?);

    let backend = create_backend(&config.player)?;
    info!("Using audio backend: {}", backend.name());

    let session = PlaybackSession::new(backend, config.playback.clone(), Some(cancel_token.clone()));
    let pump = session.clone().start();
    tokio::spawn(log_session_events(session.clone()));

    let mut app = App::new(session.clone(), directory, library);

    println!(
        "{APP_NAME} {} - type 'help' for commands",
        env!("CARGO_PKG_VERSION")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();

        let line = tokio::select! {
            () = cancel_token.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => {
                        if app.handle(command).await.is_break() {
                            break;
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        }
    }

    info!("Shutting down...");
    session.shutdown().await;
    let _ = pump.await;

    if let Err(e) = app.library().checkpoint().await {
        warn!("Failed to checkpoint library database: {}", e);
    }
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

#[cfg(unix)]
fn create_backend(config: &PlayerConfig) -> Result<Arc<dyn AudioBackend>, CoreError> {
    Ok(Arc::new(player::MpvBackend::new(config)))
}

#[cfg(not(unix))]
fn create_backend(_config: &PlayerConfig) -> Result<Arc<dyn AudioBackend>, CoreError> {
    Err(CoreError::ConfigInvalid {
        message: "the mpv player backend needs Unix domain sockets".into(),
    })
}

/// Log session events and surface notices to the user
async fn log_session_events(session: Arc<PlaybackSession>) {
    let mut rx = session.subscribe();

    loop {
        match rx.recv().await {
            Ok(event) => match event {
                SessionEvent::StationChanged { station } => {
                    info!("Station changed: {}", station);
                }
                SessionEvent::PhaseChanged { phase, station } => {
                    let name = station.map_or_else(|| "-".to_string(), |s| s.to_string());
                    info!("Playback {}: {}", phase, name);
                    if phase == PlaybackPhase::Playing {
                        println!("\nNow playing: {name}");
                        prompt();
                    }
                }
                SessionEvent::BufferingChanged { is_buffering } => {
                    debug!("Buffering: {}", is_buffering);
                }
                SessionEvent::Notice(notice) => {
                    match notice.severity {
                        NoticeSeverity::Warning => warn!("{}: {}", notice.title, notice.description),
                        NoticeSeverity::Error => error!("{}: {}", notice.title, notice.description),
                    }
                    println!("\n{}: {}", notice.title, notice.description);
                    prompt();
                }
            },
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                info!("Session event channel closed");
                break;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                info!("Missed {} session events", n);
            }
        }
    }
}

/// Check if file logging is enabled by reading the config file.
/// This is done before full config loading to set up tracing first.
/// Returns `false` if config doesn't exist or can't be parsed.
fn check_file_logging_enabled() -> bool {
    // Minimal structs to parse just the logging.enabled field
    #[derive(serde::Deserialize)]
    struct PartialConfig {
        #[serde(default)]
        logging: PartialLoggingConfig,
    }
    #[derive(serde::Deserialize, Default)]
    struct PartialLoggingConfig {
        #[serde(default)]
        enabled: bool,
    }

    let config_path = AirwaveConfig::config_path();
    let Ok(content) = std::fs::read_to_string(&config_path) else {
        return false;
    };

    toml::from_str::<PartialConfig>(&content)
        .map(|c| c.logging.enabled)
        .unwrap_or(false)
}

/// Initialize tracing with stderr output and optional file logging
fn init_tracing(file_logging_enabled: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest_retry=warn"));

    // stdout belongs to the command prompt
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if file_logging_enabled {
        let log_path = airwave_core::paths::log_file_path();

        // Create cache directory if needed
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match File::create(&log_path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(file_layer)
                    .init();

                return;
            }
            Err(e) => {
                eprintln!("Failed to create log file at {}: {e}", log_path.display());
            }
        }
    }

    // Fallback: console only
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
