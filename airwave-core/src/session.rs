//! The playback session: the single owner of the active audio stream.
//!
//! Screens hand the session a station plus the list it was picked from and
//! observe the result through [`PlaybackSession::watch`] and
//! [`PlaybackSession::subscribe`]. At most one transition (release the old
//! stream, open the new one) runs at a time; `select` calls arriving while
//! one is in flight are dropped rather than queued.

use crate::audio::{
    AudioBackend, Generation, SessionSignal, StreamEvent, StreamEventSender, StreamHandle,
    StreamStatus,
};
use crate::config::PlaybackConfig;
use crate::station::{position_in, Station};
use crate::time::DurationExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const LOG_TARGET: &str = "airwave::session";

/// The session's relationship to its current station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackPhase {
    Idle,
    Connecting,
    Playing,
    Paused,
    Failed,
}

impl PlaybackPhase {
    /// Phases in which the session owns a stream handle
    #[must_use]
    pub const fn holds_stream(self) -> bool {
        matches!(self, Self::Connecting | Self::Playing | Self::Paused)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PlaybackPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction for sequential navigation within a station list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// Failure kinds surfaced by session operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The device refused the playback audio mode; no stream was touched
    #[error("Audio settings failed: {reason}")]
    AudioConfigurationFailed { reason: String },

    /// The stream could not be opened or never became ready
    #[error("Unable to play {station}: {reason}")]
    StreamUnavailable { station: String, reason: String },

    /// `switch` ran off either end of the list
    #[error("Reached the end of the station list")]
    BoundaryReached,

    /// Another transition was already running
    #[error("A station transition is already in progress")]
    RedundantTransitionDropped,
}

impl SessionError {
    /// The transient notice shown to the user, if any
    #[must_use]
    pub fn notice(&self) -> Option<Notice> {
        match self {
            Self::AudioConfigurationFailed { .. } => Some(Notice {
                severity: NoticeSeverity::Error,
                title: "Error".into(),
                description: "Audio settings failed. Please try again.".into(),
            }),
            Self::StreamUnavailable { .. } => Some(Notice {
                severity: NoticeSeverity::Error,
                title: "Error".into(),
                description: "Unable to play this station. Please try another one.".into(),
            }),
            Self::BoundaryReached => Some(Notice {
                severity: NoticeSeverity::Warning,
                title: "No more stations".into(),
                description: "You've reached the end of the station list.".into(),
            }),
            Self::RedundantTransitionDropped => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSeverity {
    Warning,
    Error,
}

/// A transient, dismissible message for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: NoticeSeverity,
    pub title: String,
    pub description: String,
}

/// Point-in-time view of the session for rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub station: Option<Station>,
    pub phase: PlaybackPhase,
    pub is_buffering: bool,
}

impl SessionSnapshot {
    const fn idle() -> Self {
        Self {
            station: None,
            phase: PlaybackPhase::Idle,
            is_buffering: false,
        }
    }

    #[must_use]
    pub const fn is_playing(&self) -> bool {
        matches!(self.phase, PlaybackPhase::Playing)
    }
}

/// Events emitted by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A different station became current
    StationChanged { station: Station },
    /// The playback phase changed
    PhaseChanged {
        phase: PlaybackPhase,
        station: Option<Station>,
    },
    /// Buffering started or finished
    BufferingChanged { is_buffering: bool },
    /// Something the user should be told about
    Notice(Notice),
}

/// What a successful `select` or `switch` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// A new stream was opened for this station
    Started(Station),
    /// The current station was paused
    Paused,
    /// The current station was resumed
    Resumed,
}

struct SessionState {
    station: Option<Station>,
    phase: PlaybackPhase,
    is_buffering: bool,
    /// Navigation context supplied with the most recent selection
    stations: Vec<Station>,
    /// Generation of the most recently requested stream handle
    generation: Generation,
    connecting_since: Option<Instant>,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            station: self.station.clone(),
            phase: self.phase,
            is_buffering: self.is_buffering,
        }
    }
}

struct ActiveStream {
    generation: Generation,
    handle: Box<dyn StreamHandle>,
}

/// Clears the in-flight flag when a transition finishes, however it finishes.
struct TransitionGuard<'a>(&'a AtomicBool);

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Mediates between the station the user wants and the stream actually playing.
pub struct PlaybackSession {
    backend: Arc<dyn AudioBackend>,
    config: PlaybackConfig,
    state: Mutex<SessionState>,
    /// Slot for the one live handle; held across backend calls that touch it
    stream: tokio::sync::Mutex<Option<ActiveStream>>,
    transition_in_flight: AtomicBool,
    next_generation: AtomicU64,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    event_tx: broadcast::Sender<SessionEvent>,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionSignal>>>,
    cancel_token: CancellationToken,
}

impl PlaybackSession {
    /// Create a new session
    ///
    /// # Arguments
    /// * `backend` - Audio backend that owns device configuration and stream creation
    /// * `config` - Playback settings (audio mode, readiness timeout)
    /// * `cancel_token` - Optional external cancellation token for graceful shutdown
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        config: PlaybackConfig,
        cancel_token: Option<CancellationToken>,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::idle());
        let (event_tx, _) = broadcast::channel(64);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            backend,
            config,
            state: Mutex::new(SessionState {
                station: None,
                phase: PlaybackPhase::Idle,
                is_buffering: false,
                stations: Vec::new(),
                generation: 0,
                connecting_since: None,
            }),
            stream: tokio::sync::Mutex::new(None),
            transition_in_flight: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            snapshot_tx,
            event_tx,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            cancel_token: cancel_token.unwrap_or_default(),
        })
    }

    /// Get a clone of the cancellation token
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Start the stream event pump in a background task
    #[must_use]
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let Some(mut rx) = self.lock_signal_rx().take() else {
            warn!(target: LOG_TARGET, "Session event pump already started");
            return;
        };

        info!(target: LOG_TARGET, "Session event pump started (backend: {})", self.backend.name());

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: LOG_TARGET, "Session event pump shutting down");
                    break;
                }
                signal = rx.recv() => {
                    match signal {
                        Some(signal) => self.handle_signal(signal).await,
                        None => break,
                    }
                }
            }
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Watch the observable session state
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current observable state
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock_state().snapshot()
    }

    #[must_use]
    pub fn current_station(&self) -> Option<Station> {
        self.lock_state().station.clone()
    }

    #[must_use]
    pub fn phase(&self) -> PlaybackPhase {
        self.lock_state().phase
    }

    #[must_use]
    pub fn is_buffering(&self) -> bool {
        self.lock_state().is_buffering
    }

    /// The navigation context supplied with the most recent selection
    #[must_use]
    pub fn stations(&self) -> Vec<Station> {
        self.lock_state().stations.clone()
    }

    #[must_use]
    pub fn is_transition_in_flight(&self) -> bool {
        self.transition_in_flight.load(Ordering::Acquire)
    }

    /// Whether a stream handle is currently live
    pub async fn has_active_stream(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Select `station` from `stations`, which becomes the navigation context.
    ///
    /// Selecting the current station while it is playing or paused toggles it
    /// instead of reopening the stream.
    ///
    /// # Errors
    ///
    /// * [`SessionError::RedundantTransitionDropped`] if another transition is running
    /// * [`SessionError::AudioConfigurationFailed`] if the device refused the audio mode
    /// * [`SessionError::StreamUnavailable`] if the stream could not be opened
    pub async fn select(
        &self,
        station: Station,
        stations: Vec<Station>,
    ) -> Result<SelectOutcome, SessionError> {
        if self
            .transition_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(target: LOG_TARGET, "Duplicate play request blocked for station: {}", station.name);
            return Err(SessionError::RedundantTransitionDropped);
        }
        let _guard = TransitionGuard(&self.transition_in_flight);

        let (is_current, phase) = {
            let state = self.lock_state();
            let is_current = state
                .station
                .as_ref()
                .is_some_and(|current| current.same_station(&station));
            (is_current, state.phase)
        };

        if is_current {
            match phase {
                PlaybackPhase::Playing | PlaybackPhase::Paused => {
                    let mut slot = self.stream.lock().await;
                    if self.holds_toggleable(&slot) {
                        self.lock_state().stations = stations;
                        return match self.toggle_locked(&mut slot).await? {
                            Some(PlaybackPhase::Paused) => Ok(SelectOutcome::Paused),
                            Some(_) => Ok(SelectOutcome::Resumed),
                            None => Err(SessionError::RedundantTransitionDropped),
                        };
                    }
                    // The stream went away while we waited for the slot
                    drop(slot);
                    info!(target: LOG_TARGET, "Station {} stopped, reopening it", station.name);
                }
                PlaybackPhase::Connecting => {
                    debug!(target: LOG_TARGET, "Station {} is already connecting", station.name);
                    return Err(SessionError::RedundantTransitionDropped);
                }
                PlaybackPhase::Idle | PlaybackPhase::Failed => {
                    info!(target: LOG_TARGET, "Retrying station: {}", station.name);
                }
            }
        }

        self.transition(station, stations).await
    }

    /// Release the old stream and open one for `station`.
    async fn transition(
        &self,
        station: Station,
        stations: Vec<Station>,
    ) -> Result<SelectOutcome, SessionError> {
        info!(target: LOG_TARGET, "Selecting station: {} ({})", station.name, station.id);

        if let Err(e) = self.backend.configure(&self.config.audio).await {
            error!(target: LOG_TARGET, "Error setting audio mode: {}", e);
            let err = SessionError::AudioConfigurationFailed {
                reason: e.to_string(),
            };
            self.notify(&err);
            return Err(err);
        }

        self.lock_state().stations = stations;

        let mut slot = self.stream.lock().await;
        if let Some(active) = slot.take() {
            debug!(target: LOG_TARGET, "Releasing stream generation {}", active.generation);
            if let Err(e) = active.handle.release().await {
                warn!(target: LOG_TARGET, "Failed to release previous stream: {}", e);
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.update(|state| {
            state.station = Some(station.clone());
            state.phase = PlaybackPhase::Connecting;
            state.is_buffering = true;
            state.generation = generation;
            state.connecting_since = Some(Instant::now());
        });

        let events = StreamEventSender::new(generation, self.signal_tx.clone());
        match self.backend.create_stream(&station, events).await {
            Ok(handle) => {
                *slot = Some(ActiveStream { generation, handle });
                self.spawn_ready_watchdog(generation);
                info!(
                    target: LOG_TARGET,
                    "Opened stream for {} (generation {})", station.name, generation
                );
                Ok(SelectOutcome::Started(station))
            }
            Err(e) => {
                error!(target: LOG_TARGET, "Error creating stream for {}: {}", station.name, e);
                self.update(|state| {
                    state.phase = PlaybackPhase::Failed;
                    state.is_buffering = false;
                    state.connecting_since = None;
                });
                let err = SessionError::StreamUnavailable {
                    station: station.name,
                    reason: e.to_string(),
                };
                self.notify(&err);
                Err(err)
            }
        }
    }

    /// Pause a playing station or resume a paused one.
    ///
    /// Returns the new phase, or `None` when there was nothing to toggle.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StreamUnavailable`] if the stream rejected the
    /// command; the stream is released and the session moves to `Failed`.
    pub async fn toggle_play_pause(&self) -> Result<Option<PlaybackPhase>, SessionError> {
        if self.is_transition_in_flight() {
            debug!(target: LOG_TARGET, "Transition in progress, ignoring play/pause");
            return Ok(None);
        }
        let mut slot = self.stream.lock().await;
        self.toggle_locked(&mut slot).await
    }

    /// Whether the slot holds the current stream in a phase that can be toggled
    fn holds_toggleable(&self, slot: &Option<ActiveStream>) -> bool {
        let Some(active) = slot.as_ref() else {
            return false;
        };
        let state = self.lock_state();
        state.generation == active.generation
            && matches!(state.phase, PlaybackPhase::Playing | PlaybackPhase::Paused)
    }

    async fn toggle_locked(
        &self,
        slot: &mut Option<ActiveStream>,
    ) -> Result<Option<PlaybackPhase>, SessionError> {
        let Some(active) = slot.as_ref() else {
            return Ok(None);
        };
        let generation = active.generation;

        let (phase, name) = {
            let state = self.lock_state();
            if state.generation != generation {
                return Ok(None);
            }
            let name = state.station.as_ref().map(|s| s.name.clone()).unwrap_or_default();
            (state.phase, name)
        };

        let (result, next) = match phase {
            PlaybackPhase::Playing => {
                info!(target: LOG_TARGET, "Pausing {}", name);
                (active.handle.pause().await, PlaybackPhase::Paused)
            }
            PlaybackPhase::Paused => {
                info!(target: LOG_TARGET, "Resuming {}", name);
                (active.handle.resume().await, PlaybackPhase::Playing)
            }
            _ => return Ok(None),
        };

        match result {
            Ok(()) => {
                self.update(|state| state.phase = next);
                Ok(Some(next))
            }
            Err(e) => {
                error!(target: LOG_TARGET, "Play/pause failed for {}: {}", name, e);
                Err(self.fail_stream(slot, generation, e.to_string()).await)
            }
        }
    }

    /// Move to the station before or after the current one in `stations`.
    ///
    /// Does not wrap around at either end of the list.
    ///
    /// # Errors
    ///
    /// * [`SessionError::BoundaryReached`] if there is no station in that direction
    /// * any error from [`PlaybackSession::select`]
    pub async fn switch(
        &self,
        direction: Direction,
        stations: Vec<Station>,
    ) -> Result<SelectOutcome, SessionError> {
        if self.is_transition_in_flight() {
            debug!(target: LOG_TARGET, "Station switch in progress, blocking duplicate switch");
            return Err(SessionError::RedundantTransitionDropped);
        }

        let current = self.current_station();
        let index = current.as_ref().and_then(|c| position_in(&stations, c));
        let target = match (index, direction) {
            (Some(i), Direction::Next) => i.checked_add(1),
            (Some(i), Direction::Previous) => i.checked_sub(1),
            (None, Direction::Next) => Some(0),
            (None, Direction::Previous) => None,
        };

        let Some(station) = target.and_then(|i| stations.get(i)).cloned() else {
            info!(target: LOG_TARGET, "Reached the end of the station list");
            let err = SessionError::BoundaryReached;
            self.notify(&err);
            return Err(err);
        };

        info!(target: LOG_TARGET, "Switching to station: {}", station.name);
        self.select(station, stations).await
    }

    /// Release any live stream and return to `Idle`.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        let mut slot = self.stream.lock().await;
        if let Some(active) = slot.take() {
            info!(target: LOG_TARGET, "Releasing stream generation {} on shutdown", active.generation);
            if let Err(e) = active.handle.release().await {
                warn!(target: LOG_TARGET, "Failed to release stream on shutdown: {}", e);
            }
        }
        self.update(|state| {
            state.station = None;
            state.phase = PlaybackPhase::Idle;
            state.is_buffering = false;
            state.connecting_since = None;
        });
    }

    async fn handle_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::Stream(event) => self.handle_stream_event(event).await,
            SessionSignal::ReadyDeadline(generation) => {
                let expired = {
                    let state = self.lock_state();
                    state.generation == generation && state.phase == PlaybackPhase::Connecting
                };
                if expired {
                    warn!(target: LOG_TARGET, "Stream generation {} never became ready", generation);
                    let mut slot = self.stream.lock().await;
                    self.fail_stream(&mut slot, generation, "timed out waiting for the stream".into())
                        .await;
                }
            }
        }
    }

    async fn handle_stream_event(&self, event: StreamEvent) {
        let StreamEvent { generation, status } = event;

        let (current, phase) = {
            let state = self.lock_state();
            (state.generation == generation, state.phase)
        };
        if !current || !phase.holds_stream() {
            debug!(
                target: LOG_TARGET,
                "Ignoring stale stream event {:?} from generation {}", status, generation
            );
            return;
        }

        match status {
            StreamStatus::Buffering => {
                self.update(|state| state.is_buffering = true);
            }
            StreamStatus::Ready => {
                self.update(|state| {
                    if state.phase == PlaybackPhase::Connecting {
                        state.phase = PlaybackPhase::Playing;
                        if let (Some(station), Some(since)) =
                            (state.station.as_ref(), state.connecting_since.take())
                        {
                            info!(
                                target: LOG_TARGET,
                                "Playing new station: {} (ready after {}ms)",
                                station.name,
                                since.elapsed().as_millis_u64()
                            );
                        }
                    }
                    state.is_buffering = false;
                });
            }
            StreamStatus::Failed(reason) => {
                let mut slot = self.stream.lock().await;
                self.fail_stream(&mut slot, generation, reason).await;
            }
            StreamStatus::Ended => {
                let mut slot = self.stream.lock().await;
                self.fail_stream(&mut slot, generation, "stream ended".into())
                    .await;
            }
        }
    }

    /// Release the handle of `generation` if it is still current and move to `Failed`.
    ///
    /// The caller must hold the stream slot.
    async fn fail_stream(
        &self,
        slot: &mut Option<ActiveStream>,
        generation: Generation,
        reason: String,
    ) -> SessionError {
        let name = {
            let state = self.lock_state();
            if state.generation != generation || !state.phase.holds_stream() {
                // Superseded while waiting for the slot
                return SessionError::StreamUnavailable {
                    station: String::new(),
                    reason,
                };
            }
            state.station.as_ref().map(|s| s.name.clone()).unwrap_or_default()
        };

        if slot.as_ref().is_some_and(|active| active.generation == generation) {
            if let Some(active) = slot.take() {
                if let Err(e) = active.handle.release().await {
                    warn!(target: LOG_TARGET, "Failed to release broken stream: {}", e);
                }
            }
        }

        self.update(|state| {
            state.phase = PlaybackPhase::Failed;
            state.is_buffering = false;
            state.connecting_since = None;
        });

        error!(target: LOG_TARGET, "Stream for {} failed: {}", name, reason);
        let err = SessionError::StreamUnavailable {
            station: name,
            reason,
        };
        self.notify(&err);
        err
    }

    fn spawn_ready_watchdog(&self, generation: Generation) {
        let timeout = self.config.ready_timeout();
        let tx = self.signal_tx.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel_token.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    let _ = tx.send(SessionSignal::ReadyDeadline(generation));
                }
            }
        });
    }

    /// Apply a state change and emit events for whatever observably changed
    fn update(&self, apply: impl FnOnce(&mut SessionState)) {
        let (old, new) = {
            let mut state = self.lock_state();
            let old = state.snapshot();
            apply(&mut state);
            (old, state.snapshot())
        };

        let station_changed = match (&old.station, &new.station) {
            (Some(a), Some(b)) => !a.same_station(b),
            (None, None) => false,
            _ => true,
        };
        if station_changed {
            if let Some(ref station) = new.station {
                let _ = self.event_tx.send(SessionEvent::StationChanged {
                    station: station.clone(),
                });
            }
        }
        if old.phase != new.phase {
            let _ = self.event_tx.send(SessionEvent::PhaseChanged {
                phase: new.phase,
                station: new.station.clone(),
            });
        }
        if old.is_buffering != new.is_buffering {
            let _ = self.event_tx.send(SessionEvent::BufferingChanged {
                is_buffering: new.is_buffering,
            });
        }

        if old != new {
            self.snapshot_tx.send_replace(new);
        }
    }

    fn notify(&self, err: &SessionError) {
        if let Some(notice) = err.notice() {
            let _ = self.event_tx.send(SessionEvent::Notice(notice));
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_signal_rx(&self) -> MutexGuard<'_, Option<mpsc::UnboundedReceiver<SessionSignal>>> {
        self.signal_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioMode, BackendError};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Audio backend double that records every handle it creates.
    #[derive(Default)]
    struct ScriptedBackend {
        script: Mutex<Script>,
        created: AtomicUsize,
        live: Arc<AtomicUsize>,
        max_live: Arc<AtomicUsize>,
    }

    #[derive(Default)]
    struct Script {
        fail_configure: bool,
        fail_stations: HashSet<String>,
        fail_control: bool,
        slow_handle: bool,
        auto_ready: bool,
        senders: Vec<(String, StreamEventSender)>,
        log: Vec<String>,
    }

    struct ScriptedHandle {
        station: String,
        fail_control: bool,
        slow_handle: bool,
        live: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn auto_ready() -> Arc<Self> {
            let backend = Self::default();
            backend.script.lock().unwrap().auto_ready = true;
            Arc::new(backend)
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }

        fn max_live(&self) -> usize {
            self.max_live.load(Ordering::SeqCst)
        }

        fn sender_for(&self, id: &str) -> StreamEventSender {
            self.script
                .lock()
                .unwrap()
                .senders
                .iter()
                .rev()
                .find(|(station, _)| station == id)
                .map(|(_, sender)| sender.clone())
                .unwrap()
        }

        fn log(&self) -> Vec<String> {
            self.script.lock().unwrap().log.clone()
        }
    }

    #[async_trait]
    impl AudioBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn configure(&self, _mode: &AudioMode) -> Result<(), BackendError> {
            let mut script = self.script.lock().unwrap();
            script.log.push("configure".into());
            if script.fail_configure {
                return Err(BackendError::Configuration("refused".into()));
            }
            Ok(())
        }

        async fn create_stream(
            &self,
            station: &Station,
            events: StreamEventSender,
        ) -> Result<Box<dyn StreamHandle>, BackendError> {
            // Suspend once so concurrent callers interleave like real I/O would
            tokio::task::yield_now().await;

            let mut script = self.script.lock().unwrap();
            let id = station.id.to_string();
            script.log.push(format!("create {id}"));
            if script.fail_stations.contains(&id) {
                return Err(BackendError::Open("connection refused".into()));
            }

            self.created.fetch_add(1, Ordering::SeqCst);
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);

            if script.auto_ready {
                events.send(StreamStatus::Ready);
            }
            script.senders.push((id.clone(), events));

            Ok(Box::new(ScriptedHandle {
                station: id,
                fail_control: script.fail_control,
                slow_handle: script.slow_handle,
                live: self.live.clone(),
                log: Arc::new(Mutex::new(Vec::new())),
            }))
        }
    }

    #[async_trait]
    impl StreamHandle for ScriptedHandle {
        async fn pause(&self) -> Result<(), BackendError> {
            if self.slow_handle {
                tokio::task::yield_now().await;
            }
            self.log.lock().unwrap().push(format!("pause {}", self.station));
            if self.fail_control {
                return Err(BackendError::Control("player gone".into()));
            }
            Ok(())
        }

        async fn resume(&self) -> Result<(), BackendError> {
            if self.slow_handle {
                tokio::task::yield_now().await;
            }
            self.log.lock().unwrap().push(format!("resume {}", self.station));
            if self.fail_control {
                return Err(BackendError::Control("player gone".into()));
            }
            Ok(())
        }

        async fn release(self: Box<Self>) -> Result<(), BackendError> {
            if self.slow_handle {
                tokio::task::yield_now().await;
            }
            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn abc() -> Vec<Station> {
        vec![
            Station::new("a", "Alpha", "http://a.example/live"),
            Station::new("b", "Beta", "http://b.example/live"),
            Station::new("c", "Gamma", "http://c.example/live"),
        ]
    }

    fn session_with(backend: &Arc<ScriptedBackend>) -> Arc<PlaybackSession> {
        PlaybackSession::new(backend.clone(), PlaybackConfig::default(), None)
    }

    impl PlaybackSession {
        /// Process every queued signal without running the background pump
        async fn drain(&self) {
            let Some(mut rx) = self.lock_signal_rx().take() else {
                return;
            };
            while let Ok(signal) = rx.try_recv() {
                self.handle_signal(signal).await;
            }
            *self.lock_signal_rx() = Some(rx);
        }
    }

    async fn assert_stream_invariant(session: &PlaybackSession) {
        assert_eq!(
            session.has_active_stream().await,
            session.phase().holds_stream(),
            "stream handle presence must match phase {}",
            session.phase()
        );
    }

    fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_initial_state_is_idle() {
        let backend = ScriptedBackend::new();
        let session = session_with(&backend);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, PlaybackPhase::Idle);
        assert!(snapshot.station.is_none());
        assert!(!snapshot.is_buffering);
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_select_connects_then_plays() {
        let backend = ScriptedBackend::new();
        let session = session_with(&backend);
        let list = abc();

        let outcome = session.select(list[0].clone(), list.clone()).await.unwrap();
        assert_eq!(outcome, SelectOutcome::Started(list[0].clone()));
        assert_eq!(session.phase(), PlaybackPhase::Connecting);
        assert!(session.is_buffering());
        assert_eq!(session.stations(), list);
        assert_stream_invariant(&session).await;

        backend.sender_for("a").send(StreamStatus::Ready);
        session.drain().await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, PlaybackPhase::Playing);
        assert!(!snapshot.is_buffering);
        assert_eq!(snapshot.station.unwrap().id.as_str(), "a");
        assert_eq!(backend.log(), vec!["configure", "create a"]);
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_rapid_double_select_keeps_first() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        let (first, second) = tokio::join!(
            session.select(list[0].clone(), list.clone()),
            session.select(list[1].clone(), list.clone()),
        );

        assert_eq!(first.unwrap(), SelectOutcome::Started(list[0].clone()));
        assert_eq!(second.unwrap_err(), SessionError::RedundantTransitionDropped);
        assert_eq!(backend.created(), 1);
        assert_eq!(session.current_station().unwrap().id.as_str(), "a");
        assert!(!session.is_transition_in_flight());
    }

    #[tokio::test]
    async fn test_select_storm_never_leaks_handles() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        for round in 0..5 {
            let (x, y, z) = tokio::join!(
                session.select(list[round % 3].clone(), list.clone()),
                session.select(list[(round + 1) % 3].clone(), list.clone()),
                session.select(list[(round + 2) % 3].clone(), list.clone()),
            );
            let dropped = [x, y, z]
                .into_iter()
                .filter(|r| matches!(r, Err(SessionError::RedundantTransitionDropped)))
                .count();
            assert_eq!(dropped, 2);
            session.drain().await;
        }

        assert_eq!(backend.max_live(), 1);
        assert_eq!(backend.live(), 1);
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_reselect_current_station_toggles() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);

        let outcome = session.select(list[0].clone(), list.clone()).await.unwrap();
        assert_eq!(outcome, SelectOutcome::Paused);
        assert_eq!(session.phase(), PlaybackPhase::Paused);

        let outcome = session.select(list[0].clone(), list.clone()).await.unwrap();
        assert_eq!(outcome, SelectOutcome::Resumed);
        assert_eq!(session.phase(), PlaybackPhase::Playing);

        assert_eq!(backend.created(), 1);
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_reselect_while_connecting_is_dropped() {
        let backend = ScriptedBackend::new();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        let err = session.select(list[0].clone(), list.clone()).await.unwrap_err();

        assert_eq!(err, SessionError::RedundantTransitionDropped);
        assert_eq!(backend.created(), 1);
        assert_eq!(session.phase(), PlaybackPhase::Connecting);
    }

    #[tokio::test]
    async fn test_select_different_station_releases_previous() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;
        session.select(list[2].clone(), list.clone()).await.unwrap();

        assert_eq!(backend.created(), 2);
        assert_eq!(backend.live(), 1);
        assert_eq!(session.current_station().unwrap().id.as_str(), "c");
    }

    #[tokio::test]
    async fn test_toggle_play_pause() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[1].clone(), list.clone()).await.unwrap();
        session.drain().await;

        assert_eq!(session.toggle_play_pause().await.unwrap(), Some(PlaybackPhase::Paused));
        assert_stream_invariant(&session).await;
        assert_eq!(session.toggle_play_pause().await.unwrap(), Some(PlaybackPhase::Playing));
        assert_eq!(backend.created(), 1);
    }

    #[tokio::test]
    async fn test_toggle_without_stream_is_noop() {
        let backend = ScriptedBackend::new();
        let session = session_with(&backend);

        assert_eq!(session.toggle_play_pause().await.unwrap(), None);
        assert_eq!(session.phase(), PlaybackPhase::Idle);
    }

    #[tokio::test]
    async fn test_toggle_while_connecting_is_noop() {
        let backend = ScriptedBackend::new();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        assert_eq!(session.toggle_play_pause().await.unwrap(), None);
        assert_eq!(session.phase(), PlaybackPhase::Connecting);
    }

    #[tokio::test]
    async fn test_toggle_control_failure_fails_stream() {
        let backend = ScriptedBackend::auto_ready();
        backend.script.lock().unwrap().fail_control = true;
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;

        let err = session.toggle_play_pause().await.unwrap_err();
        assert!(matches!(err, SessionError::StreamUnavailable { .. }));
        assert_eq!(session.phase(), PlaybackPhase::Failed);
        assert_eq!(backend.live(), 0);
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_switch_prev_at_start_is_boundary() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;
        let mut events = session.subscribe();

        let err = session.switch(Direction::Previous, list.clone()).await.unwrap_err();

        assert_eq!(err, SessionError::BoundaryReached);
        assert_eq!(session.current_station().unwrap().id.as_str(), "a");
        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(backend.created(), 1);

        let events = drain_events(&mut events);
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Notice(Notice { severity: NoticeSeverity::Warning, .. })]
        ));
    }

    #[tokio::test]
    async fn test_switch_next_at_end_is_boundary() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[2].clone(), list.clone()).await.unwrap();
        session.drain().await;

        let err = session.switch(Direction::Next, list.clone()).await.unwrap_err();
        assert_eq!(err, SessionError::BoundaryReached);
        assert_eq!(session.current_station().unwrap().id.as_str(), "c");
        assert_eq!(session.phase(), PlaybackPhase::Playing);
    }

    #[tokio::test]
    async fn test_switch_next_connects_then_plays() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;
        let mut events = session.subscribe();

        let outcome = session.switch(Direction::Next, list.clone()).await.unwrap();
        assert_eq!(outcome, SelectOutcome::Started(list[1].clone()));
        assert_eq!(session.phase(), PlaybackPhase::Connecting);

        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(session.current_station().unwrap().id.as_str(), "b");

        let phases: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::PhaseChanged { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![PlaybackPhase::Connecting, PlaybackPhase::Playing]);
    }

    #[tokio::test]
    async fn test_switch_uses_supplied_list() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();
        let favorites = vec![list[2].clone(), list[0].clone()];

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;

        // "a" is last in the favorites list, so "prev" goes to "c"
        session.switch(Direction::Previous, favorites.clone()).await.unwrap();
        assert_eq!(session.current_station().unwrap().id.as_str(), "c");
        assert_eq!(session.stations(), favorites);
    }

    #[tokio::test]
    async fn test_switch_without_current_station() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        let err = session.switch(Direction::Previous, list.clone()).await.unwrap_err();
        assert_eq!(err, SessionError::BoundaryReached);

        session.switch(Direction::Next, list.clone()).await.unwrap();
        assert_eq!(session.current_station().unwrap().id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_switch_on_empty_list_is_boundary() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);

        let err = session.switch(Direction::Next, Vec::new()).await.unwrap_err();
        assert_eq!(err, SessionError::BoundaryReached);
        assert_eq!(session.phase(), PlaybackPhase::Idle);
    }

    #[tokio::test]
    async fn test_stale_ready_callback_is_ignored() {
        let backend = ScriptedBackend::new();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        let stale = backend.sender_for("a");
        session.select(list[1].clone(), list.clone()).await.unwrap();

        stale.send(StreamStatus::Ready);
        session.drain().await;

        assert_eq!(session.phase(), PlaybackPhase::Connecting);
        assert!(session.is_buffering());
        assert_eq!(session.current_station().unwrap().id.as_str(), "b");

        backend.sender_for("b").send(StreamStatus::Ready);
        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);
    }

    #[tokio::test]
    async fn test_stale_failure_callback_is_ignored() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        let stale = backend.sender_for("a");
        session.select(list[1].clone(), list.clone()).await.unwrap();
        session.drain().await;

        stale.send(StreamStatus::Failed("late".into()));
        stale.send(StreamStatus::Ended);
        session.drain().await;

        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(backend.live(), 1);
    }

    #[tokio::test]
    async fn test_stream_unavailable_then_recovery() {
        let backend = ScriptedBackend::auto_ready();
        backend.script.lock().unwrap().fail_stations.insert("b".into());
        let session = session_with(&backend);
        let list = abc();
        let mut events = session.subscribe();

        let err = session.select(list[1].clone(), list.clone()).await.unwrap_err();
        assert!(matches!(err, SessionError::StreamUnavailable { ref station, .. } if station == "Beta"));
        assert_eq!(session.phase(), PlaybackPhase::Failed);
        assert_eq!(session.current_station().unwrap().id.as_str(), "b");
        assert!(!session.is_transition_in_flight());
        assert_stream_invariant(&session).await;
        assert!(drain_events(&mut events).iter().any(|e| matches!(
            e,
            SessionEvent::Notice(Notice { severity: NoticeSeverity::Error, .. })
        )));

        session.select(list[2].clone(), list.clone()).await.unwrap();
        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(session.current_station().unwrap().id.as_str(), "c");
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_reselect_failed_station_retries() {
        let backend = ScriptedBackend::auto_ready();
        backend.script.lock().unwrap().fail_stations.insert("a".into());
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap_err();
        backend.script.lock().unwrap().fail_stations.clear();

        let outcome = session.select(list[0].clone(), list.clone()).await.unwrap();
        assert_eq!(outcome, SelectOutcome::Started(list[0].clone()));
        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);
    }

    #[tokio::test]
    async fn test_reselect_while_stream_fails_retries() {
        let backend = ScriptedBackend::auto_ready();
        backend.script.lock().unwrap().slow_handle = true;
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);

        // The failure is handled while the reselect waits for the stream slot
        backend.sender_for("a").send(StreamStatus::Failed("stream dropped".into()));
        let ((), reselect) = tokio::join!(session.drain(), async {
            tokio::task::yield_now().await;
            session.select(list[0].clone(), list.clone()).await
        });

        assert_eq!(reselect.unwrap(), SelectOutcome::Started(list[0].clone()));
        assert_eq!(backend.created(), 2);
        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(backend.max_live(), 1);
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_select_during_toggle_does_not_interleave() {
        let backend = ScriptedBackend::auto_ready();
        backend.script.lock().unwrap().slow_handle = true;
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;

        let (toggled, selected) = tokio::join!(
            session.toggle_play_pause(),
            session.select(list[1].clone(), list.clone()),
        );

        assert!(toggled.is_ok());
        assert_eq!(selected.unwrap(), SelectOutcome::Started(list[1].clone()));
        assert_eq!(backend.created(), 2);
        assert_eq!(backend.live(), 1);
        assert_eq!(backend.max_live(), 1);

        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(session.current_station().unwrap().id.as_str(), "b");
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_switch_during_select_is_dropped() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        let (selected, switched) = tokio::join!(
            session.select(list[2].clone(), list.clone()),
            session.switch(Direction::Next, list.clone()),
        );

        assert_eq!(selected.unwrap(), SelectOutcome::Started(list[2].clone()));
        assert_eq!(switched.unwrap_err(), SessionError::RedundantTransitionDropped);
        assert_eq!(backend.created(), 1);
        assert!(!session.is_transition_in_flight());

        session.drain().await;
        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(session.current_station().unwrap().id.as_str(), "c");
        assert_eq!(backend.max_live(), 1);
    }

    #[tokio::test]
    async fn test_audio_configuration_failure_touches_nothing() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;

        backend.script.lock().unwrap().fail_configure = true;
        let err = session.select(list[1].clone(), vec![list[1].clone()]).await.unwrap_err();

        assert!(matches!(err, SessionError::AudioConfigurationFailed { .. }));
        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(session.current_station().unwrap().id.as_str(), "a");
        assert_eq!(session.stations(), list);
        assert_eq!(backend.created(), 1);
        assert_eq!(backend.live(), 1);
        assert!(!session.is_transition_in_flight());
    }

    #[tokio::test]
    async fn test_stream_failure_after_playing() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;

        backend.sender_for("a").send(StreamStatus::Failed("decoder error".into()));
        session.drain().await;

        assert_eq!(session.phase(), PlaybackPhase::Failed);
        assert_eq!(session.current_station().unwrap().id.as_str(), "a");
        assert_eq!(backend.live(), 0);
        assert_stream_invariant(&session).await;
    }

    #[tokio::test]
    async fn test_buffering_while_playing() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;

        let sender = backend.sender_for("a");
        sender.send(StreamStatus::Buffering);
        session.drain().await;
        assert!(session.is_buffering());
        assert_eq!(session.phase(), PlaybackPhase::Playing);

        sender.send(StreamStatus::Ready);
        session.drain().await;
        assert!(!session.is_buffering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_that_never_becomes_ready_fails() {
        let backend = ScriptedBackend::new();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        tokio::time::sleep(PlaybackConfig::default().ready_timeout() + Duration::from_millis(10)).await;
        session.drain().await;

        assert_eq!(session.phase(), PlaybackPhase::Failed);
        assert_eq!(backend.live(), 0);
        assert_stream_invariant(&session).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_stream_survives_watchdog() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();
        session.drain().await;
        tokio::time::sleep(PlaybackConfig::default().ready_timeout() * 2).await;
        session.drain().await;

        assert_eq!(session.phase(), PlaybackPhase::Playing);
        assert_eq!(backend.live(), 1);
    }

    #[tokio::test]
    async fn test_event_pump_applies_ready() {
        let backend = ScriptedBackend::auto_ready();
        let session = session_with(&backend);
        let pump = session.clone().start();
        let mut watch = session.watch();
        let list = abc();

        session.select(list[0].clone(), list.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while watch.borrow_and_update().phase != PlaybackPhase::Playing {
                watch.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        session.shutdown().await;
        pump.await.unwrap();
        assert_eq!(session.phase(), PlaybackPhase::Idle);
        assert_eq!(backend.live(), 0);
    }
}
