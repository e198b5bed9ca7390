//! Audio output seam between the playback session and a native player.
//!
//! A backend owns the platform-specific work: putting the device into a
//! playback-friendly audio mode and creating stream handles for a station's
//! stream locator. Handles report their progress asynchronously through a
//! [`StreamEventSender`] bound to the generation of the handle, which lets
//! the session discard reports from handles it has already replaced.

use crate::station::Station;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Monotonic counter identifying one stream handle over the session lifetime.
pub type Generation = u64;

/// Device audio-mode settings applied before every stream transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMode {
    /// Keep playing while the application is in the background
    #[serde(default = "default_true")]
    pub stays_active_in_background: bool,
    /// Ignore the device's silent switch
    #[serde(default = "default_true")]
    pub plays_in_silent_mode: bool,
    /// Lower other applications' volume instead of stopping them
    #[serde(default = "default_true")]
    pub duck_others: bool,
    #[serde(default)]
    pub play_through_earpiece: bool,
}

const fn default_true() -> bool {
    true
}

impl Default for AudioMode {
    fn default() -> Self {
        Self {
            stays_active_in_background: true,
            plays_in_silent_mode: true,
            duck_others: true,
            play_through_earpiece: false,
        }
    }
}

/// Errors reported by an audio backend or one of its handles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("audio mode rejected: {0}")]
    Configuration(String),

    #[error("stream could not be opened: {0}")]
    Open(String),

    #[error("stream control failed: {0}")]
    Control(String),

    #[error("stream release failed: {0}")]
    Release(String),
}

/// Progress reported by a live stream handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// The stream is waiting on network data
    Buffering,
    /// Loaded with no buffering outstanding
    Ready,
    /// The stream broke after it was opened
    Failed(String),
    /// The remote end closed the stream or the player exited
    Ended,
}

/// A status report tagged with the generation of the handle that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub generation: Generation,
    pub status: StreamStatus,
}

/// Messages consumed by the session's event pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionSignal {
    Stream(StreamEvent),
    /// The readiness watchdog for a generation expired
    ReadyDeadline(Generation),
}

/// Sending half of the session's stream event channel, bound to one handle.
#[derive(Debug, Clone)]
pub struct StreamEventSender {
    generation: Generation,
    tx: mpsc::UnboundedSender<SessionSignal>,
}

impl StreamEventSender {
    pub(crate) const fn new(generation: Generation, tx: mpsc::UnboundedSender<SessionSignal>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the handle this sender belongs to
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Report a status change.
    ///
    /// Returns `false` once the session has shut down its event pump.
    pub fn send(&self, status: StreamStatus) -> bool {
        self.tx
            .send(SessionSignal::Stream(StreamEvent {
                generation: self.generation,
                status,
            }))
            .is_ok()
    }
}

/// A live native audio stream bound to one station.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    /// Suspend playback without giving up the stream
    async fn pause(&self) -> Result<(), BackendError>;

    /// Continue a suspended stream
    async fn resume(&self) -> Result<(), BackendError>;

    /// Tear the stream down and free its native resources
    async fn release(self: Box<Self>) -> Result<(), BackendError>;
}

/// Factory for stream handles plus the device audio-mode hook.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Human-readable backend name for logs
    fn name(&self) -> &'static str;

    /// Apply the device audio mode.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when the device refuses the mode.
    async fn configure(&self, mode: &AudioMode) -> Result<(), BackendError>;

    /// Open a stream for `station` and start playing it as soon as it is loaded.
    ///
    /// The handle must report readiness and buffering through `events`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] when the stream cannot be created.
    async fn create_stream(
        &self,
        station: &Station,
        events: StreamEventSender,
    ) -> Result<Box<dyn StreamHandle>, BackendError>;
}
