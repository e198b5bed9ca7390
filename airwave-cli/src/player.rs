//! Audio backend that drives an external mpv process over its JSON IPC socket.
//!
//! Each stream handle owns one mpv process started with `--idle=no`, so the
//! process lives exactly as long as the stream. Playback progress comes from
//! observed properties: `paused-for-cache` turning on means buffering, and
//! `core-idle` turning off means audio is flowing.

use airwave_core::{
    AudioBackend, AudioMode, BackendError, PlayerConfig, Station, StreamEventSender, StreamHandle,
    StreamStatus,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

const LOG_TARGET: &str = "airwave::player";

/// How long to wait for mpv to open its IPC socket
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long mpv gets to exit after `quit` before it is killed
const QUIT_GRACE: Duration = Duration::from_secs(2);

const OBSERVE_PAUSED_FOR_CACHE: u64 = 1;
const OBSERVE_CORE_IDLE: u64 = 2;

pub struct MpvBackend {
    command: String,
    extra_args: Vec<String>,
    socket_dir: PathBuf,
    verified: AtomicBool,
}

impl MpvBackend {
    #[must_use]
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            command: config.command.clone(),
            extra_args: config.extra_args.clone(),
            socket_dir: std::env::temp_dir(),
            verified: AtomicBool::new(false),
        }
    }

    fn socket_path(&self, generation: u64) -> PathBuf {
        self.socket_dir
            .join(format!("airwave-{}-{generation}.sock", std::process::id()))
    }
}

#[async_trait]
impl AudioBackend for MpvBackend {
    fn name(&self) -> &'static str {
        "mpv"
    }

    async fn configure(&self, mode: &AudioMode) -> Result<(), BackendError> {
        debug!(target: LOG_TARGET, "Audio mode requested: {:?}", mode);
        if mode.play_through_earpiece {
            warn!(target: LOG_TARGET, "Earpiece output is not available, using the default device");
        }

        if self.verified.load(Ordering::Acquire) {
            return Ok(());
        }

        let output = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Configuration(format!("cannot run {}: {e}", self.command)))?;

        if !output.status.success() {
            return Err(BackendError::Configuration(format!(
                "{} --version exited with {}",
                self.command, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        info!(
            target: LOG_TARGET,
            "Using player: {}",
            stdout.lines().next().unwrap_or(self.command.as_str())
        );
        self.verified.store(true, Ordering::Release);
        Ok(())
    }

    async fn create_stream(
        &self,
        station: &Station,
        events: StreamEventSender,
    ) -> Result<Box<dyn StreamHandle>, BackendError> {
        let url = stream_url(station)?;

        let socket_path = self.socket_path(events.generation());
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!(target: LOG_TARGET, "Starting {} for {}", self.command, url);
        let mut child = Command::new(&self.command)
            .args(player_args(&socket_path, &self.extra_args, url.as_str()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Open(format!("cannot start {}: {e}", self.command)))?;

        let socket = connect(&socket_path, &mut child).await?;
        let (read_half, mut write_half) = socket.into_split();

        for (id, property) in [
            (OBSERVE_PAUSED_FOR_CACHE, "paused-for-cache"),
            (OBSERVE_CORE_IDLE, "core-idle"),
        ] {
            send_command(&mut write_half, json!(["observe_property", id, property]))
                .await
                .map_err(|e| BackendError::Open(format!("player IPC failed: {e}")))?;
        }

        let released = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_events(read_half, events, released.clone()));

        Ok(Box::new(MpvStream {
            station: station.name.clone(),
            writer: Mutex::new(write_half),
            child: Mutex::new(child),
            released,
            reader,
            socket_path,
        }))
    }
}

struct MpvStream {
    station: String,
    writer: Mutex<OwnedWriteHalf>,
    child: Mutex<Child>,
    released: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    socket_path: PathBuf,
}

impl MpvStream {
    async fn set_pause(&self, pause: bool) -> Result<(), BackendError> {
        let mut writer = self.writer.lock().await;
        send_command(&mut writer, json!(["set_property", "pause", pause]))
            .await
            .map_err(|e| BackendError::Control(e.to_string()))
    }
}

#[async_trait]
impl StreamHandle for MpvStream {
    async fn pause(&self) -> Result<(), BackendError> {
        self.set_pause(true).await
    }

    async fn resume(&self) -> Result<(), BackendError> {
        self.set_pause(false).await
    }

    async fn release(self: Box<Self>) -> Result<(), BackendError> {
        let Self {
            station,
            writer,
            child,
            released,
            reader,
            socket_path,
        } = *self;
        released.store(true, Ordering::Release);

        {
            let mut writer = writer.lock().await;
            if let Err(e) = send_command(&mut writer, json!(["quit"])).await {
                debug!(target: LOG_TARGET, "quit not delivered to player for {}: {}", station, e);
            }
        }

        let mut child = child.into_inner();
        let result = match tokio::time::timeout(QUIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target: LOG_TARGET, "Player for {} exited with {}", station, status);
                Ok(())
            }
            _ => child
                .kill()
                .await
                .map_err(|e| BackendError::Release(format!("cannot stop player: {e}"))),
        };

        reader.abort();
        let _ = tokio::fs::remove_file(&socket_path).await;
        result
    }
}

fn stream_url(station: &Station) -> Result<Url, BackendError> {
    let url = Url::parse(station.stream_url.trim())
        .map_err(|e| BackendError::Open(format!("invalid stream URL {:?}: {e}", station.stream_url)))?;
    if url.scheme() == "file" {
        return Err(BackendError::Open(format!("refusing local stream URL {url}")));
    }
    Ok(url)
}

/// Command line for one stream
fn player_args(socket_path: &Path, extra_args: &[String], url: &str) -> Vec<String> {
    let mut args = vec![
        "--no-video".to_string(),
        "--idle=no".to_string(),
        "--no-terminal".to_string(),
        format!("--input-ipc-server={}", socket_path.display()),
    ];
    args.extend(extra_args.iter().cloned());
    args.push(url.to_string());
    args
}

async fn connect(socket_path: &Path, child: &mut Child) -> Result<UnixStream, BackendError> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(BackendError::Open(format!("player exited with {status}")));
                }
                if Instant::now() >= deadline {
                    return Err(BackendError::Open(format!("player IPC socket unavailable: {e}")));
                }
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
        }
    }
}

async fn send_command(writer: &mut OwnedWriteHalf, command: Value) -> std::io::Result<()> {
    let mut line = json!({ "command": command }).to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

/// Forward player events until the socket closes
async fn read_events(read_half: OwnedReadHalf, events: StreamEventSender, released: Arc<AtomicBool>) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    debug!(target: LOG_TARGET, "Unparseable player message: {}", line);
                    continue;
                };
                if let Some(status) = interpret(&message) {
                    if released.load(Ordering::Acquire) {
                        break;
                    }
                    debug!(target: LOG_TARGET, "Player status: {:?}", status);
                    let terminal = matches!(status, StreamStatus::Failed(_) | StreamStatus::Ended);
                    if !events.send(status) || terminal {
                        break;
                    }
                }
            }
            Ok(None) => {
                if !released.load(Ordering::Acquire) {
                    events.send(StreamStatus::Ended);
                }
                break;
            }
            Err(e) => {
                if !released.load(Ordering::Acquire) {
                    events.send(StreamStatus::Failed(format!("player IPC error: {e}")));
                }
                break;
            }
        }
    }
}

/// Map an mpv IPC message to a stream status
fn interpret(message: &Value) -> Option<StreamStatus> {
    match message.get("event").and_then(Value::as_str)? {
        "property-change" => {
            let name = message.get("name").and_then(Value::as_str)?;
            let value = message.get("data").and_then(Value::as_bool)?;
            match (name, value) {
                ("paused-for-cache", true) => Some(StreamStatus::Buffering),
                ("core-idle", false) => Some(StreamStatus::Ready),
                _ => None,
            }
        }
        "end-file" => match message.get("reason").and_then(Value::as_str) {
            Some("error") => {
                let detail = message
                    .get("file_error")
                    .and_then(Value::as_str)
                    .unwrap_or("playback error");
                Some(StreamStatus::Failed(detail.to_string()))
            }
            _ => Some(StreamStatus::Ended),
        },
        _ => None,
    }
}
