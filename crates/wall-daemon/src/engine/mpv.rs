/// mpv-backed playback engine: one mpv process per channel, driven over its
/// JSON IPC socket with separated reader/writer tasks.
///
/// Architecture:
///
/// ```text
///   MpvFactory::create()
///         │
///         ├── MpvProcess::spawn_and_connect()
///         │     ├── writer_task   ← receives MpvRequest via mpsc, serialises → socket
///         │     └── reader_task   ← reads JSON lines from socket
///         │                            ├── response (has request_id) → matched oneshot::Sender
///         │                            └── event / property-change   → raw event channel
///         └── translator_task     ← raw mpv events → EngineEvent → supervisor
/// ```
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wall_proto::platform;
use wall_proto::protocol::{ProtocolMode, Resolution};

use super::{
    DecodeQuality, EngineError, EngineEvent, EngineFactory, EngineKind, EngineOptions,
    MetricsReport, PlaybackEngine, RenderTarget, TimeRange,
};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global counters ───────────────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);
/// Distinguishes the IPC endpoint of every process we spawn.
static NEXT_SPAWN: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_PAUSED_FOR_CACHE: u64 = 3;
pub const OBS_SPEED: u64 = 4;

const RMS_KEY: &str = "lavfi.astats.Overall.RMS_level";
const PROCESS_EXITED: &str = "mpv process exited";

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "seek".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── event translation ─────────────────────────────────────────────────────────

/// Maps raw mpv events onto engine lifecycle events.  Tracks seeking so a
/// pause caused by a seek is reported as such.
#[derive(Debug, Default)]
pub struct EventTranslator {
    seeking: bool,
    paused: bool,
}

impl EventTranslator {
    pub fn translate(&mut self, evt: &MpvEvent) -> Option<EngineEvent> {
        if let Some((id, data)) = evt.as_property_change() {
            return match id {
                OBS_CORE_IDLE => match data.as_bool() {
                    Some(false) if !self.paused => Some(EngineEvent::Playing),
                    _ => None,
                },
                OBS_PAUSE => {
                    self.paused = data.as_bool().unwrap_or(false);
                    self.paused.then_some(EngineEvent::Paused {
                        seeking: self.seeking,
                    })
                }
                OBS_PAUSED_FOR_CACHE => match data.as_bool() {
                    Some(true) => Some(EngineEvent::Buffering),
                    Some(false) if !self.paused => Some(EngineEvent::Playing),
                    _ => None,
                },
                OBS_SPEED => data.as_f64().map(EngineEvent::RateChanged),
                _ => None,
            };
        }

        match evt.event_name()? {
            "start-file" => Some(EngineEvent::LoadStart),
            "seek" => {
                self.seeking = true;
                None
            }
            "playback-restart" => {
                self.seeking = false;
                None
            }
            "end-file" if evt.raw.get("reason").and_then(Value::as_str) == Some("error") => {
                let reason = evt
                    .raw
                    .get("file_error")
                    .and_then(Value::as_str)
                    .unwrap_or("playback error");
                Some(EngineEvent::Error(reason.to_string()))
            }
            _ => None,
        }
    }
}

/// Translate raw mpv events until the IPC connection goes away.  The reader
/// only closes `rx` when the socket does, so a close that outlives the
/// engine (dispose aborts this task first) means mpv died.
async fn translator_task(mut rx: mpsc::Receiver<MpvEvent>, events: mpsc::Sender<EngineEvent>) {
    let mut translator = EventTranslator::default();
    while let Some(evt) = rx.recv().await {
        if let Some(engine_evt) = translator.translate(&evt) {
            if events.send(engine_evt).await.is_err() {
                debug!("mpv translator: subscriber gone");
                return;
            }
        }
    }
    warn!("mpv translator: IPC connection closed");
    let _ = events
        .send(EngineEvent::Error(PROCESS_EXITED.to_string()))
        .await;
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    /// `Ok(None)` when mpv reports the property as currently unavailable
    /// (nothing loaded yet, no video track, no audio filter...).
    pub async fn get_property(&self, name: &str) -> anyhow::Result<Option<Value>> {
        match self.send(json!(["get_property", name])).await {
            Ok(resp) => Ok(resp.get("data").cloned().filter(|v| !v.is_null())),
            Err(e) if e.to_string().contains("property unavailable") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_f64(&self, name: &str) -> anyhow::Result<Option<f64>> {
        Ok(self.get_property(name).await?.and_then(|v| v.as_f64()))
    }

    async fn get_bool(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self
            .get_property(name)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Register observe_property for everything the translator reacts to.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
            (OBS_SPEED, "speed"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }

    /// Install the lavfi astats audio filter so mpv exposes per-chunk RMS/peak
    /// levels via the `af-metadata/meter` property.
    pub async fn set_audio_filter(&self) -> anyhow::Result<()> {
        let filter = json!([{
            "name": "lavfi",
            "label": "meter",
            "params": { "graph": "astats=metadata=1:reset=1" }
        }]);
        self.set_property("af", filter).await?;
        debug!("mpv: astats audio filter installed");
        Ok(())
    }
}

// ── process ───────────────────────────────────────────────────────────────────

/// One mpv child process plus the IPC endpoint it listens on.
pub struct MpvProcess {
    socket_name: String,
    child: tokio::process::Child,
}

impl MpvProcess {
    pub fn alive(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_none()
    }

    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }

    fn launch(binary: &Path, socket_name: &str, args: &[String]) -> anyhow::Result<tokio::process::Child> {
        let child = tokio::process::Command::new(binary)
            .arg("--idle=yes")
            .arg(platform::mpv_socket_arg(socket_name))
            .arg("--quiet")
            .args(args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        binary: &Path,
        socket_name: String,
        args: &[String],
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<(Self, MpvHandle)> {
        let socket_path = PathBuf::from(&socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv: spawning process for {}", socket_name);
        let child = Self::launch(binary, &socket_name, args)?;
        let mut process = Self { socket_name, child };

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() || !process.alive() {
                break;
            }
        }
        if !socket_path.exists() {
            process.kill().await;
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        debug!("mpv: connected to {}", process.socket_name);
        Ok((process, start_io_tasks(stream, event_tx)))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        binary: &Path,
        socket_name: String,
        args: &[String],
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<(Self, MpvHandle)> {
        info!("mpv: spawning process for {}", socket_name);
        let child = Self::launch(binary, &socket_name, args)?;
        let mut process = Self { socket_name, child };

        let pipe_path = format!(r"\\.\pipe\{}", process.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                debug!("mpv: connected to named pipe {}", pipe_path);
                return Ok((process, start_io_tasks(client, event_tx)));
            }
        }
        process.kill().await;
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── engine ────────────────────────────────────────────────────────────────────

pub struct MpvEngine {
    kind: EngineKind,
    handle: MpvHandle,
    process: Mutex<Option<MpvProcess>>,
    translator: JoinHandle<()>,
    /// Reference clock for decode-quality samples.
    clock: Instant,
}

impl MpvEngine {
    async fn live_handle(&self) -> Result<&MpvHandle, EngineError> {
        match self.process.lock().await.as_mut() {
            Some(p) => {
                if p.alive() {
                    Ok(&self.handle)
                } else {
                    Err(anyhow::anyhow!(PROCESS_EXITED).into())
                }
            }
            None => Err(EngineError::Disposed),
        }
    }
}

/// Arguments placing the window onto `target`.
fn window_args(target: &RenderTarget) -> Vec<String> {
    match target.tile {
        Some(tile) => vec![
            format!("--geometry={}", tile.geometry()),
            "--window-minimized=no".to_string(),
        ],
        None => vec!["--window-minimized=yes".to_string()],
    }
}

/// Seekable ranges out of a `demuxer-cache-state` object.
fn parse_ranges(cache_state: &Value) -> Vec<TimeRange> {
    cache_state
        .get("seekable-ranges")
        .and_then(Value::as_array)
        .map(|ranges| {
            ranges
                .iter()
                .filter_map(|r| {
                    Some(TimeRange {
                        start: r.get("start")?.as_f64()?,
                        end: r.get("end")?.as_f64()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// RMS level in dBFS out of `af-metadata/meter`, clamped to [-90, 0].
fn parse_rms(meter: &Value) -> Option<f32> {
    let rms = meter.get(RMS_KEY)?.as_str()?.parse::<f32>().ok()?;
    Some(if rms.is_nan() { -90.0 } else { rms.clamp(-90.0, 0.0) })
}

#[async_trait]
impl PlaybackEngine for MpvEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn set_source(&self, url: &str, _protocol: ProtocolMode) -> Result<(), EngineError> {
        self.live_handle()
            .await?
            .send(json!(["loadfile", url, "replace"]))
            .await?;
        Ok(())
    }

    async fn play(&self) -> Result<(), EngineError> {
        Ok(self.live_handle().await?.set_property("pause", json!(false)).await?)
    }

    async fn pause(&self) -> Result<(), EngineError> {
        Ok(self.live_handle().await?.set_property("pause", json!(true)).await?)
    }

    async fn is_paused(&self) -> Result<bool, EngineError> {
        Ok(self.live_handle().await?.get_bool("pause").await?)
    }

    async fn set_muted(&self, muted: bool) -> Result<(), EngineError> {
        Ok(self.live_handle().await?.set_property("mute", json!(muted)).await?)
    }

    async fn is_muted(&self) -> Result<bool, EngineError> {
        Ok(self.live_handle().await?.get_bool("mute").await?)
    }

    async fn set_playback_rate(&self, rate: f64) -> Result<(), EngineError> {
        Ok(self.live_handle().await?.set_property("speed", json!(rate)).await?)
    }

    async fn apply_target(&self, target: &RenderTarget) -> Result<(), EngineError> {
        let handle = self.live_handle().await?;
        match target.tile {
            Some(tile) => {
                handle.set_property("window-minimized", json!(false)).await?;
                handle.set_property("geometry", json!(tile.geometry())).await?;
            }
            None => handle.set_property("window-minimized", json!(true)).await?,
        }
        Ok(())
    }

    async fn attach_audio_tap(&self) -> Result<(), EngineError> {
        Ok(self.live_handle().await?.set_audio_filter().await?)
    }

    async fn dispose(&self) -> Result<(), EngineError> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Err(EngineError::Disposed);
        };
        self.translator.abort();
        if process.alive() {
            let _ = self.handle.send(json!(["quit"])).await;
        }
        process.kill().await;
        Ok(())
    }

    async fn native_buffer_length(&self) -> Result<Option<f64>, EngineError> {
        Ok(self.live_handle().await?.get_f64("demuxer-cache-duration").await?)
    }

    async fn metrics_report(&self) -> Result<Option<MetricsReport>, EngineError> {
        let state = self.live_handle().await?.get_property("demuxer-cache-state").await?;
        Ok(state.map(|s| MetricsReport {
            buffer_level: s.get("cache-duration").and_then(Value::as_f64),
            bitrate_bps: None,
        }))
    }

    async fn buffered_ranges(&self) -> Result<Vec<TimeRange>, EngineError> {
        let state = self.live_handle().await?.get_property("demuxer-cache-state").await?;
        Ok(state.as_ref().map(parse_ranges).unwrap_or_default())
    }

    async fn current_time(&self) -> Result<Option<f64>, EngineError> {
        Ok(self.live_handle().await?.get_f64("time-pos").await?)
    }

    async fn active_bitrate(&self) -> Result<Option<f64>, EngineError> {
        let handle = self.live_handle().await?;
        let video = handle.get_f64("video-bitrate").await?;
        let audio = handle.get_f64("audio-bitrate").await?;
        Ok(match (video, audio) {
            (None, None) => None,
            (v, a) => Some(v.unwrap_or(0.0) + a.unwrap_or(0.0)),
        })
    }

    async fn bandwidth_estimate(&self) -> Result<Option<f64>, EngineError> {
        // cache-speed is bytes/s
        let speed = self.live_handle().await?.get_f64("cache-speed").await?;
        Ok(speed.map(|bytes| bytes * 8.0))
    }

    async fn video_size(&self) -> Result<Option<Resolution>, EngineError> {
        let handle = self.live_handle().await?;
        let width = handle.get_f64("width").await?;
        let height = handle.get_f64("height").await?;
        Ok(width.zip(height).map(|(w, h)| Resolution {
            width: w as u32,
            height: h as u32,
        }))
    }

    async fn decode_quality(&self) -> Result<Option<DecodeQuality>, EngineError> {
        let frames = self.live_handle().await?.get_f64("estimated-frame-number").await?;
        Ok(frames.filter(|f| *f >= 0.0).map(|f| DecodeQuality {
            total_frames: f as u64,
            time_secs: self.clock.elapsed().as_secs_f64(),
        }))
    }

    async fn audio_level_db(&self) -> Result<Option<f32>, EngineError> {
        let meter = self.live_handle().await?.get_property("af-metadata/meter").await?;
        Ok(meter.as_ref().and_then(parse_rms))
    }
}

// ── factory ───────────────────────────────────────────────────────────────────

/// Spawns one mpv window per channel.
#[derive(Debug, Default)]
pub struct MpvFactory;

impl MpvFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineFactory for MpvFactory {
    async fn create(
        &self,
        target: &RenderTarget,
        url: &str,
        protocol: ProtocolMode,
        options: &EngineOptions,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn PlaybackEngine>, EngineError> {
        let binary = options
            .binary
            .clone()
            .or_else(platform::find_mpv_binary)
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let mut args = vec![
            "--force-window=yes".to_string(),
            "--keep-open=no".to_string(),
            "--speed=1".to_string(),
            format!("--title={}", target.label),
            format!("--mute={}", if options.muted { "yes" } else { "no" }),
            format!("--pause={}", if options.autoplay { "no" } else { "yes" }),
        ];
        if !options.live_catchup {
            args.push("--video-sync=audio".to_string());
        }
        args.extend(window_args(target));

        let socket_name =
            platform::mpv_socket_name(target.channel_id, NEXT_SPAWN.fetch_add(1, Ordering::Relaxed));
        let (raw_tx, raw_rx) = mpsc::channel::<MpvEvent>(64);
        let (mut process, handle) =
            MpvProcess::spawn_and_connect(&binary, socket_name, &args, raw_tx).await?;

        handle.observe_all_properties().await;
        let translator = tokio::spawn(translator_task(raw_rx, events));

        debug!("mpv: loading {} ({}) into {}", url, protocol.mime_type(), target.media_id());
        if let Err(e) = handle.send(json!(["loadfile", url, "replace"])).await {
            translator.abort();
            process.kill().await;
            return Err(e.into());
        }

        Ok(Box::new(MpvEngine {
            kind: EngineKind::for_protocol(protocol),
            handle,
            process: Mutex::new(Some(process)),
            translator,
            clock: Instant::now(),
        }))
    }
}
