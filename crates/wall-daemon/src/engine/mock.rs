//! Scripted in-memory engine for tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use wall_proto::protocol::{ProtocolMode, Resolution};

use super::metrics::Readings;
use super::{
    DecodeQuality, EngineError, EngineEvent, EngineFactory, EngineKind, EngineOptions,
    MetricsReport, PlaybackEngine, RenderTarget, TimeRange,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Probe {
    NativeBuffer,
    MetricsReport,
    BufferedRanges,
    CurrentTime,
    ActiveBitrate,
    Bandwidth,
    DecodedBytes,
    VideoSize,
    DecodeQuality,
    AudioLevel,
}

struct MockState {
    calls: Vec<&'static str>,
    target: RenderTarget,
    url: String,
    protocol: ProtocolMode,
    options: EngineOptions,
    muted: bool,
    paused: bool,
    rate: f64,
    disposed: bool,
    /// Backend gone: every call but dispose fails.
    crashed: bool,
    audio_taps: usize,
    autoplay_blocked: bool,
    dispose_fails: bool,
    readings: Readings,
    audio_level: Option<f32>,
    failing: HashSet<Probe>,
    /// Probes that never answer.
    hanging: HashSet<Probe>,
}

/// Test-side view of one created engine.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    events: mpsc::Sender<EngineEvent>,
}

impl MockHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == name).count()
    }

    pub fn target(&self) -> RenderTarget {
        self.lock().target.clone()
    }

    pub fn url(&self) -> String {
        self.lock().url.clone()
    }

    pub fn protocol(&self) -> ProtocolMode {
        self.lock().protocol
    }

    pub fn options(&self) -> EngineOptions {
        self.lock().options.clone()
    }

    pub fn muted(&self) -> bool {
        self.lock().muted
    }

    pub fn paused(&self) -> bool {
        self.lock().paused
    }

    pub fn rate(&self) -> f64 {
        self.lock().rate
    }

    pub fn disposed(&self) -> bool {
        self.lock().disposed
    }

    pub fn audio_taps(&self) -> usize {
        self.lock().audio_taps
    }

    /// No receiver is left listening to this engine's events.
    pub fn unsubscribed(&self) -> bool {
        self.events.is_closed()
    }

    pub fn with_readings(&self, f: impl FnOnce(&mut Readings)) {
        f(&mut self.lock().readings);
    }

    pub fn set_audio_level(&self, db: Option<f32>) {
        self.lock().audio_level = db;
    }

    pub fn fail_probe(&self, probe: Probe) {
        self.lock().failing.insert(probe);
    }

    pub fn hang_probe(&self, probe: Probe) {
        self.lock().hanging.insert(probe);
    }

    /// Simulate the backend dying underneath the engine.
    pub fn crash(&self) {
        self.lock().crashed = true;
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
    }

    /// Push an event as the engine would.
    pub async fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event).await;
    }
}

pub struct MockEngine {
    kind: EngineKind,
    handle: MockHandle,
}

impl MockEngine {
    fn op(&self, name: &'static str) -> Result<std::sync::MutexGuard<'_, MockState>, EngineError> {
        let mut state = self.handle.lock();
        if state.disposed {
            return Err(EngineError::Disposed);
        }
        state.calls.push(name);
        if state.crashed && name != "dispose" {
            return Err(anyhow::anyhow!("engine process exited").into());
        }
        Ok(state)
    }

    fn read<T>(&self, read: impl FnOnce(&MockState) -> T) -> Result<T, EngineError> {
        let state = self.handle.lock();
        if state.disposed {
            return Err(EngineError::Disposed);
        }
        Ok(read(&state))
    }

    async fn probe<T>(
        &self,
        probe: Probe,
        read: impl FnOnce(&MockState) -> T,
    ) -> Result<T, EngineError> {
        let hangs = self.handle.lock().hanging.contains(&probe);
        if hangs {
            std::future::pending::<()>().await;
        }
        let state = self.handle.lock();
        if state.disposed {
            return Err(EngineError::Disposed);
        }
        if state.crashed || state.failing.contains(&probe) {
            return Err(anyhow::anyhow!("{:?} probe failed", probe).into());
        }
        Ok(read(&state))
    }
}

#[async_trait]
impl PlaybackEngine for MockEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn set_source(&self, url: &str, protocol: ProtocolMode) -> Result<(), EngineError> {
        let mut state = self.op("set_source")?;
        state.url = url.to_string();
        state.protocol = protocol;
        Ok(())
    }

    async fn play(&self) -> Result<(), EngineError> {
        let mut state = self.op("play")?;
        if state.autoplay_blocked {
            return Err(EngineError::AutoplayBlocked("play() requires user gesture".into()));
        }
        state.paused = false;
        Ok(())
    }

    async fn pause(&self) -> Result<(), EngineError> {
        self.op("pause")?.paused = true;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, EngineError> {
        self.read(|s| s.paused)
    }

    async fn set_muted(&self, muted: bool) -> Result<(), EngineError> {
        self.op("set_muted")?.muted = muted;
        Ok(())
    }

    async fn is_muted(&self) -> Result<bool, EngineError> {
        self.read(|s| s.muted)
    }

    async fn set_playback_rate(&self, rate: f64) -> Result<(), EngineError> {
        self.op("set_playback_rate")?.rate = rate;
        Ok(())
    }

    async fn apply_target(&self, target: &RenderTarget) -> Result<(), EngineError> {
        self.op("apply_target")?.target = target.clone();
        Ok(())
    }

    async fn attach_audio_tap(&self) -> Result<(), EngineError> {
        let mut state = self.op("attach_audio_tap")?;
        if state.audio_taps > 0 {
            return Err(anyhow::anyhow!("media element already connected").into());
        }
        state.audio_taps += 1;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), EngineError> {
        let mut state = self.op("dispose")?;
        state.disposed = true;
        if state.dispose_fails {
            return Err(anyhow::anyhow!("teardown failed").into());
        }
        Ok(())
    }

    async fn native_buffer_length(&self) -> Result<Option<f64>, EngineError> {
        self.probe(Probe::NativeBuffer, |s| s.readings.native_buffer).await
    }

    async fn metrics_report(&self) -> Result<Option<MetricsReport>, EngineError> {
        self.probe(Probe::MetricsReport, |s| s.readings.report).await
    }

    async fn buffered_ranges(&self) -> Result<Vec<TimeRange>, EngineError> {
        self.probe(Probe::BufferedRanges, |s| s.readings.buffered.clone()).await
    }

    async fn current_time(&self) -> Result<Option<f64>, EngineError> {
        self.probe(Probe::CurrentTime, |s| s.readings.current_time).await
    }

    async fn active_bitrate(&self) -> Result<Option<f64>, EngineError> {
        self.probe(Probe::ActiveBitrate, |s| s.readings.active_bitrate_bps).await
    }

    async fn bandwidth_estimate(&self) -> Result<Option<f64>, EngineError> {
        self.probe(Probe::Bandwidth, |s| s.readings.bandwidth_bps).await
    }

    async fn decoded_bytes(&self) -> Result<Option<u64>, EngineError> {
        self.probe(Probe::DecodedBytes, |s| s.readings.decoded_bytes).await
    }

    async fn video_size(&self) -> Result<Option<Resolution>, EngineError> {
        self.probe(Probe::VideoSize, |s| s.readings.video_size).await
    }

    async fn decode_quality(&self) -> Result<Option<DecodeQuality>, EngineError> {
        self.probe(Probe::DecodeQuality, |s| s.readings.decode_quality).await
    }

    async fn audio_level_db(&self) -> Result<Option<f32>, EngineError> {
        self.probe(Probe::AudioLevel, |s| s.audio_level).await
    }
}

#[derive(Default)]
struct FactoryState {
    engines: Vec<MockHandle>,
    fail_create: HashSet<u32>,
    autoplay_blocked: bool,
    dispose_fails: bool,
}

/// Creates `MockEngine`s and keeps a handle to each for inspection.
#[derive(Default)]
pub struct MockFactory {
    /// Fixed kind; `None` follows the requested protocol.
    kind: Option<EngineKind>,
    inner: Mutex<FactoryState>,
}

impl MockFactory {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind: Some(kind),
            inner: Mutex::default(),
        }
    }

    /// Most recently created engine for `channel_id`.
    pub fn engine(&self, channel_id: u32) -> MockHandle {
        self.inner
            .lock()
            .unwrap()
            .engines
            .iter()
            .rev()
            .find(|h| h.lock().target.channel_id == channel_id)
            .cloned()
            .unwrap_or_else(|| panic!("no engine created for channel {}", channel_id))
    }

    pub fn engines(&self) -> Vec<MockHandle> {
        self.inner.lock().unwrap().engines.clone()
    }

    pub fn live(&self) -> Vec<MockHandle> {
        self.engines().into_iter().filter(|h| !h.disposed()).collect()
    }

    pub fn created_for(&self, channel_id: u32) -> usize {
        self.engines()
            .iter()
            .filter(|h| h.target().channel_id == channel_id)
            .count()
    }

    pub fn fail_create(&self, channel_id: u32, fail: bool) {
        let mut inner = self.inner.lock().unwrap();
        if fail {
            inner.fail_create.insert(channel_id);
        } else {
            inner.fail_create.remove(&channel_id);
        }
    }

    pub fn block_autoplay(&self) {
        self.inner.lock().unwrap().autoplay_blocked = true;
    }

    pub fn fail_dispose(&self) {
        self.inner.lock().unwrap().dispose_fails = true;
    }
}

#[async_trait]
impl EngineFactory for MockFactory {
    async fn create(
        &self,
        target: &RenderTarget,
        url: &str,
        protocol: ProtocolMode,
        options: &EngineOptions,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn PlaybackEngine>, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_create.contains(&target.channel_id) {
            return Err(anyhow::anyhow!("cannot create engine for {}", target.media_id()).into());
        }
        let handle = MockHandle {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                target: target.clone(),
                url: url.to_string(),
                protocol,
                options: options.clone(),
                muted: options.muted,
                paused: !options.autoplay,
                rate: 1.0,
                disposed: false,
                crashed: false,
                audio_taps: 0,
                autoplay_blocked: inner.autoplay_blocked,
                dispose_fails: inner.dispose_fails,
                readings: Readings::default(),
                audio_level: None,
                failing: HashSet::new(),
                hanging: HashSet::new(),
            })),
            events,
        };
        inner.engines.push(handle.clone());
        Ok(Box::new(MockEngine {
            kind: self.kind.unwrap_or_else(|| EngineKind::for_protocol(protocol)),
            handle,
        }))
    }
}
