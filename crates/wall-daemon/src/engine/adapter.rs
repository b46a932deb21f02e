use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use wall_proto::protocol::{HealthSnapshot, ProtocolMode, Resolution};

use super::metrics::{strategy_for, Bitrate, FpsSample, MetricStrategy, Readings};
use super::{
    EngineError, EngineEvent, EngineFactory, EngineKind, EngineOptions, PlaybackEngine,
    RenderTarget,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Bitrate,
    BufferLevel,
    Resolution,
    FrameRate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Bitrate(Bitrate),
    BufferSeconds(f64),
    Resolution(Resolution),
    Fps(f64),
}

/// One engine handle plus the metric strategy for its kind.
///
/// Owns the handle exclusively: `dispose` consumes the adapter, so a handle
/// can never be used after teardown.
pub struct EngineAdapter {
    channel_id: u32,
    engine: Box<dyn PlaybackEngine>,
    strategy: &'static dyn MetricStrategy,
    fps_sample: Option<FpsSample>,
    loaded_at: Instant,
}

impl fmt::Debug for EngineAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineAdapter")
            .field("channel_id", &self.channel_id)
            .field("kind", &self.engine.kind())
            .finish()
    }
}

impl EngineAdapter {
    /// Create an engine through `factory`.  Catch-up is forced off whatever
    /// the caller asked for.
    pub async fn create(
        factory: &dyn EngineFactory,
        target: &RenderTarget,
        url: &str,
        protocol: ProtocolMode,
        options: &EngineOptions,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Self, EngineError> {
        let options = EngineOptions {
            live_catchup: false,
            ..options.clone()
        };
        let engine = factory
            .create(target, url, protocol, &options, events)
            .await?;
        Ok(Self::new(target.channel_id, engine))
    }

    pub fn new(channel_id: u32, engine: Box<dyn PlaybackEngine>) -> Self {
        let strategy = strategy_for(engine.kind());
        Self {
            channel_id,
            engine,
            strategy,
            fps_sample: None,
            loaded_at: Instant::now(),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.engine.kind()
    }

    pub fn engine(&self) -> &dyn PlaybackEngine {
        self.engine.as_ref()
    }

    /// Point the engine at a new source.  Resets delta-based metric state.
    pub async fn set_source(&mut self, url: &str, protocol: ProtocolMode) -> Result<(), EngineError> {
        self.fps_sample = None;
        self.loaded_at = Instant::now();
        self.engine.set_source(url, protocol).await
    }

    /// Adapter-level reaction to an engine event.  Pins the playback rate:
    /// any rate other than 1.0 is corrected immediately.
    pub async fn observe(&self, event: &EngineEvent) {
        if let EngineEvent::RateChanged(rate) = event {
            if (rate - 1.0).abs() > f64::EPSILON {
                warn!(
                    "channel {}: playback rate changed to {}, pinning to 1.0",
                    self.channel_id, rate
                );
                if let Err(e) = self.engine.set_playback_rate(1.0).await {
                    warn!("channel {}: failed to pin playback rate: {}", self.channel_id, e);
                }
            }
        }
    }

    pub async fn read_metric(&mut self, kind: MetricKind) -> Option<MetricValue> {
        let r = self.readings().await;
        match kind {
            MetricKind::Bitrate => self.strategy.bitrate(&r).map(MetricValue::Bitrate),
            MetricKind::BufferLevel => self
                .strategy
                .buffer_seconds(&r)
                .map(MetricValue::BufferSeconds),
            MetricKind::Resolution => self.strategy.resolution(&r).map(MetricValue::Resolution),
            MetricKind::FrameRate => self
                .strategy
                .frame_rate(&r, &mut self.fps_sample)
                .map(MetricValue::Fps),
        }
    }

    /// Read all metrics from one set of probes.
    pub async fn snapshot(&mut self) -> HealthSnapshot {
        let r = self.readings().await;
        let bitrate = self.strategy.bitrate(&r);
        let audio_level_db = self.settle("audio level", self.engine.audio_level_db().await);
        HealthSnapshot {
            bitrate_mbps: bitrate.map(|b| b.mbps),
            bitrate_estimated: bitrate.is_some_and(|b| b.estimated),
            buffer_seconds: self.strategy.buffer_seconds(&r),
            resolution: self.strategy.resolution(&r),
            fps: self.strategy.frame_rate(&r, &mut self.fps_sample),
            audio_level_db,
        }
    }

    pub async fn dispose(self) -> Result<(), EngineError> {
        self.engine.dispose().await
    }

    /// Query every probe.  Each one is isolated: a failure only empties its
    /// own field.
    async fn readings(&self) -> Readings {
        let e = self.engine.as_ref();
        Readings {
            native_buffer: self.settle("buffer length", e.native_buffer_length().await),
            report: self.settle("metrics report", e.metrics_report().await),
            buffered: match e.buffered_ranges().await {
                Ok(ranges) => ranges,
                Err(err) => {
                    debug!("channel {}: buffered ranges unavailable: {}", self.channel_id, err);
                    Vec::new()
                }
            },
            current_time: self.settle("current time", e.current_time().await),
            active_bitrate_bps: self.settle("active bitrate", e.active_bitrate().await),
            bandwidth_bps: self.settle("bandwidth", e.bandwidth_estimate().await),
            decoded_bytes: self.settle("decoded bytes", e.decoded_bytes().await),
            elapsed_secs: self.loaded_at.elapsed().as_secs_f64(),
            video_size: self.settle("video size", e.video_size().await),
            decode_quality: self.settle("decode quality", e.decode_quality().await),
        }
    }

    fn settle<T>(&self, what: &str, result: Result<Option<T>, EngineError>) -> Option<T> {
        result.unwrap_or_else(|e| {
            debug!("channel {}: {} unavailable: {}", self.channel_id, what, e);
            None
        })
    }
}
