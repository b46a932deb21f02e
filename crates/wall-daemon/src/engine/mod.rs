//! Playback engine facade.
//!
//! An engine is a black box that plays one adaptive stream into one render
//! target.  `PlaybackEngine` is the uniform surface the supervisor drives;
//! the capability probes at the bottom of the trait are the raw metric APIs,
//! which differ per engine.  `metrics` turns those raw readings into
//! normalized values with a per-protocol fallback order, and `adapter` ties
//! an engine to that strategy.

pub mod adapter;
pub mod metrics;
#[cfg(test)]
pub mod mock;
pub mod mpv;

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use wall_proto::layout::Tile;
use wall_proto::protocol::{ProtocolMode, Resolution};

pub use adapter::EngineAdapter;

/// Which family of streaming engine sits behind a handle.  Decides the
/// metric fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Hls,
    Dash,
    /// Anything else: only the generic buffered-range/decode APIs are trusted.
    Generic,
}

impl EngineKind {
    pub fn for_protocol(protocol: ProtocolMode) -> Self {
        match protocol {
            ProtocolMode::Hls => EngineKind::Hls,
            ProtocolMode::Dash => EngineKind::Dash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Play was refused by autoplay policy.  Expected; resolves on user
    /// interaction.
    #[error("autoplay blocked: {0}")]
    AutoplayBlocked(String),

    #[error("engine already disposed")]
    Disposed,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Lifecycle notifications, delivered in the engine's own order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LoadStart,
    Playing,
    /// Stalled waiting for data.
    Buffering,
    Paused { seeking: bool },
    Error(String),
    RateChanged(f64),
}

/// Addressable surfaces for one channel, rebuilt on every full load.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTarget {
    pub channel_id: u32,
    pub label: String,
    /// Bumped on every rebuild of the grid.
    pub epoch: u64,
    pub tile: Option<Tile>,
}

impl RenderTarget {
    pub fn media_id(&self) -> String {
        format!("player-{}", self.channel_id)
    }

    /// Identity of this concrete surface; differs across rebuilds.
    pub fn key(&self) -> (u32, u64) {
        (self.channel_id, self.epoch)
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub muted: bool,
    pub autoplay: bool,
    /// Live-edge catch-up.  The supervisor always passes `false`.
    pub live_catchup: bool,
    pub binary: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Cumulative decoded-frame count at a point in (wall-clock) seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeQuality {
    pub total_frames: u64,
    pub time_secs: f64,
}

/// Engine-native metrics report, as far as the engine fills it in.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsReport {
    pub buffer_level: Option<f64>,
    pub bitrate_bps: Option<f64>,
}

#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn set_source(&self, url: &str, protocol: ProtocolMode) -> Result<(), EngineError>;
    async fn play(&self) -> Result<(), EngineError>;
    async fn pause(&self) -> Result<(), EngineError>;
    async fn is_paused(&self) -> Result<bool, EngineError>;
    async fn set_muted(&self, muted: bool) -> Result<(), EngineError>;
    async fn is_muted(&self) -> Result<bool, EngineError>;
    async fn set_playback_rate(&self, rate: f64) -> Result<(), EngineError>;
    /// Move/resize onto a (re-evaluated) render target.
    async fn apply_target(&self, target: &RenderTarget) -> Result<(), EngineError>;
    /// Attach the audio-level tap.  Most engines fail when attached twice.
    async fn attach_audio_tap(&self) -> Result<(), EngineError>;
    async fn dispose(&self) -> Result<(), EngineError>;

    // Capability probes.  `Ok(None)` means this engine does not expose it.

    async fn native_buffer_length(&self) -> Result<Option<f64>, EngineError> {
        Ok(None)
    }

    async fn metrics_report(&self) -> Result<Option<MetricsReport>, EngineError> {
        Ok(None)
    }

    async fn buffered_ranges(&self) -> Result<Vec<TimeRange>, EngineError> {
        Ok(Vec::new())
    }

    async fn current_time(&self) -> Result<Option<f64>, EngineError> {
        Ok(None)
    }

    /// Bitrate of the rendition currently playing, bits/s.
    async fn active_bitrate(&self) -> Result<Option<f64>, EngineError> {
        Ok(None)
    }

    /// Engine's bandwidth/throughput estimate, bits/s.
    async fn bandwidth_estimate(&self) -> Result<Option<f64>, EngineError> {
        Ok(None)
    }

    /// Cumulative bytes decoded since load start.
    async fn decoded_bytes(&self) -> Result<Option<u64>, EngineError> {
        Ok(None)
    }

    async fn video_size(&self) -> Result<Option<Resolution>, EngineError> {
        Ok(None)
    }

    async fn decode_quality(&self) -> Result<Option<DecodeQuality>, EngineError> {
        Ok(None)
    }

    async fn audio_level_db(&self) -> Result<Option<f32>, EngineError> {
        Ok(None)
    }
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Create an engine bound to `target` and start loading `url`.  Events
    /// are pushed into `events` until the engine is disposed.
    async fn create(
        &self,
        target: &RenderTarget,
        url: &str,
        protocol: ProtocolMode,
        options: &EngineOptions,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn PlaybackEngine>, EngineError>;
}
