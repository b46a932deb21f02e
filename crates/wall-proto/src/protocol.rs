use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::layout::LayoutMode;

/// One logical feed with an endpoint per streaming protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: u32,
    pub name: String,
    #[serde(alias = "hls-url")]
    pub hls: String,
    #[serde(alias = "dash-url")]
    pub dash: String,
}

impl ChannelDescriptor {
    pub fn url_for(&self, protocol: ProtocolMode) -> &str {
        match protocol {
            ProtocolMode::Hls => &self.hls,
            ProtocolMode::Dash => &self.dash,
        }
    }
}

/// Grid-wide streaming protocol.  Every channel plays the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    #[default]
    Hls,
    Dash,
}

impl ProtocolMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolMode::Hls => "hls",
            ProtocolMode::Dash => "dash",
        }
    }

    /// MIME type announced for sources of this protocol.
    pub fn mime_type(self) -> &'static str {
        match self {
            ProtocolMode::Hls => "application/x-mpegURL",
            ProtocolMode::Dash => "application/dash+xml",
        }
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hls" => Ok(ProtocolMode::Hls),
            "dash" => Ok(ProtocolMode::Dash),
            other => anyhow::bail!("unknown protocol '{}'", other),
        }
    }
}

/// Per-channel status as shown on the channel's status surface.
///
/// Transitions:
///   Idle -> Loading -> Playing | Buffering -> Errored -> (retry) -> Loading
///   Playing | Buffering -> Idle   (explicit stop / pause)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Playing,
    Buffering,
    Errored,
}

/// Operations a client (keyboard, HTTP) can request from the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    ToggleMute,
    TogglePlay,
    ReloadAll,
    ToggleConfigPanel,
    SwitchProtocol { protocol: ProtocolMode },
    SetLayout { layout: LayoutMode },
    /// Replace the whole registry (already validated import).
    ReplaceChannels { channels: Vec<ChannelDescriptor> },
    /// Edit endpoints of existing channels.
    SaveChannels { edits: Vec<ChannelEdit> },
    /// Write the registry as pretty JSON to `path`.
    Export { path: PathBuf },
    GetState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEdit {
    pub id: u32,
    #[serde(default)]
    pub hls: Option<String>,
    #[serde(default)]
    pub dash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Best-effort telemetry read of one channel.  Every field degrades
/// independently to `None` when the engine cannot provide it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub bitrate_mbps: Option<f64>,
    /// Set when `bitrate_mbps` is the coarse average since load start
    /// (cumulative bytes over elapsed time) rather than a rendition bitrate.
    #[serde(default)]
    pub bitrate_estimated: bool,
    pub buffer_seconds: Option<f64>,
    pub resolution: Option<Resolution>,
    pub fps: Option<f64>,
    #[serde(default)]
    pub audio_level_db: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferTier {
    Good,
    Warning,
    Error,
}

/// A snapshot plus its severity classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub snapshot: HealthSnapshot,
    pub buffer_tier: Option<BufferTier>,
    pub bitrate_healthy: Option<bool>,
}

/// What display clients see of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelView {
    pub channel: ChannelDescriptor,
    pub status: PlaybackStatus,
    pub current_url: Option<String>,
    pub muted: bool,
    pub paused: bool,
    pub retry_pending: bool,
    pub health: Option<ChannelHealth>,
}

impl ChannelView {
    pub fn new(channel: ChannelDescriptor) -> Self {
        Self {
            channel,
            status: PlaybackStatus::Idle,
            current_url: None,
            muted: true,
            paused: false,
            retry_pending: false,
            health: None,
        }
    }
}

/// Full state of the grid.  `rev` increments on every change so clients can
/// detect missed updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    #[serde(default)]
    pub rev: u64,
    pub protocol: ProtocolMode,
    pub layout: LayoutMode,
    pub config_panel_open: bool,
    pub audio_context_ready: bool,
    pub channels: Vec<ChannelView>,
}

impl GridState {
    pub fn registry(&self) -> Vec<ChannelDescriptor> {
        self.channels.iter().map(|v| v.channel.clone()).collect()
    }

    pub fn channel_mut(&mut self, id: u32) -> Option<&mut ChannelView> {
        self.channels.iter_mut().find(|v| v.channel.id == id)
    }
}
