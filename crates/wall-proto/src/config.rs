use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Delay between a playback error and the retry of that channel.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Start every channel muted (autoplay of unmuted media is commonly refused).
    #[serde(default = "default_true")]
    pub autoplay_muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub interval_ms: u64,
    /// Buffer above this is `good`.
    #[serde(default = "default_buffer_good_secs")]
    pub buffer_good_secs: f64,
    /// Buffer above this (and up to `buffer_good_secs`) is `warning`; at or
    /// below it is `error`.
    #[serde(default = "default_buffer_warning_secs")]
    pub buffer_warning_secs: f64,
    #[serde(default = "default_healthy_bitrate_mbps")]
    pub healthy_bitrate_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Explicit mpv path; searched for when unset.
    #[serde(default)]
    pub mpv_binary: Option<PathBuf>,
    /// Live-edge catch-up (playback speed-up).  Kept off; the adapter also
    /// pins the rate back to 1.0 whenever an engine changes it.
    #[serde(default)]
    pub live_catchup: bool,
    #[serde(default = "default_screen_width")]
    pub screen_width: u32,
    #[serde(default = "default_screen_height")]
    pub screen_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Key-value blob store holding channelConfig / currentProtocol / currentLayout.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl SupervisorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            autoplay_muted: true,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sample_interval_ms(),
            buffer_good_secs: default_buffer_good_secs(),
            buffer_warning_secs: default_buffer_warning_secs(),
            healthy_bitrate_mbps: default_healthy_bitrate_mbps(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mpv_binary: None,
            live_catchup: false,
            screen_width: default_screen_width(),
            screen_height: default_screen_height(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_sample_interval_ms() -> u64 {
    2000
}

fn default_buffer_good_secs() -> f64 {
    2.0
}

fn default_buffer_warning_secs() -> f64 {
    1.0
}

fn default_healthy_bitrate_mbps() -> f64 {
    1.0
}

fn default_screen_width() -> u32 {
    1920
}

fn default_screen_height() -> u32 {
    1080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_store_path() -> PathBuf {
    platform::data_dir().join("store.json")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
