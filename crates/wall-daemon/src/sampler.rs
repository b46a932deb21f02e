use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wall_proto::config::SamplerConfig;
use wall_proto::protocol::{BufferTier, ChannelHealth, HealthSnapshot};

use crate::core::GridEvent;
use crate::engine::EngineAdapter;

/// Turns raw adapter snapshots into classified channel health.
#[derive(Debug, Clone)]
pub struct HealthSampler {
    buffer_good_secs: f64,
    buffer_warning_secs: f64,
    healthy_bitrate_mbps: f64,
}

impl HealthSampler {
    pub fn new(config: &SamplerConfig) -> Self {
        Self {
            buffer_good_secs: config.buffer_good_secs,
            buffer_warning_secs: config.buffer_warning_secs,
            healthy_bitrate_mbps: config.healthy_bitrate_mbps,
        }
    }

    pub fn buffer_tier(&self, secs: f64) -> BufferTier {
        if secs > self.buffer_good_secs {
            BufferTier::Good
        } else if secs > self.buffer_warning_secs {
            BufferTier::Warning
        } else {
            BufferTier::Error
        }
    }

    pub fn bitrate_healthy(&self, mbps: f64) -> bool {
        mbps > self.healthy_bitrate_mbps
    }

    pub fn classify(&self, snapshot: HealthSnapshot) -> ChannelHealth {
        ChannelHealth {
            buffer_tier: snapshot.buffer_seconds.map(|s| self.buffer_tier(s)),
            bitrate_healthy: snapshot.bitrate_mbps.map(|b| self.bitrate_healthy(b)),
            snapshot,
        }
    }

    pub async fn sample(&self, adapter: &mut EngineAdapter) -> ChannelHealth {
        self.classify(adapter.snapshot().await)
    }
}

/// Fire `SampleTick` into the core loop every `interval`.  The first tick
/// comes one interval after start.
pub fn spawn_ticker(interval: Duration, tx: mpsc::Sender<GridEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(GridEvent::SampleTick).await.is_err() {
                break;
            }
        }
    })
}
