//! Metric extraction strategies.
//!
//! Engines expose overlapping but different metric APIs.  Each strategy
//! walks a fixed fallback order over the raw `Readings` gathered from one
//! engine and returns a normalized value, or `None` when nothing in the
//! chain produced one.

use wall_proto::protocol::Resolution;

use super::{DecodeQuality, EngineKind, MetricsReport, TimeRange};

/// Frame rate reported when a known engine has no decode-quality API.
pub const APPROX_FPS: f64 = 30.0;

/// Raw probe results from one engine at one instant.  A probe that failed
/// or is unsupported leaves its field empty.
#[derive(Debug, Clone, Default)]
pub struct Readings {
    pub native_buffer: Option<f64>,
    pub report: Option<MetricsReport>,
    pub buffered: Vec<TimeRange>,
    pub current_time: Option<f64>,
    pub active_bitrate_bps: Option<f64>,
    pub bandwidth_bps: Option<f64>,
    pub decoded_bytes: Option<u64>,
    /// Seconds since the current source started loading.
    pub elapsed_secs: f64,
    pub video_size: Option<Resolution>,
    pub decode_quality: Option<DecodeQuality>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bitrate {
    pub mbps: f64,
    /// Average since load start rather than a rendition bitrate.
    pub estimated: bool,
}

impl Bitrate {
    fn exact(bps: f64) -> Option<Self> {
        (bps > 0.0).then(|| Bitrate {
            mbps: bps / 1_000_000.0,
            estimated: false,
        })
    }
}

/// Previous decode-quality sample, kept per instance for delta fps.
pub type FpsSample = DecodeQuality;

pub trait MetricStrategy: Send + Sync {
    fn buffer_seconds(&self, r: &Readings) -> Option<f64>;
    fn bitrate(&self, r: &Readings) -> Option<Bitrate>;
    /// Estimate fps and store the current sample into `prev`.
    fn frame_rate(&self, r: &Readings, prev: &mut Option<FpsSample>) -> Option<f64>;

    fn resolution(&self, r: &Readings) -> Option<Resolution> {
        r.video_size.filter(|s| s.width > 0 && s.height > 0)
    }
}

pub struct HlsMetrics;
pub struct DashMetrics;
pub struct GenericMetrics;

pub fn strategy_for(kind: EngineKind) -> &'static dyn MetricStrategy {
    match kind {
        EngineKind::Hls => &HlsMetrics,
        EngineKind::Dash => &DashMetrics,
        EngineKind::Generic => &GenericMetrics,
    }
}

impl MetricStrategy for HlsMetrics {
    /// native buffer length → buffered ranges
    fn buffer_seconds(&self, r: &Readings) -> Option<f64> {
        r.native_buffer
            .map(clamp_non_negative)
            .or_else(|| buffer_from_ranges(&r.buffered, r.current_time?))
    }

    /// active level bitrate → bandwidth estimate → coarse average
    fn bitrate(&self, r: &Readings) -> Option<Bitrate> {
        r.active_bitrate_bps
            .and_then(Bitrate::exact)
            .or_else(|| r.bandwidth_bps.and_then(Bitrate::exact))
            .or_else(|| coarse_bitrate(r.decoded_bytes?, r.elapsed_secs))
    }

    fn frame_rate(&self, r: &Readings, prev: &mut Option<FpsSample>) -> Option<f64> {
        known_engine_fps(r, prev)
    }
}

impl MetricStrategy for DashMetrics {
    /// native buffer length → metrics report → buffered ranges
    fn buffer_seconds(&self, r: &Readings) -> Option<f64> {
        r.native_buffer
            .or_else(|| r.report.and_then(|m| m.buffer_level))
            .map(clamp_non_negative)
            .or_else(|| buffer_from_ranges(&r.buffered, r.current_time?))
    }

    /// metrics report → active representation → throughput → coarse average
    fn bitrate(&self, r: &Readings) -> Option<Bitrate> {
        r.report
            .and_then(|m| m.bitrate_bps)
            .and_then(Bitrate::exact)
            .or_else(|| r.active_bitrate_bps.and_then(Bitrate::exact))
            .or_else(|| r.bandwidth_bps.and_then(Bitrate::exact))
            .or_else(|| coarse_bitrate(r.decoded_bytes?, r.elapsed_secs))
    }

    fn frame_rate(&self, r: &Readings, prev: &mut Option<FpsSample>) -> Option<f64> {
        known_engine_fps(r, prev)
    }
}

impl MetricStrategy for GenericMetrics {
    fn buffer_seconds(&self, r: &Readings) -> Option<f64> {
        buffer_from_ranges(&r.buffered, r.current_time?)
    }

    fn bitrate(&self, r: &Readings) -> Option<Bitrate> {
        r.active_bitrate_bps
            .and_then(Bitrate::exact)
            .or_else(|| coarse_bitrate(r.decoded_bytes?, r.elapsed_secs))
    }

    fn frame_rate(&self, r: &Readings, prev: &mut Option<FpsSample>) -> Option<f64> {
        let current = r.decode_quality?;
        let previous = prev.replace(current);
        fps_between(previous?, current)
    }
}

/// Decode-quality delta when the API exists, otherwise the approximate
/// constant.
fn known_engine_fps(r: &Readings, prev: &mut Option<FpsSample>) -> Option<f64> {
    match r.decode_quality {
        Some(current) => {
            let previous = prev.replace(current);
            fps_between(previous?, current)
        }
        None => Some(APPROX_FPS),
    }
}

/// Seconds of media buffered ahead of `position`.
///
/// Live ranges can be disjoint, so the range containing the position is
/// used; if none contains it, the end of the last range.  Never negative.
pub fn buffer_from_ranges(ranges: &[TimeRange], position: f64) -> Option<f64> {
    let range = ranges
        .iter()
        .find(|r| r.contains(position))
        .or_else(|| ranges.last())?;
    Some(clamp_non_negative(range.end - position))
}

/// Instantaneous fps between two decode-quality samples.  Only defined when
/// both the frame delta and the time delta are positive.
pub fn fps_between(prev: FpsSample, current: FpsSample) -> Option<f64> {
    let frames = current.total_frames.checked_sub(prev.total_frames)?;
    let secs = current.time_secs - prev.time_secs;
    if frames == 0 || secs <= 0.0 {
        return None;
    }
    Some(frames as f64 / secs)
}

/// Dead-reckoned average since load start: cumulative bytes over elapsed
/// time.  Not an instantaneous bitrate.
pub fn coarse_bitrate(decoded_bytes: u64, elapsed_secs: f64) -> Option<Bitrate> {
    if decoded_bytes == 0 || elapsed_secs <= 0.0 {
        return None;
    }
    Some(Bitrate {
        mbps: decoded_bytes as f64 * 8.0 / elapsed_secs / 1_000_000.0,
        estimated: true,
    })
}

fn clamp_non_negative(secs: f64) -> f64 {
    if secs.is_nan() {
        0.0
    } else {
        secs.max(0.0)
    }
}
