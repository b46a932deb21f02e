//! Channel registry import/export and the built-in default channels.

use serde_json::Value;
use std::collections::HashSet;

use crate::protocol::{ChannelDescriptor, ChannelEdit};

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration must be a JSON array of channels")]
    NotAnArray,

    #[error("first channel is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("channel {index} is malformed: {reason}")]
    BadChannel { index: usize, reason: String },

    #[error("duplicate channel id {0}")]
    DuplicateId(u32),
}

/// Field names accepted for each required descriptor field.
const REQUIRED_FIELDS: [(&str, &[&str]); 4] = [
    ("id", &["id"]),
    ("name", &["name"]),
    ("hls-url", &["hls", "hls-url"]),
    ("dash-url", &["dash", "dash-url"]),
];

/// Validate and parse an imported channel list.
///
/// The root must be an array; when non-empty, its first element must carry
/// all four descriptor fields.  Every element must then parse and ids must
/// be unique.  Nothing is applied here: callers replace the registry only on
/// `Ok`.
pub fn parse_import(text: &str) -> Result<Vec<ChannelDescriptor>, ImportError> {
    let root: Value = serde_json::from_str(text)?;
    let items = root.as_array().ok_or(ImportError::NotAnArray)?;

    if let Some(first) = items.first() {
        for (field, keys) in REQUIRED_FIELDS {
            let present = first
                .as_object()
                .is_some_and(|obj| keys.iter().any(|k| obj.contains_key(*k)));
            if !present {
                return Err(ImportError::MissingField(field));
            }
        }
    }

    let mut seen = HashSet::new();
    let mut channels = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let channel: ChannelDescriptor =
            serde_json::from_value(item.clone()).map_err(|e| ImportError::BadChannel {
                index,
                reason: e.to_string(),
            })?;
        if !seen.insert(channel.id) {
            return Err(ImportError::DuplicateId(channel.id));
        }
        channels.push(channel);
    }
    Ok(channels)
}

/// Pretty-printed JSON of the registry, as offered for download.
pub fn export_json(channels: &[ChannelDescriptor]) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(channels)?)
}

/// Apply endpoint edits by channel id.  Unknown ids are ignored.
/// Returns how many channels changed.
pub fn apply_edits(channels: &mut [ChannelDescriptor], edits: &[ChannelEdit]) -> usize {
    let mut changed = 0;
    for edit in edits {
        let Some(channel) = channels.iter_mut().find(|c| c.id == edit.id) else {
            continue;
        };
        let before = channel.clone();
        if let Some(hls) = &edit.hls {
            channel.hls = hls.trim().to_string();
        }
        if let Some(dash) = &edit.dash {
            channel.dash = dash.trim().to_string();
        }
        if *channel != before {
            changed += 1;
        }
    }
    changed
}

/// Channels used when the store holds no saved registry.
pub fn default_channels() -> Vec<ChannelDescriptor> {
    let defaults = [
        (
            "Big Buck Bunny",
            "https://test-streams.mux.dev/x36xhzz/x36xhzz.m3u8",
            "https://dash.akamaized.net/akamai/bbb_30fps/bbb_30fps.mpd",
        ),
        (
            "Bipbop",
            "https://devstreaming-cdn.apple.com/videos/streaming/examples/bipbop_16x9/bipbop_16x9_variant.m3u8",
            "https://dash.akamaized.net/dash264/TestCases/1a/netflix/exMPD_BIP_TC1.mpd",
        ),
        (
            "Tears of Steel",
            "https://demo.unified-streaming.com/k8s/features/stable/video/tears-of-steel/tears-of-steel.ism/.m3u8",
            "https://demo.unified-streaming.com/k8s/features/stable/video/tears-of-steel/tears-of-steel.ism/.mpd",
        ),
        (
            "Envivio",
            "https://test-streams.mux.dev/test_001/stream.m3u8",
            "https://dash.akamaized.net/envivio/EnvivioDash3/manifest.mpd",
        ),
    ];
    defaults
        .into_iter()
        .enumerate()
        .map(|(i, (name, hls, dash))| ChannelDescriptor {
            id: i as u32 + 1,
            name: name.to_string(),
            hls: hls.to_string(),
            dash: dash.to_string(),
        })
        .collect()
}
