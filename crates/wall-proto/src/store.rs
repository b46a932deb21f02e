//! Key-value blob store backing the persisted grid configuration.
//!
//! Values are opaque strings (the channel registry is stored as a JSON
//! array string), the whole map is written as one JSON file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

pub const KEY_CHANNELS: &str = "channelConfig";
pub const KEY_PROTOCOL: &str = "currentProtocol";
pub const KEY_LAYOUT: &str = "currentLayout";

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl Store {
    /// Open the store at `path`.  A missing or unreadable file yields an
    /// empty store; it is (re)created on the next flush.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("store: ignoring unreadable {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns the previous value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.to_string(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Write the store to disk (tmp file + rename so a crash never leaves a
    /// truncated store behind).
    pub async fn flush(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
