use crate::layout::LayoutMode;
use crate::protocol::{
    ChannelDescriptor, ChannelEdit, ChannelHealth, ChannelView, GridState, ProtocolMode,
};
use crate::registry;
use crate::store::{Store, KEY_CHANNELS, KEY_LAYOUT, KEY_PROTOCOL};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Shared view of the grid plus its persisted configuration.
///
/// The supervisor is the only writer of per-channel runtime fields; HTTP and
/// other readers take snapshots via `get_state`.
pub struct StateManager {
    state: RwLock<GridState>,
    store: Mutex<Store>,
}

impl StateManager {
    /// Restore registry, protocol and layout from the store, falling back to
    /// defaults for anything missing or unreadable.
    pub fn new(store: Store) -> Self {
        let channels = match store.get(KEY_CHANNELS) {
            Some(saved) => match registry::parse_import(saved) {
                Ok(channels) => {
                    info!("Loaded saved configuration ({} channels)", channels.len());
                    channels
                }
                Err(e) => {
                    warn!("Failed to load saved config: {}", e);
                    registry::default_channels()
                }
            },
            None => registry::default_channels(),
        };
        let protocol = store
            .get(KEY_PROTOCOL)
            .and_then(|s| s.parse::<ProtocolMode>().ok())
            .unwrap_or_default();
        let layout = store
            .get(KEY_LAYOUT)
            .and_then(|s| s.parse::<LayoutMode>().ok())
            .unwrap_or_default();

        let state = GridState {
            rev: 1,
            protocol,
            layout,
            config_panel_open: false,
            audio_context_ready: false,
            channels: channels.into_iter().map(ChannelView::new).collect(),
        };

        Self {
            state: RwLock::new(state),
            store: Mutex::new(store),
        }
    }

    pub async fn get_state(&self) -> GridState {
        self.state.read().await.clone()
    }

    pub async fn registry(&self) -> Vec<ChannelDescriptor> {
        self.state.read().await.registry()
    }

    pub async fn protocol(&self) -> ProtocolMode {
        self.state.read().await.protocol
    }

    pub async fn layout(&self) -> LayoutMode {
        self.state.read().await.layout
    }

    pub async fn set_protocol(&self, protocol: ProtocolMode) -> anyhow::Result<()> {
        self.persist(KEY_PROTOCOL, protocol.as_str().to_string()).await?;
        let mut state = self.state.write().await;
        state.protocol = protocol;
        state.rev += 1;
        Ok(())
    }

    pub async fn set_layout(&self, layout: LayoutMode) -> anyhow::Result<()> {
        self.persist(KEY_LAYOUT, layout.as_str().to_string()).await?;
        let mut state = self.state.write().await;
        state.layout = layout;
        state.rev += 1;
        Ok(())
    }

    /// Replace the registry wholesale.  Runtime fields start over.
    pub async fn replace_channels(&self, channels: Vec<ChannelDescriptor>) -> anyhow::Result<()> {
        self.persist(KEY_CHANNELS, registry::export_json(&channels)?)
            .await?;
        let mut state = self.state.write().await;
        state.channels = channels.into_iter().map(ChannelView::new).collect();
        state.rev += 1;
        Ok(())
    }

    /// Apply endpoint edits and persist the registry.  Returns the number of
    /// channels that changed.
    pub async fn save_edits(&self, edits: &[ChannelEdit]) -> anyhow::Result<usize> {
        let mut state = self.state.write().await;
        let mut channels = state.registry();
        let changed = registry::apply_edits(&mut channels, edits);
        self.persist(KEY_CHANNELS, registry::export_json(&channels)?)
            .await?;
        for (view, channel) in state.channels.iter_mut().zip(channels) {
            view.channel = channel;
        }
        state.rev += 1;
        Ok(changed)
    }

    /// Mutate one channel's view.  Unknown ids are ignored.
    pub async fn update_channel<F>(&self, id: u32, f: F)
    where
        F: FnOnce(&mut ChannelView),
    {
        let mut state = self.state.write().await;
        if let Some(view) = state.channel_mut(id) {
            f(view);
            state.rev += 1;
        }
    }

    pub async fn set_health(&self, id: u32, health: Option<ChannelHealth>) {
        self.update_channel(id, |view| view.health = health).await;
    }

    pub async fn toggle_config_panel(&self) -> bool {
        let mut state = self.state.write().await;
        state.config_panel_open = !state.config_panel_open;
        state.rev += 1;
        state.config_panel_open
    }

    pub async fn set_audio_context_ready(&self) {
        let mut state = self.state.write().await;
        if !state.audio_context_ready {
            state.audio_context_ready = true;
            state.rev += 1;
        }
    }

    /// Write `key` through to disk.  On failure the store is rolled back,
    /// so callers apply the change in memory only after this succeeds.
    async fn persist(&self, key: &str, value: String) -> anyhow::Result<()> {
        let mut store = self.store.lock().await;
        let previous = store.set(key, value);
        if let Err(e) = store.flush().await {
            match previous {
                Some(old) => store.set(key, old),
                None => store.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}
