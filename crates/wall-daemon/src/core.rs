/// GridCore: single-owner event loop for the whole grid.
///
/// Owns one `PlaybackInstance` per registry channel and is the only code that
/// creates, drives or disposes engines.  Everything else talks to it through
/// `GridEvent` messages: client commands from the keyboard and HTTP surfaces,
/// engine lifecycle events (forwarded per instance), retry timers and the
/// health sampler tick.
///
/// Each instance carries a `generation` and a cancellation token.  Forwarded
/// events and retry timers are stamped with the generation they were created
/// for, so anything that arrives after its instance was torn down is dropped.
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wall_proto::config::Config;
use wall_proto::layout::{LayoutMode, Screen};
use wall_proto::protocol::{
    ChannelDescriptor, ChannelEdit, Command, PlaybackStatus, ProtocolMode,
};
use wall_proto::registry;
use wall_proto::state::StateManager;

use crate::audio::AudioHub;
use crate::engine::{
    EngineAdapter, EngineError, EngineEvent, EngineFactory, EngineOptions, RenderTarget,
};
use crate::sampler::{self, HealthSampler};
use crate::BroadcastMessage;

const ENGINE_EVENT_BUFFER: usize = 32;
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(1);

// ── GridEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the GridCore loop.
#[derive(Debug)]
pub enum GridEvent {
    /// A command from the keyboard or HTTP API.
    ClientCommand(Command),
    /// Lifecycle event from one channel's engine.
    Engine {
        channel_id: u32,
        generation: u64,
        event: EngineEvent,
    },
    /// Retry delay elapsed for an errored channel.
    RetryDue { channel_id: u32, generation: u64 },
    /// Health sampling cadence.
    SampleTick,
    Shutdown,
}

// ── PlaybackInstance ──────────────────────────────────────────────────────────

struct PlaybackInstance {
    channel_id: u32,
    generation: u64,
    target: RenderTarget,
    /// `None` when the engine could not be created; the retry re-creates it.
    adapter: Option<EngineAdapter>,
    current_url: String,
    protocol: ProtocolMode,
    status: PlaybackStatus,
    /// Pending retry timer.  At most one per instance.
    retry: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    /// Task forwarding this engine's events into the core loop.
    forwarder: Option<JoinHandle<()>>,
}

impl PlaybackInstance {
    fn label(&self) -> &str {
        &self.target.label
    }
}

/// What every engine creation needs, split out so it can be borrowed next to
/// a `&mut PlaybackInstance`.
struct EngineContext {
    factory: Arc<dyn EngineFactory>,
    options: EngineOptions,
    event_tx: mpsc::Sender<GridEvent>,
}

// ── GridCore ──────────────────────────────────────────────────────────────────

pub struct GridCore {
    config: Config,
    state_manager: Arc<StateManager>,
    ctx: EngineContext,
    sampler: HealthSampler,
    audio: AudioHub,
    /// Live instances in registry order.
    instances: Vec<PlaybackInstance>,
    /// Render-target epoch; bumped on every full load.
    epoch: u64,
    next_generation: u64,
    sample_ticker: Option<JoinHandle<()>>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl GridCore {
    pub fn new(
        config: Config,
        state_manager: Arc<StateManager>,
        factory: Arc<dyn EngineFactory>,
        event_tx: mpsc::Sender<GridEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let options = EngineOptions {
            muted: config.supervisor.autoplay_muted,
            autoplay: true,
            live_catchup: config.engine.live_catchup,
            binary: config.engine.mpv_binary.clone(),
        };
        Self {
            sampler: HealthSampler::new(&config.sampler),
            config,
            state_manager,
            ctx: EngineContext {
                factory,
                options,
                event_tx,
            },
            audio: AudioHub::new(),
            instances: Vec::new(),
            epoch: 0,
            next_generation: 0,
            sample_ticker: None,
            broadcast_tx,
        }
    }

    /// Run the core event loop.  Loads the grid first; returns after a
    /// `Shutdown` event or when every sender is gone, with all instances
    /// disposed.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<GridEvent>) -> anyhow::Result<()> {
        info!("GridCore: starting event loop");

        self.sample_ticker = Some(sampler::spawn_ticker(
            self.config.sampler.interval(),
            self.ctx.event_tx.clone(),
        ));

        let protocol = self.state_manager.protocol().await;
        self.load_all(protocol).await;

        loop {
            match event_rx.recv().await {
                None => {
                    info!("GridCore: event channel closed, shutting down");
                    break;
                }
                Some(evt) => {
                    if !self.handle_event(evt).await {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Dispatch one event.  Returns `false` when the loop should stop.
    pub async fn handle_event(&mut self, evt: GridEvent) -> bool {
        match evt {
            GridEvent::Shutdown => {
                info!("GridCore: shutdown requested");
                return false;
            }
            GridEvent::ClientCommand(cmd) => {
                info!("GridCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("GridCore: command error: {}", e);
                }
            }
            GridEvent::Engine {
                channel_id,
                generation,
                event,
            } => self.handle_engine_event(channel_id, generation, event).await,
            GridEvent::RetryDue {
                channel_id,
                generation,
            } => self.on_retry_due(channel_id, generation).await,
            GridEvent::SampleTick => self.sample_health().await,
        }
        true
    }

    // ── command handlers ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        if !matches!(cmd, Command::GetState) {
            self.on_user_interaction().await;
        }
        match cmd {
            Command::ToggleMute => self.toggle_mute_all().await,
            Command::TogglePlay => self.toggle_play_all().await,
            Command::ReloadAll => self.reload_all().await,
            Command::ToggleConfigPanel => {
                let open = self.state_manager.toggle_config_panel().await;
                debug!("Config panel {}", if open { "shown" } else { "hidden" });
            }
            Command::SwitchProtocol { protocol } => self.switch_protocol(protocol).await,
            Command::SetLayout { layout } => self.relayout(layout).await?,
            Command::ReplaceChannels { channels } => self.replace_channels(channels).await?,
            Command::SaveChannels { edits } => self.save_channels(&edits).await?,
            Command::Export { path } => self.export(&path).await?,
            Command::GetState => {}
        }
        self.notify();
        Ok(())
    }

    /// The audio context may only be created in response to user input.
    async fn on_user_interaction(&mut self) {
        if !self.audio.resume() {
            return;
        }
        self.state_manager.set_audio_context_ready().await;
        for inst in &self.instances {
            if let Some(adapter) = &inst.adapter {
                self.audio.attach(&inst.target, adapter).await;
            }
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    /// Dispose every instance, rebuild render targets, then create one
    /// instance per channel in registry order and start muted autoplay.
    pub async fn load_all(&mut self, protocol: ProtocolMode) {
        self.dispose_all().await;
        self.epoch += 1;

        let channels = self.state_manager.registry().await;
        let layout = self.state_manager.layout().await;
        let screen = self.screen();
        info!(
            "Loading {} channels over {} (epoch {})",
            channels.len(),
            protocol,
            self.epoch
        );

        for (index, channel) in channels.iter().enumerate() {
            let target = RenderTarget {
                channel_id: channel.id,
                label: channel.name.clone(),
                epoch: self.epoch,
                tile: layout.tile(index, screen),
            };
            self.next_generation += 1;
            let mut inst = PlaybackInstance {
                channel_id: channel.id,
                generation: self.next_generation,
                target,
                adapter: None,
                current_url: channel.url_for(protocol).to_string(),
                protocol,
                status: PlaybackStatus::Loading,
                retry: None,
                cancel: CancellationToken::new(),
                forwarder: None,
            };

            let muted = self.ctx.options.muted;
            let url = inst.current_url.clone();
            self.state_manager
                .update_channel(channel.id, |v| {
                    v.status = PlaybackStatus::Loading;
                    v.current_url = Some(url);
                    v.muted = muted;
                    v.paused = false;
                    v.retry_pending = false;
                    v.health = None;
                })
                .await;

            let opened = open_engine(&self.ctx, &mut self.audio, &mut inst).await;
            self.instances.push(inst);
            if let Err(e) = opened {
                let idx = self.instances.len() - 1;
                self.on_error(idx, &e.to_string()).await;
            }
        }
        self.notify();
    }

    pub async fn reload_all(&mut self) {
        let protocol = self.state_manager.protocol().await;
        self.load_all(protocol).await;
    }

    /// Dispose every instance and cancel all timers.
    pub async fn teardown(&mut self) {
        if let Some(ticker) = self.sample_ticker.take() {
            ticker.abort();
        }
        self.dispose_all().await;
        info!("GridCore: all players disposed");
    }

    async fn dispose_all(&mut self) {
        let instances = std::mem::take(&mut self.instances);
        for inst in instances {
            dispose_instance(&mut self.audio, inst).await;
        }
    }

    pub async fn switch_protocol(&mut self, protocol: ProtocolMode) {
        if self.state_manager.protocol().await == protocol {
            debug!("Protocol already {}", protocol);
            return;
        }
        info!("Switching protocol to {}", protocol);
        if let Err(e) = self.state_manager.set_protocol(protocol).await {
            let current = self.state_manager.protocol().await;
            error!("Failed to save protocol, staying on {}: {}", current, e);
            return;
        }
        self.load_all(protocol).await;
    }

    /// If every instance is muted unmute all, otherwise mute all.
    pub async fn toggle_mute_all(&mut self) {
        let mut all_muted = true;
        for inst in &self.instances {
            if let Some(adapter) = &inst.adapter {
                if !adapter.engine().is_muted().await.unwrap_or(true) {
                    all_muted = false;
                    break;
                }
            }
        }
        let muted = !all_muted;
        for inst in &self.instances {
            let Some(adapter) = &inst.adapter else { continue };
            match adapter.engine().set_muted(muted).await {
                Ok(()) => {
                    self.state_manager
                        .update_channel(inst.channel_id, |v| v.muted = muted)
                        .await
                }
                Err(e) => warn!("Failed to set mute on {}: {}", inst.label(), e),
            }
        }
        info!("{} all channels", if muted { "Muted" } else { "Unmuted" });
    }

    /// If every instance is paused play all, otherwise pause all.
    pub async fn toggle_play_all(&mut self) {
        let mut all_paused = true;
        for inst in &self.instances {
            if let Some(adapter) = &inst.adapter {
                if !adapter.engine().is_paused().await.unwrap_or(true) {
                    all_paused = false;
                    break;
                }
            }
        }
        for inst in &self.instances {
            let Some(adapter) = &inst.adapter else { continue };
            let result = if all_paused {
                adapter.engine().play().await
            } else {
                adapter.engine().pause().await
            };
            match result {
                Ok(()) => {
                    let paused = !all_paused;
                    self.state_manager
                        .update_channel(inst.channel_id, |v| v.paused = paused)
                        .await
                }
                Err(EngineError::AutoplayBlocked(reason)) => {
                    info!("Play for {} blocked: {}", inst.label(), reason)
                }
                Err(e) => warn!("Play failed for {}: {}", inst.label(), e),
            }
        }
    }

    /// Apply a new layout: every live instance gets its re-evaluated tile.
    pub async fn relayout(&mut self, layout: LayoutMode) -> anyhow::Result<()> {
        self.state_manager.set_layout(layout).await?;
        let screen = self.screen();
        for (index, inst) in self.instances.iter_mut().enumerate() {
            inst.target.tile = layout.tile(index, screen);
            if let Some(adapter) = &inst.adapter {
                if let Err(e) = adapter.engine().apply_target(&inst.target).await {
                    warn!("Failed to move {}: {}", inst.target.media_id(), e);
                }
            }
        }
        info!("Layout set to {}", layout);
        Ok(())
    }

    async fn replace_channels(&mut self, channels: Vec<ChannelDescriptor>) -> anyhow::Result<()> {
        let mut ids = HashSet::new();
        if let Some(dup) = channels.iter().find(|c| !ids.insert(c.id)) {
            anyhow::bail!("duplicate channel id {}, registry left unchanged", dup.id);
        }
        info!("Replacing channel registry ({} channels)", channels.len());
        self.state_manager.replace_channels(channels).await?;
        self.reload_all().await;
        Ok(())
    }

    async fn save_channels(&mut self, edits: &[ChannelEdit]) -> anyhow::Result<()> {
        let changed = self.state_manager.save_edits(edits).await?;
        info!("Saved channel configuration ({} changed)", changed);
        self.reload_all().await;
        Ok(())
    }

    async fn export(&self, path: &Path) -> anyhow::Result<()> {
        let json = registry::export_json(&self.state_manager.registry().await)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        info!("Exported channel configuration to {}", path.display());
        Ok(())
    }

    // ── engine events ─────────────────────────────────────────────────────────

    fn live_index(&self, channel_id: u32, generation: u64) -> Option<usize> {
        self.instances.iter().position(|i| {
            i.channel_id == channel_id && i.generation == generation && !i.cancel.is_cancelled()
        })
    }

    async fn handle_engine_event(&mut self, channel_id: u32, generation: u64, event: EngineEvent) {
        let Some(idx) = self.live_index(channel_id, generation) else {
            debug!(
                "Dropping {:?} from stale instance {}/{}",
                event, channel_id, generation
            );
            return;
        };
        if let Some(adapter) = &self.instances[idx].adapter {
            adapter.observe(&event).await;
        }

        match event {
            EngineEvent::LoadStart => self.set_status(idx, PlaybackStatus::Loading).await,
            EngineEvent::Playing => self.set_status(idx, PlaybackStatus::Playing).await,
            EngineEvent::Buffering => self.set_status(idx, PlaybackStatus::Buffering).await,
            EngineEvent::Paused { seeking: false } => {
                self.set_status(idx, PlaybackStatus::Idle).await
            }
            EngineEvent::Paused { seeking: true } | EngineEvent::RateChanged(_) => {}
            EngineEvent::Error(reason) => self.on_error(idx, &reason).await,
        }
    }

    async fn set_status(&mut self, idx: usize, status: PlaybackStatus) {
        let inst = &mut self.instances[idx];
        // Errored holds until the pending retry runs.
        if inst.retry.is_some() || inst.status == status {
            return;
        }
        debug!("{}: {:?} -> {:?}", inst.label(), inst.status, status);
        inst.status = status;
        self.state_manager
            .update_channel(inst.channel_id, |v| v.status = status)
            .await;
        self.notify();
    }

    /// Mark the instance errored and schedule exactly one retry.
    async fn on_error(&mut self, idx: usize, reason: &str) {
        let inst = &mut self.instances[idx];
        error!("Error on {}: {}", inst.label(), reason);
        inst.status = PlaybackStatus::Errored;
        self.state_manager
            .update_channel(inst.channel_id, |v| {
                v.status = PlaybackStatus::Errored;
                v.retry_pending = true;
            })
            .await;
        self.notify();

        let inst = &mut self.instances[idx];
        if inst.retry.is_some() {
            debug!("{}: retry already pending", inst.label());
            return;
        }
        let delay = self.config.supervisor.retry_delay();
        let cancel = inst.cancel.clone();
        let tx = self.ctx.event_tx.clone();
        let (channel_id, generation) = (inst.channel_id, inst.generation);
        inst.retry = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(GridEvent::RetryDue { channel_id, generation }).await;
                }
            }
        }));
    }

    async fn on_retry_due(&mut self, channel_id: u32, generation: u64) {
        let Some(idx) = self.live_index(channel_id, generation) else {
            debug!("Ignoring retry for disposed instance {}/{}", channel_id, generation);
            return;
        };
        let inst = &mut self.instances[idx];
        inst.retry = None;
        inst.status = PlaybackStatus::Loading;
        info!("Retrying {}...", inst.label());
        self.state_manager
            .update_channel(channel_id, |v| {
                v.status = PlaybackStatus::Loading;
                v.retry_pending = false;
            })
            .await;

        let inst = &mut self.instances[idx];
        let reused = match inst.adapter.as_mut() {
            Some(adapter) => match adapter.set_source(&inst.current_url, inst.protocol).await {
                Ok(()) => {
                    autoplay(adapter, &inst.target.label).await;
                    true
                }
                Err(e) => {
                    warn!("{}: engine unusable ({}), recreating", inst.label(), e);
                    false
                }
            },
            None => false,
        };
        if !reused {
            // A crashed engine cannot be re-sourced; start over under a new
            // generation so its leftover events are dropped.
            if let Some(dead) = inst.adapter.take() {
                if let Err(e) = dead.dispose().await {
                    debug!("Disposing dead engine for {}: {}", inst.label(), e);
                }
            }
            self.audio.release(&inst.target);
            self.next_generation += 1;
            inst.generation = self.next_generation;
            if let Err(e) = open_engine(&self.ctx, &mut self.audio, inst).await {
                self.on_error(idx, &e.to_string()).await;
            }
        }
        self.notify();
    }

    // ── health ────────────────────────────────────────────────────────────────

    /// Sample every channel concurrently.  A channel whose engine does not
    /// answer within `SAMPLE_TIMEOUT` is skipped for this tick.
    async fn sample_health(&mut self) {
        let sampler = &self.sampler;
        let samples = join_all(self.instances.iter_mut().filter_map(|inst| {
            let channel_id = inst.channel_id;
            let adapter = inst.adapter.as_mut()?;
            Some(async move {
                let health = tokio::time::timeout(SAMPLE_TIMEOUT, sampler.sample(adapter)).await;
                (channel_id, health)
            })
        }))
        .await;

        for (channel_id, health) in samples {
            let Ok(health) = health else {
                warn!("Health sample for channel {} timed out", channel_id);
                continue;
            };
            self.state_manager
                .set_health(channel_id, Some(health.clone()))
                .await;
            let _ = self
                .broadcast_tx
                .send(BroadcastMessage::Health { channel_id, health });
        }
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn screen(&self) -> Screen {
        Screen {
            width: self.config.engine.screen_width,
            height: self.config.engine.screen_height,
        }
    }

    fn notify(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

/// Create the engine for `inst` and wire its events into the core loop.
async fn open_engine(
    ctx: &EngineContext,
    audio: &mut AudioHub,
    inst: &mut PlaybackInstance,
) -> Result<(), EngineError> {
    if let Some(prev) = inst.forwarder.take() {
        prev.abort();
        let _ = prev.await;
    }
    let (tx, rx) = mpsc::channel(ENGINE_EVENT_BUFFER);
    inst.forwarder = Some(spawn_forwarder(
        rx,
        ctx.event_tx.clone(),
        inst.channel_id,
        inst.generation,
        inst.cancel.clone(),
    ));

    let created = EngineAdapter::create(
        ctx.factory.as_ref(),
        &inst.target,
        &inst.current_url,
        inst.protocol,
        &ctx.options,
        tx,
    )
    .await;
    let adapter = match created {
        Ok(adapter) => adapter,
        Err(e) => {
            if let Some(forwarder) = inst.forwarder.take() {
                forwarder.abort();
                let _ = forwarder.await;
            }
            return Err(e);
        }
    };

    audio.attach(&inst.target, &adapter).await;
    if ctx.options.autoplay {
        autoplay(&adapter, &inst.target.label).await;
    }
    inst.adapter = Some(adapter);
    Ok(())
}

/// Autoplay refusals are expected and never retried.
async fn autoplay(adapter: &EngineAdapter, label: &str) {
    match adapter.engine().play().await {
        Ok(()) => {}
        Err(EngineError::AutoplayBlocked(reason)) => info!("Auto-play for {}: {}", label, reason),
        Err(e) => warn!("Auto-play failed for {}: {}", label, e),
    }
}

/// Unsubscribe, cancel timers, then dispose the engine.  Errors are logged
/// and swallowed.
async fn dispose_instance(audio: &mut AudioHub, mut inst: PlaybackInstance) {
    inst.cancel.cancel();
    if let Some(retry) = inst.retry.take() {
        retry.abort();
    }
    if let Some(forwarder) = inst.forwarder.take() {
        forwarder.abort();
        let _ = forwarder.await;
    }
    audio.release(&inst.target);
    if let Some(adapter) = inst.adapter.take() {
        if let Err(e) = adapter.dispose().await {
            warn!("Error disposing player {}: {}", inst.target.media_id(), e);
        }
    }
}

fn spawn_forwarder(
    mut rx: mpsc::Receiver<EngineEvent>,
    core_tx: mpsc::Sender<GridEvent>,
    channel_id: u32,
    generation: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                evt = rx.recv() => match evt {
                    Some(event) => {
                        let msg = GridEvent::Engine { channel_id, generation, event };
                        if core_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockFactory, Probe};
    use crate::engine::TimeRange;
    use wall_proto::protocol::BufferTier;
    use wall_proto::store::Store;

    struct Harness {
        core: GridCore,
        factory: Arc<MockFactory>,
        state: Arc<StateManager>,
        rx: mpsc::Receiver<GridEvent>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        harness_with_store(|dir| dir.join("store.json"))
    }

    /// Every save fails: the store path is a directory.
    fn unwritable_harness() -> Harness {
        harness_with_store(|dir| {
            let path = dir.join("store.json");
            std::fs::create_dir(&path).unwrap();
            path
        })
    }

    fn harness_with_store(store_path: impl FnOnce(&Path) -> std::path::PathBuf) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(dir.path());
        let state = Arc::new(StateManager::new(Store::open(path)));
        let factory = Arc::new(MockFactory::default());
        let (tx, rx) = mpsc::channel(64);
        let (btx, _) = broadcast::channel(64);
        let core = GridCore::new(
            Config::default(),
            Arc::clone(&state),
            factory.clone(),
            tx,
            btx,
        );
        Harness {
            core,
            factory,
            state,
            rx,
            _dir: dir,
        }
    }

    impl Harness {
        async fn loaded() -> Self {
            let mut h = harness();
            h.core.load_all(ProtocolMode::Hls).await;
            h
        }

        fn generation(&self, channel_id: u32) -> u64 {
            self.core
                .instances
                .iter()
                .find(|i| i.channel_id == channel_id)
                .map(|i| i.generation)
                .unwrap()
        }

        async fn engine_event(&mut self, channel_id: u32, event: EngineEvent) {
            let generation = self.generation(channel_id);
            self.core
                .handle_event(GridEvent::Engine {
                    channel_id,
                    generation,
                    event,
                })
                .await;
        }

        async fn command(&mut self, cmd: Command) {
            self.core.handle_event(GridEvent::ClientCommand(cmd)).await;
        }

        fn drain(&mut self) -> Vec<GridEvent> {
            let mut out = Vec::new();
            while let Ok(evt) = self.rx.try_recv() {
                out.push(evt);
            }
            out
        }

        async fn status(&self, channel_id: u32) -> PlaybackStatus {
            let state = self.state.get_state().await;
            state
                .channels
                .iter()
                .find(|v| v.channel.id == channel_id)
                .map(|v| v.status)
                .unwrap()
        }
    }

    fn retries(events: &[GridEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, GridEvent::RetryDue { .. }))
            .count()
    }

    #[tokio::test]
    async fn load_all_creates_one_live_instance_per_channel() {
        let mut h = Harness::loaded().await;
        assert_eq!(h.factory.live().len(), 4);

        h.core.reload_all().await;
        let engines = h.factory.engines();
        assert_eq!(engines.len(), 8);
        assert_eq!(h.factory.live().len(), 4);
        for old in &engines[..4] {
            assert!(old.disposed());
            assert!(old.unsubscribed());
        }
        for live in &engines[4..] {
            assert!(!live.unsubscribed());
            assert_eq!(live.target().epoch, 2);
        }
    }

    #[tokio::test]
    async fn instances_follow_registry_order_and_start_muted() {
        let h = Harness::loaded().await;
        let ids: Vec<u32> = h.factory.engines().iter().map(|e| e.target().channel_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        for engine in h.factory.engines() {
            assert!(engine.muted());
            assert!(!engine.options().live_catchup);
            assert_eq!(engine.count_calls("play"), 1);
        }
    }

    #[tokio::test]
    async fn switch_protocol_moves_every_channel() {
        let mut h = Harness::loaded().await;
        h.command(Command::SwitchProtocol {
            protocol: ProtocolMode::Dash,
        })
        .await;

        let registry = h.state.registry().await;
        let live = h.factory.live();
        assert_eq!(live.len(), registry.len());
        for (engine, channel) in live.iter().zip(registry.iter()) {
            assert_eq!(engine.url(), channel.dash);
            assert_eq!(engine.protocol(), ProtocolMode::Dash);
        }
        assert_eq!(h.state.protocol().await, ProtocolMode::Dash);
        assert!(h
            .state
            .get_state()
            .await
            .channels
            .iter()
            .all(|v| v.current_url.as_deref() == Some(v.channel.dash.as_str())));
    }

    #[tokio::test]
    async fn switching_to_active_protocol_is_a_no_op() {
        let mut h = Harness::loaded().await;
        h.core.switch_protocol(ProtocolMode::Hls).await;
        assert_eq!(h.factory.engines().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_within_retry_window_schedule_one_retry() {
        let mut h = Harness::loaded().await;
        h.engine_event(1, EngineEvent::Error("network".into())).await;
        h.engine_event(1, EngineEvent::Error("network again".into())).await;
        assert_eq!(h.status(1).await, PlaybackStatus::Errored);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(retries(&h.drain()), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = h.drain();
        assert_eq!(retries(&events), 1);

        for evt in events {
            h.core.handle_event(evt).await;
        }
        let engine = h.factory.engine(1);
        assert_eq!(engine.count_calls("set_source"), 1);
        assert_eq!(engine.count_calls("play"), 2);
        assert_eq!(h.status(1).await, PlaybackStatus::Loading);
        assert_eq!(h.factory.engines().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn errored_status_holds_until_retry() {
        let mut h = Harness::loaded().await;
        h.engine_event(2, EngineEvent::Error("decode".into())).await;
        h.engine_event(2, EngineEvent::Playing).await;
        assert_eq!(h.status(2).await, PlaybackStatus::Errored);
        assert!(h.state.get_state().await.channels[1].retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_for_disposed_instance_does_nothing() {
        let mut h = Harness::loaded().await;
        let stale = h.generation(3);
        h.engine_event(3, EngineEvent::Error("gone".into())).await;
        h.core.reload_all().await;
        let before = h.state.get_state().await;

        // the aborted timer never fires
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(retries(&h.drain()), 0);

        h.core
            .handle_event(GridEvent::RetryDue {
                channel_id: 3,
                generation: stale,
            })
            .await;
        let after = h.state.get_state().await;
        assert_eq!(before.rev, after.rev);
        assert_eq!(h.factory.engines().len(), 8);
        assert_eq!(h.factory.engine(3).count_calls("set_source"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_is_retried_by_recreating() {
        let mut h = harness();
        h.factory.fail_create(2, true);
        h.core.load_all(ProtocolMode::Hls).await;
        assert_eq!(h.factory.live().len(), 3);
        assert_eq!(h.status(2).await, PlaybackStatus::Errored);

        h.factory.fail_create(2, false);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        for evt in h.drain() {
            h.core.handle_event(evt).await;
        }
        assert_eq!(h.factory.created_for(2), 1);
        assert_eq!(h.factory.live().len(), 4);
        assert_eq!(h.status(2).await, PlaybackStatus::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_engine_is_recreated_on_retry() {
        let mut h = Harness::loaded().await;
        let crashed = h.factory.engine(1);
        let stale = h.generation(1);
        crashed.crash();
        h.engine_event(1, EngineEvent::Error("mpv process exited".into()))
            .await;

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        for evt in h.drain() {
            h.core.handle_event(evt).await;
        }
        assert!(crashed.disposed());
        assert_eq!(h.factory.created_for(1), 2);
        assert_eq!(h.factory.live().len(), 4);
        assert_ne!(h.generation(1), stale);
        assert_eq!(h.status(1).await, PlaybackStatus::Loading);
        assert!(h.core.instances[0].retry.is_none());
    }

    #[tokio::test]
    async fn dispose_and_autoplay_failures_are_swallowed() {
        let mut h = harness();
        h.factory.fail_dispose();
        h.factory.block_autoplay();
        h.core.load_all(ProtocolMode::Hls).await;
        h.core.reload_all().await;
        assert_eq!(h.core.instances.len(), 4);
        assert!(h.core.instances.iter().all(|i| i.retry.is_none()));
        assert_eq!(h.status(1).await, PlaybackStatus::Loading);
    }

    #[tokio::test]
    async fn mute_toggle_twice_restores_state() {
        let mut h = Harness::loaded().await;
        h.command(Command::ToggleMute).await;
        assert!(h.factory.live().iter().all(|e| !e.muted()));
        h.command(Command::ToggleMute).await;
        assert!(h.factory.live().iter().all(|e| e.muted()));
        assert!(h.state.get_state().await.channels.iter().all(|v| v.muted));
    }

    #[tokio::test]
    async fn mixed_mute_state_mutes_everything() {
        let mut h = Harness::loaded().await;
        h.core.instances[0]
            .adapter
            .as_ref()
            .unwrap()
            .engine()
            .set_muted(false)
            .await
            .unwrap();
        h.core.toggle_mute_all().await;
        assert!(h.factory.live().iter().all(|e| e.muted()));
    }

    #[tokio::test]
    async fn play_toggle_pauses_then_resumes() {
        let mut h = Harness::loaded().await;
        h.factory.engine(4).set_paused(true);
        h.command(Command::TogglePlay).await;
        assert!(h.factory.live().iter().all(|e| e.paused()));
        h.command(Command::TogglePlay).await;
        assert!(h.factory.live().iter().all(|e| !e.paused()));
    }

    #[tokio::test]
    async fn status_follows_engine_events() {
        let mut h = Harness::loaded().await;
        h.engine_event(1, EngineEvent::Playing).await;
        assert_eq!(h.status(1).await, PlaybackStatus::Playing);
        h.engine_event(1, EngineEvent::Paused { seeking: true }).await;
        assert_eq!(h.status(1).await, PlaybackStatus::Playing);
        h.engine_event(1, EngineEvent::Buffering).await;
        assert_eq!(h.status(1).await, PlaybackStatus::Buffering);
        h.engine_event(1, EngineEvent::Paused { seeking: false }).await;
        assert_eq!(h.status(1).await, PlaybackStatus::Idle);
        h.engine_event(1, EngineEvent::LoadStart).await;
        assert_eq!(h.status(1).await, PlaybackStatus::Loading);
    }

    #[tokio::test]
    async fn events_reach_core_through_forwarder() {
        let mut h = Harness::loaded().await;
        h.factory.engine(2).emit(EngineEvent::Playing).await;
        let evt = tokio::time::timeout(Duration::from_secs(1), h.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            evt,
            GridEvent::Engine {
                channel_id: 2,
                event: EngineEvent::Playing,
                ..
            }
        ));
        h.core.handle_event(evt).await;
        assert_eq!(h.status(2).await, PlaybackStatus::Playing);
    }

    #[tokio::test]
    async fn stale_engine_events_are_dropped() {
        let mut h = Harness::loaded().await;
        let stale = h.generation(1);
        h.core.reload_all().await;
        h.core
            .handle_event(GridEvent::Engine {
                channel_id: 1,
                generation: stale,
                event: EngineEvent::Error("late".into()),
            })
            .await;
        assert_eq!(h.status(1).await, PlaybackStatus::Loading);
        assert!(h.core.instances[0].retry.is_none());
    }

    #[tokio::test]
    async fn rate_changes_are_corrected() {
        let mut h = Harness::loaded().await;
        h.engine_event(3, EngineEvent::RateChanged(1.1)).await;
        assert_eq!(h.factory.engine(3).rate(), 1.0);
    }

    #[tokio::test]
    async fn audio_taps_wait_for_first_interaction() {
        let mut h = Harness::loaded().await;
        assert!(h.factory.live().iter().all(|e| e.audio_taps() == 0));
        h.command(Command::GetState).await;
        assert!(!h.state.get_state().await.audio_context_ready);

        h.command(Command::ToggleConfigPanel).await;
        h.command(Command::ToggleMute).await;
        assert!(h.state.get_state().await.audio_context_ready);
        assert!(h.factory.live().iter().all(|e| e.audio_taps() == 1));

        h.command(Command::ReloadAll).await;
        let live = h.factory.live();
        assert_eq!(live.len(), 4);
        assert!(live.iter().all(|e| e.count_calls("attach_audio_tap") == 1));
    }

    #[tokio::test]
    async fn layout_change_moves_live_instances() {
        let mut h = Harness::loaded().await;
        h.command(Command::SetLayout {
            layout: LayoutMode::Single,
        })
        .await;
        let screen = Screen {
            width: 1920,
            height: 1080,
        };
        let live = h.factory.live();
        assert_eq!(live[0].target().tile, LayoutMode::Single.tile(0, screen));
        assert_eq!(live[1].target().tile, None);
        assert!(live.iter().all(|e| e.count_calls("apply_target") == 1));
        assert_eq!(h.state.layout().await, LayoutMode::Single);
    }

    #[tokio::test]
    async fn sample_tick_classifies_health() {
        let mut h = Harness::loaded().await;
        h.factory.engine(1).with_readings(|r| {
            r.buffered = vec![TimeRange {
                start: 0.0,
                end: 12.0,
            }];
            r.current_time = Some(9.0);
            r.active_bitrate_bps = Some(800_000.0);
        });
        h.core.handle_event(GridEvent::SampleTick).await;

        let state = h.state.get_state().await;
        let health = state.channels[0].health.clone().unwrap();
        assert_eq!(health.snapshot.buffer_seconds, Some(3.0));
        assert_eq!(health.buffer_tier, Some(BufferTier::Good));
        assert_eq!(health.bitrate_healthy, Some(false));
        assert!(state.channels[1].health.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_engine_does_not_stall_sampling() {
        let mut h = Harness::loaded().await;
        h.factory.engine(1).hang_probe(Probe::CurrentTime);
        h.factory.engine(2).with_readings(|r| r.active_bitrate_bps = Some(3_000_000.0));

        let started = tokio::time::Instant::now();
        h.core.handle_event(GridEvent::SampleTick).await;
        assert!(started.elapsed() <= SAMPLE_TIMEOUT + Duration::from_millis(10));

        let state = h.state.get_state().await;
        assert!(state.channels[0].health.is_none());
        let health = state.channels[1].health.clone().unwrap();
        assert_eq!(health.bitrate_healthy, Some(true));
        assert!(state.channels[3].health.is_some());
    }

    #[tokio::test]
    async fn save_channels_reloads_with_edited_urls() {
        let mut h = Harness::loaded().await;
        h.command(Command::SaveChannels {
            edits: vec![ChannelEdit {
                id: 2,
                hls: Some("https://edited.test/2.m3u8".into()),
                dash: None,
            }],
        })
        .await;
        assert_eq!(h.factory.engine(2).url(), "https://edited.test/2.m3u8");
        assert_eq!(h.factory.live().len(), 4);
    }

    #[tokio::test]
    async fn replacing_channels_rebuilds_grid() {
        let mut h = Harness::loaded().await;
        let channels = registry::default_channels()[..2].to_vec();
        h.command(Command::ReplaceChannels { channels }).await;
        assert_eq!(h.factory.live().len(), 2);
        assert_eq!(h.core.instances.len(), 2);
    }

    #[tokio::test]
    async fn failed_save_keeps_grid_and_registry_in_step() {
        let mut h = unwritable_harness();
        h.core.load_all(ProtocolMode::Hls).await;

        let channels = registry::default_channels()[..2].to_vec();
        h.command(Command::ReplaceChannels { channels }).await;
        h.command(Command::SwitchProtocol {
            protocol: ProtocolMode::Dash,
        })
        .await;
        h.command(Command::SaveChannels {
            edits: vec![ChannelEdit {
                id: 1,
                hls: Some("https://edited.test/1.m3u8".into()),
                dash: None,
            }],
        })
        .await;

        let registry = h.state.registry().await;
        assert_eq!(registry, registry::default_channels());
        assert_eq!(h.state.protocol().await, ProtocolMode::Hls);
        assert_eq!(h.core.instances.len(), registry.len());
        assert_eq!(h.factory.live().len(), registry.len());
        for (engine, channel) in h.factory.live().iter().zip(&registry) {
            assert_eq!(engine.url(), channel.hls);
        }
    }

    #[tokio::test]
    async fn duplicate_ids_never_replace_the_registry() {
        let mut h = Harness::loaded().await;
        let mut channels = registry::default_channels()[..2].to_vec();
        channels[1].id = channels[0].id;
        h.command(Command::ReplaceChannels { channels }).await;
        assert_eq!(h.state.registry().await, registry::default_channels());
        assert_eq!(h.factory.engines().len(), 4);
    }

    #[tokio::test]
    async fn export_writes_importable_registry() {
        let mut h = Harness::loaded().await;
        let path = h._dir.path().join("exports").join("channels.json");
        h.command(Command::Export { path: path.clone() }).await;
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            registry::parse_import(&text).unwrap(),
            registry::default_channels()
        );
    }

    #[tokio::test]
    async fn teardown_disposes_everything() {
        let mut h = Harness::loaded().await;
        h.core.teardown().await;
        assert!(h.core.instances.is_empty());
        assert!(h.factory.engines().iter().all(|e| e.disposed() && e.unsubscribed()));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let mut h = harness();
        assert!(!h.core.handle_event(GridEvent::Shutdown).await);
        assert!(h.core.handle_event(GridEvent::SampleTick).await);
    }
}
