mod audio;
mod core;
mod engine;
mod http;
mod keys;
mod sampler;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wall_proto::config::Config;
use wall_proto::protocol::ChannelHealth;
use wall_proto::state::StateManager;
use wall_proto::store::Store;

/// Pushed to every display client (SSE) and the log echo.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    StateUpdated,
    /// Fresh health sample for one channel.
    Health {
        channel_id: u32,
        health: ChannelHealth,
    },
    Log {
        message: String,
    },
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // WARN and ERROR only
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        let _ = self.sender.send(BroadcastMessage::Log { message });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Broadcast first so logging can feed it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(256);

    let data_dir = wall_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,streamwall=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let state_manager = Arc::new(StateManager::new(Store::open(&config.store.path)));

    // Event channel: every external input funnels into GridCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::GridEvent>(256);

    let grid_core = core::GridCore::new(
        config.clone(),
        state_manager.clone(),
        Arc::new(engine::mpv::MpvFactory::new()),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
            broadcast_tx.clone(),
        );
    }

    let _raw_mode = keys::spawn(event_tx.clone(), data_dir.join("channel-config.json"));

    // Raw mode swallows SIGINT for keyboard input; this covers the other case.
    let signal_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(core::GridEvent::Shutdown).await;
        }
    });

    // Echo warnings and errors to the terminal.
    let mut log_rx = broadcast_tx.subscribe();
    tokio::spawn(async move {
        loop {
            match log_rx.recv().await {
                Ok(BroadcastMessage::Log { message }) => eprint!("{}\r\n", message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprint!("(skipped {} log lines)\r\n", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    drop(event_tx);
    info!("Streamwall initialised, running event loop");
    if let Err(e) = grid_core.run(event_rx).await {
        warn!("Grid core stopped with error: {}", e);
        return Err(e);
    }

    Ok(())
}
