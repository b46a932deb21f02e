use crate::core::GridEvent;
use crate::BroadcastMessage;
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post},
    Router,
};
use futures_util::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use wall_proto::protocol::{ChannelEdit, Command, GridState};
use wall_proto::registry;
use wall_proto::state::StateManager;

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<GridEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<GridEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState {
            state_manager,
            event_tx,
            broadcast_tx,
        });

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/channels", get(export_channels).put(save_channels))
        .route("/api/channels/import", post(import_channels))
        .route("/api/command", post(command))
        .route("/api/events", get(events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    if state.event_tx.send(GridEvent::ClientCommand(cmd)).await.is_err() {
        error!("Failed to send command to grid core");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<GridState> {
    Json(state.state_manager.get_state().await)
}

async fn export_channels(State(state): State<HttpState>) -> Result<String, StatusCode> {
    let channels = state.state_manager.registry().await;
    registry::export_json(&channels).map_err(|e| {
        error!("Failed to serialise registry: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Validate an uploaded registry and replace the current one.  A rejected
/// upload leaves the grid untouched.
async fn import_channels(
    State(state): State<HttpState>,
    body: String,
) -> Result<StatusCode, (StatusCode, String)> {
    let channels = registry::parse_import(&body).map_err(|e| {
        warn!("HTTP API: rejected import: {}", e);
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;
    info!("HTTP API: import {} channels", channels.len());
    Ok(send(&state, Command::ReplaceChannels { channels }).await)
}

async fn save_channels(
    State(state): State<HttpState>,
    Json(edits): Json<Vec<ChannelEdit>>,
) -> StatusCode {
    info!("HTTP API: save {} channel edits", edits.len());
    send(&state, Command::SaveChannels { edits }).await
}

/// Generic command endpoint.  Registry replacement goes through the
/// validating import route, and exports are served by `GET /api/channels`
/// rather than written to a caller-chosen path.
async fn command(
    State(state): State<HttpState>,
    Json(cmd): Json<Command>,
) -> Result<StatusCode, (StatusCode, &'static str)> {
    match cmd {
        Command::ReplaceChannels { .. } => Err((
            StatusCode::BAD_REQUEST,
            "use POST /api/channels/import to replace channels",
        )),
        Command::Export { .. } => Err((
            StatusCode::BAD_REQUEST,
            "use GET /api/channels to export channels",
        )),
        cmd => {
            info!("HTTP API: {:?}", cmd);
            Ok(send(&state, cmd).await)
        }
    }
}

/// Server-sent events: every broadcast message as one JSON `data:` frame.
async fn events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("SSE client connected");
    let stream = futures_util::stream::unfold(state.broadcast_tx.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(msg) => match Event::default().json_data(&msg) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => warn!("SSE: failed to encode {:?}: {}", msg, e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE: subscriber lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
