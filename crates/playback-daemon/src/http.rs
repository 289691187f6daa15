use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use playback_proto::protocol::{PlaybackState, SyncBroadcast, TransportAction, Zone};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::broadcaster::PlaybackStateBroadcaster;
use crate::collection::AlbumDirectory;
use crate::control::ControlChannel;
use crate::error::PlaybackError;
use crate::resolver::{PlaybackResolver, Resolution};

#[derive(Clone)]
pub struct HttpState {
    pub resolver: Arc<PlaybackResolver>,
    pub control: Arc<ControlChannel>,
    pub broadcaster: Arc<PlaybackStateBroadcaster>,
    pub directory: Arc<dyn AlbumDirectory>,
}

#[derive(Deserialize)]
struct PlayByNameRequest {
    artist: String,
    album: String,
    #[serde(default)]
    zone: Option<String>,
}

/// Collection ids arrive as numbers from some callers and strings from others.
#[derive(Deserialize)]
#[serde(untagged)]
enum AlbumId {
    Number(u64),
    Text(String),
}

impl fmt::Display for AlbumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlbumId::Number(n) => write!(f, "{}", n),
            AlbumId::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Deserialize)]
struct PlayRequest {
    album_id: AlbumId,
    #[serde(default)]
    zone: Option<String>,
}

#[derive(Deserialize)]
struct ControlRequest {
    #[serde(default)]
    zone: Option<String>,
    action: TransportAction,
}

#[derive(Deserialize)]
struct SeekRequest {
    #[serde(default)]
    zone: Option<String>,
    position_seconds: f64,
}

#[derive(Deserialize)]
struct VolumeRequest {
    #[serde(default)]
    zone: Option<String>,
    percent: i64,
}

#[derive(Deserialize)]
struct SelectZoneRequest {
    zone: String,
}

#[derive(Serialize)]
struct PlayResponse {
    started: bool,
    zone: String,
    #[serde(flatten)]
    resolution: Resolution,
}

#[derive(Serialize)]
struct ZonesResponse {
    zones: Vec<Zone>,
}

#[derive(Serialize)]
struct AckResponse {
    ok: bool,
    zone: String,
}

#[derive(Serialize)]
struct NowPlayingResponse {
    version: u64,
    #[serde(flatten)]
    state: PlaybackState,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/playback/play-by-name", post(play_by_name))
        .route("/playback/play", post(play_by_id))
        .route("/playback/zones", get(zones))
        .route("/playback/zone", post(select_zone).delete(clear_zone))
        .route("/playback/control", post(control))
        .route("/playback/seek", post(seek))
        .route("/playback/volume", post(volume))
        .route("/playback/now-playing", get(now_playing))
        .route("/playback/events", get(events))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

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

async fn play_by_name(
    State(state): State<HttpState>,
    Json(req): Json<PlayByNameRequest>,
) -> Result<Json<PlayResponse>, PlaybackError> {
    info!("HTTP API: play '{}' by '{}'", req.album, req.artist);
    start_album(&state, &req.artist, &req.album, req.zone.as_deref()).await
}

async fn play_by_id(
    State(state): State<HttpState>,
    Json(req): Json<PlayRequest>,
) -> Result<Json<PlayResponse>, PlaybackError> {
    let album_id = req.album_id.to_string();
    info!("HTTP API: play album id {}", album_id);
    let names = state.directory.lookup(&album_id).await?;
    start_album(&state, &names.artist_name, &names.title, req.zone.as_deref()).await
}

async fn start_album(
    state: &HttpState,
    artist: &str,
    album: &str,
    zone: Option<&str>,
) -> Result<Json<PlayResponse>, PlaybackError> {
    if artist.trim().is_empty() || album.trim().is_empty() {
        return Err(PlaybackError::InvalidRequest(
            "artist and album are required".into(),
        ));
    }
    let zone = state.control.resolve_zone(zone).await?;

    // Detached so a caller hanging up does not abandon the descent halfway
    let resolver = state.resolver.clone();
    let (task_artist, task_album, task_zone) =
        (artist.to_string(), album.to_string(), zone.clone());
    let resolution = tokio::spawn(async move {
        resolver
            .play_album(&task_artist, &task_album, &task_zone)
            .await
    })
    .await
    .map_err(|e| PlaybackError::Internal(format!("resolution task failed: {}", e)))??;

    if !resolution.is_started() {
        return Err(PlaybackError::NotFound {
            artist: artist.to_string(),
            album: album.to_string(),
        });
    }
    Ok(Json(PlayResponse {
        started: true,
        zone,
        resolution,
    }))
}

async fn zones(State(state): State<HttpState>) -> Result<Json<ZonesResponse>, PlaybackError> {
    let zones = state.control.zones().await?;
    Ok(Json(ZonesResponse { zones }))
}

async fn select_zone(
    State(state): State<HttpState>,
    Json(req): Json<SelectZoneRequest>,
) -> Result<Json<AckResponse>, PlaybackError> {
    let zone = req.zone.trim();
    if zone.is_empty() {
        return Err(PlaybackError::InvalidRequest("zone is required".into()));
    }
    state.control.select_zone(zone).await;
    Ok(Json(AckResponse {
        ok: true,
        zone: zone.to_string(),
    }))
}

/// Forget the remembered zone; playback without a zone needs a live one again.
async fn clear_zone(State(state): State<HttpState>) -> StatusCode {
    state.control.clear_selection().await;
    StatusCode::NO_CONTENT
}

async fn control(
    State(state): State<HttpState>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<AckResponse>, PlaybackError> {
    info!("HTTP API: {}", req.action.as_str());
    let zone = state.control.control(req.zone.as_deref(), req.action).await?;
    Ok(Json(AckResponse { ok: true, zone }))
}

async fn seek(
    State(state): State<HttpState>,
    Json(req): Json<SeekRequest>,
) -> Result<Json<AckResponse>, PlaybackError> {
    info!("HTTP API: seek to {:.1}s", req.position_seconds);
    let zone = state
        .control
        .seek(req.zone.as_deref(), req.position_seconds)
        .await?;
    Ok(Json(AckResponse { ok: true, zone }))
}

async fn volume(
    State(state): State<HttpState>,
    Json(req): Json<VolumeRequest>,
) -> Result<Json<AckResponse>, PlaybackError> {
    info!("HTTP API: volume {}%", req.percent);
    let zone = state
        .control
        .set_volume(req.zone.as_deref(), req.percent)
        .await?;
    Ok(Json(AckResponse { ok: true, zone }))
}

async fn now_playing(State(state): State<HttpState>) -> Response {
    match state.broadcaster.snapshot().await {
        SyncBroadcast::State { version, state } => {
            Json(NowPlayingResponse { version, state }).into_response()
        }
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Same versioned messages as the sync socket, for browser observers.  The
/// first event is always a full snapshot.
async fn events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broadcaster.subscribe();
    let first = state.broadcaster.snapshot().await;
    let broadcaster = state.broadcaster.clone();

    let updates = stream::unfold((rx, broadcaster), |(mut rx, broadcaster)| async move {
        match rx.recv().await {
            Ok(msg) => Some((msg, (rx, broadcaster))),
            Err(RecvError::Lagged(n)) => {
                warn!("SSE client missed {} broadcast messages", n);
                let snapshot = broadcaster.snapshot().await;
                Some((snapshot, (rx, broadcaster)))
            }
            Err(RecvError::Closed) => None,
        }
    });

    let stream = stream::once(async move { first })
        .chain(updates)
        .map(|msg| Ok(sse_event(&msg)));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(msg: &SyncBroadcast) -> Event {
    match Event::default().event(msg.kind()).json_data(msg) {
        Ok(event) => event,
        Err(e) => Event::default().comment(format!("unserializable {}: {}", msg.kind(), e)),
    }
}
