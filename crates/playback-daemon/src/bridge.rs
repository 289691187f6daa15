/// Bridge IPC driver with separated reader/writer tasks.
///
/// The remote playback system is reached through a bridge process speaking
/// newline-delimited JSON over TCP.
///
/// ```text
///   BridgeClient::request()
///         │  (lazy connect / reconnect)
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── unsolicited event         → event_tx channel
/// ```
///
/// Requests are pipelined: a slow browse descent never holds the socket, so
/// transport commands issued meanwhile are answered as soon as the bridge
/// replies to them.
use async_trait::async_trait;
use playback_proto::config::BridgeConfig;
use playback_proto::protocol::{PlaybackState, TransportAction, Zone};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::remote::{BrowseApi, BrowseItem, BrowseRequest, BrowseResult, RemoteError, TransportApi};

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── internal channel types ────────────────────────────────────────────────────

type ReplySender = oneshot::Sender<Result<Value, RemoteError>>;
type PendingMap = Arc<Mutex<HashMap<u64, ReplySender>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: ReplySender,
}

/// A bridge message that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct BridgeEvent {
    pub raw: Value,
}

impl BridgeEvent {
    /// Returns the event name, e.g. "zones_changed", "now_playing_changed".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// Events after which the cached now-playing view is out of date.
    pub fn invalidates_now_playing(&self) -> bool {
        matches!(
            self.event_name(),
            Some("now_playing_changed") | Some("zones_changed") | Some("seek_changed")
        )
    }
}

// ── connection handle ─────────────────────────────────────────────────────────

/// Cloneable handle to one bridge connection.  `closed` fires as soon as
/// either IO task exits.
#[derive(Clone)]
struct BridgeHandle {
    tx: mpsc::Sender<PendingRequest>,
    pending: PendingMap,
    closed: CancellationToken,
}

impl BridgeHandle {
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    async fn send(
        &self,
        command: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RemoteError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "args": args, "request_id": req_id });
        let mut raw =
            serde_json::to_string(&msg).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        raw.push('\n');

        if self.is_closed() {
            return Err(RemoteError::Disconnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RemoteError::Disconnected)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RemoteError::Disconnected),
            Err(_) => {
                warn!("bridge: {} req={} timed out after {:?}", command, req_id, timeout);
                self.pending.lock().await.remove(&req_id);
                Err(RemoteError::Timeout)
            }
        }
    }
}

fn start_io_tasks(stream: TcpStream, event_tx: mpsc::Sender<BridgeEvent>) -> BridgeHandle {
    let (read_half, write_half) = stream.into_split();
    let reader = BufReader::new(read_half);

    // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    let closed = CancellationToken::new();

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone(), closed.clone()));
    tokio::spawn(reader_task(reader, pending.clone(), event_tx, closed.clone()));

    BridgeHandle {
        tx: cmd_tx,
        pending,
        closed,
    }
}

/// Map a response line to the caller's result.
fn response_result(val: Value) -> Result<Value, RemoteError> {
    match val.get("error").and_then(|e| e.as_str()) {
        Some("success") => Ok(val.get("data").cloned().unwrap_or(Value::Null)),
        Some("busy") => Err(RemoteError::Busy),
        Some(other) => Err(RemoteError::Rejected(other.to_string())),
        None => Err(RemoteError::Protocol("response without error field".into())),
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<BridgeEvent>,
    closed: CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("bridge reader: connection closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("bridge reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = response_result(val);
                        debug!("bridge reader: response req={} ok={}", req_id, result.is_ok());
                        let _ = tx.send(result);
                    } else {
                        // Caller already gave up (timeout)
                        debug!("bridge reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("bridge reader: event {}", trimmed);
                    let _ = event_tx.send(BridgeEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("bridge reader: read error: {}", e);
                break;
            }
        }
    }

    // Cancel before draining: the writer re-checks after registering a reply
    closed.cancel();

    // Fail everything still waiting on this connection
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(RemoteError::Disconnected));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: PendingMap,
    closed: CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    loop {
        let req = tokio::select! {
            _ = closed.cancelled() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        if closed.is_cancelled() {
            // Reader is gone and has already drained the map
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(RemoteError::Disconnected));
            }
            break;
        }

        debug!("bridge writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("bridge writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(RemoteError::Disconnected));
            }
            break;
        }
    }
    closed.cancel();
    debug!("bridge writer: task exiting");
}

// ── client ────────────────────────────────────────────────────────────────────

/// Owns the bridge connection and re-establishes it on demand.
pub struct BridgeClient {
    address: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    handle: RwLock<Option<BridgeHandle>>,
    event_tx: mpsc::Sender<BridgeEvent>,
}

impl BridgeClient {
    pub fn new(config: &BridgeConfig, event_tx: mpsc::Sender<BridgeEvent>) -> Self {
        Self {
            address: config.address.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            handle: RwLock::new(None),
            event_tx,
        }
    }

    pub async fn is_connected(&self) -> bool {
        matches!(&*self.handle.read().await, Some(h) if !h.is_closed())
    }

    async fn connected_handle(&self) -> Result<BridgeHandle, RemoteError> {
        if let Some(h) = self.handle.read().await.as_ref() {
            if !h.is_closed() {
                return Ok(h.clone());
            }
        }

        let mut slot = self.handle.write().await;
        // Another caller may have reconnected while we waited for the write lock
        if let Some(h) = slot.as_ref() {
            if !h.is_closed() {
                return Ok(h.clone());
            }
        }

        info!("bridge: connecting to {}", self.address);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| RemoteError::Disconnected)?
            .map_err(|e| {
                warn!("bridge: connect to {} failed: {}", self.address, e);
                RemoteError::Disconnected
            })?;
        let _ = stream.set_nodelay(true);
        info!("bridge: connected");

        let handle = start_io_tasks(stream, self.event_tx.clone());
        *slot = Some(handle.clone());
        Ok(handle)
    }

    async fn request(&self, command: &str, args: Value) -> Result<Value, RemoteError> {
        let handle = self.connected_handle().await?;
        let result = handle.send(command, args, self.request_timeout).await;
        if matches!(result, Err(RemoteError::Disconnected)) {
            self.handle.write().await.take();
        }
        result
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RemoteError> {
    serde_json::from_value(value).map_err(|e| RemoteError::Protocol(e.to_string()))
}

#[async_trait]
impl BrowseApi for BridgeClient {
    async fn browse(&self, request: BrowseRequest) -> Result<BrowseResult, RemoteError> {
        let args = serde_json::to_value(&request).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        decode(self.request("browse", args).await?)
    }

    async fn load(&self, offset: usize, count: usize) -> Result<Vec<BrowseItem>, RemoteError> {
        let data = self
            .request("load", json!({ "offset": offset, "count": count }))
            .await?;
        match data.get("items") {
            Some(items) => decode(items.clone()),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl TransportApi for BridgeClient {
    async fn zones(&self) -> Result<Vec<Zone>, RemoteError> {
        decode(self.request("zones", json!({})).await?)
    }

    async fn now_playing(&self) -> Result<Option<PlaybackState>, RemoteError> {
        decode(self.request("now_playing", json!({})).await?)
    }

    async fn control(&self, zone_id: &str, action: TransportAction) -> Result<(), RemoteError> {
        self.request("control", json!({ "zone_id": zone_id, "action": action }))
            .await?;
        Ok(())
    }

    async fn seek(&self, zone_id: &str, position_seconds: f64) -> Result<(), RemoteError> {
        self.request("seek", json!({ "zone_id": zone_id, "seconds": position_seconds }))
            .await?;
        Ok(())
    }

    async fn set_volume(&self, zone_id: &str, percent: u8) -> Result<(), RemoteError> {
        self.request("volume", json!({ "zone_id": zone_id, "percent": percent }))
            .await?;
        Ok(())
    }
}
