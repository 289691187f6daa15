//! Observer sync socket.
//!
//! An observer connects, gets a heartbeat, and announces `ready`.  Only then
//! does it get a full snapshot followed by every state change.  Observers may
//! send user seeks and volume changes back; those go through the control
//! channel like any HTTP request.
use playback_proto::protocol::{Frame, Message, ObserverMessage, SyncBroadcast, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broadcaster::PlaybackStateBroadcaster;
use crate::control::ControlChannel;
use crate::error::PlaybackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connected,
    Active,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    broadcaster: Arc<PlaybackStateBroadcaster>,
    control: Arc<ControlChannel>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind sync socket {}: {}", addr, e);
                return;
            }
        };

        info!("Sync server listening at {}", addr);
        serve(listener, broadcaster, control).await;
    })
}

pub async fn serve(
    listener: TcpListener,
    broadcaster: Arc<PlaybackStateBroadcaster>,
    control: Arc<ControlChannel>,
) {
    let connected = Arc::new(AtomicUsize::new(0));
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;

                let client_count = connected.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Observer {} connected from {} ({} total)", id, peer, client_count);

                // Subscribe before the first send so nothing falls in between
                let bcast_rx = broadcaster.subscribe();
                let broadcaster = broadcaster.clone();
                let control = control.clone();
                let connected = connected.clone();

                tokio::spawn(async move {
                    handle_client(stream, id, broadcaster, control, bcast_rx).await;

                    let client_count = connected.fetch_sub(1, Ordering::SeqCst) - 1;
                    info!("Observer {} disconnected ({} remaining)", id, client_count);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    client_id: usize,
    broadcaster: Arc<PlaybackStateBroadcaster>,
    control: Arc<ControlChannel>,
    mut broadcast_rx: broadcast::Receiver<SyncBroadcast>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();
    let mut phase = Phase::Connected;

    let hello = SyncBroadcast::Heartbeat {
        version: broadcaster.version().await,
        protocol_version: PROTOCOL_VERSION,
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        debug!("Observer {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let msg = match Frame::next(&mut read_buf) {
                                Ok(Some(Frame::Message(msg))) => msg,
                                Ok(Some(Frame::Unreadable(e))) => {
                                    warn!("Observer {}: skipping unreadable frame: {}", client_id, e);
                                    continue;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Observer {}: {}", client_id, e);
                                    return;
                                }
                            };
                            let reply = match msg {
                                Message::Observer(msg) => {
                                    handle_observer(client_id, msg, &mut phase, &broadcaster, &control).await
                                }
                                Message::Broadcast(_) => None,
                            };
                            if let Some(reply) = reply {
                                if send(&mut write_half, reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from observer {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(msg) => {
                        let forward = match (&msg, phase) {
                            (SyncBroadcast::State { .. } | SyncBroadcast::Idle { .. }, Phase::Connected) => false,
                            _ => true,
                        };
                        if forward && send(&mut write_half, msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Observer {} missed {} broadcast messages", client_id, n);
                        if phase == Phase::Active {
                            let snapshot = broadcaster.snapshot().await;
                            if send(&mut write_half, snapshot).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Returns the direct reply for this observer, if any.
async fn handle_observer(
    client_id: usize,
    msg: ObserverMessage,
    phase: &mut Phase,
    broadcaster: &PlaybackStateBroadcaster,
    control: &ControlChannel,
) -> Option<SyncBroadcast> {
    match msg {
        ObserverMessage::Ready => {
            *phase = Phase::Active;
            let snapshot = broadcaster.snapshot().await;
            debug!(
                "Observer {} ready, sending snapshot v{}",
                client_id,
                snapshot.version().unwrap_or_default()
            );
            Some(snapshot)
        }
        ObserverMessage::UserSeek { position } => {
            info!("Observer {} seeks to {:.1}s", client_id, position);
            let result = control.seek(None, position).await;
            failure_notice(result, broadcaster).await
        }
        ObserverMessage::UserVolume { percent } => {
            info!("Observer {} sets volume {}%", client_id, percent);
            let result = control.set_volume(None, i64::from(percent)).await;
            failure_notice(result, broadcaster).await
        }
    }
}

/// Remote failures on the tracked zone are already broadcast to every
/// observer; anything else only concerns the sender.
async fn failure_notice(
    result: Result<String, PlaybackError>,
    broadcaster: &PlaybackStateBroadcaster,
) -> Option<SyncBroadcast> {
    let err = result.err()?;
    if matches!(err, PlaybackError::Remote(_)) && broadcaster.current_zone().await.is_some() {
        return None;
    }
    Some(SyncBroadcast::Error {
        message: err.to_string(),
    })
}

async fn send(write_half: &mut OwnedWriteHalf, msg: SyncBroadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(msg).encode()?;
    write_half.write_all(&encoded).await?;
    Ok(())
}
