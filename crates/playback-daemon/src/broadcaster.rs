//! Versioned, locally extrapolated playback state fanned out to observers.
//!
//! The daemon is the only poller of the remote system.  Every applied update
//! (poll result, committed seek, committed volume change) bumps the state
//! version and is published on a `broadcast` channel that the sync socket and
//! the SSE endpoint subscribe to.
//!
//! Seek reconciliation: a poll takes a `PollTicket` before it goes out.  If a
//! seek is committed while that poll is in flight, the poll's position is
//! older than the seek and is ignored when it lands.
use chrono::Utc;
use playback_proto::protocol::{PlaybackState, SyncBroadcast, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::BridgeEvent;
use crate::remote::TransportApi;

/// Taken before a poll request is sent; handed back with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTicket {
    version: u64,
}

struct Inner {
    version: u64,
    snapshot: Option<PlaybackState>,
    base_position: f64,
    base_at: Instant,
    pending_seek: Option<f64>,
    pending_volume: Option<u8>,
    /// Version stamped on the most recent committed seek.
    last_seek_version: u64,
}

impl Inner {
    /// Published position: the pending seek target if there is one.
    fn position_at(&self, now: Instant) -> f64 {
        match (&self.snapshot, self.pending_seek) {
            (Some(state), Some(target)) => state.clamp_position(target),
            _ => self.base_position_at(now),
        }
    }

    /// Last known base position moved forward by wall-clock time.
    fn base_position_at(&self, now: Instant) -> f64 {
        let Some(state) = &self.snapshot else {
            return 0.0;
        };
        let position = if state.transport_state.is_playing() {
            self.base_position + now.saturating_duration_since(self.base_at).as_secs_f64()
        } else {
            self.base_position
        };
        state.clamp_position(position)
    }

    /// The snapshot as it should look right now.
    fn extrapolated(&self, now: Instant) -> Option<PlaybackState> {
        let mut state = self.snapshot.clone()?;
        state.position_seconds = self.position_at(now);
        if let Some(v) = self.pending_volume {
            state.volume_percent = Some(v);
        }
        Some(state)
    }

    fn message(&self, now: Instant) -> SyncBroadcast {
        match self.extrapolated(now) {
            Some(state) => SyncBroadcast::State {
                version: self.version,
                state,
            },
            None => SyncBroadcast::Idle {
                version: self.version,
            },
        }
    }

    fn rebase(&mut self, position: f64, now: Instant) {
        self.base_position = position;
        self.base_at = now;
        if let Some(state) = self.snapshot.as_mut() {
            state.position_seconds = position;
            state.fetched_at = Utc::now();
        }
    }
}

pub struct PlaybackStateBroadcaster {
    inner: RwLock<Inner>,
    tx: broadcast::Sender<SyncBroadcast>,
}

impl PlaybackStateBroadcaster {
    /// `tx` is shared with the logging layer, which pushes `log` messages
    /// through the same channel.
    pub fn new(tx: broadcast::Sender<SyncBroadcast>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                version: 0,
                snapshot: None,
                base_position: 0.0,
                base_at: Instant::now(),
                pending_seek: None,
                pending_volume: None,
                last_seek_version: 0,
            }),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncBroadcast> {
        self.tx.subscribe()
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    /// Latest state with the position extrapolated to now.
    #[cfg(test)]
    pub async fn current(&self) -> Option<PlaybackState> {
        self.inner.read().await.extrapolated(Instant::now())
    }

    /// Zone of the most recently observed playback, if anything is playing.
    pub async fn current_zone(&self) -> Option<String> {
        self.inner
            .read()
            .await
            .snapshot
            .as_ref()
            .map(|s| s.zone_id.clone())
            .filter(|z| !z.is_empty())
    }

    /// Full snapshot for an observer that just announced readiness.
    pub async fn snapshot(&self) -> SyncBroadcast {
        self.inner.read().await.message(Instant::now())
    }

    pub async fn poll_ticket(&self) -> PollTicket {
        PollTicket {
            version: self.inner.read().await.version,
        }
    }

    /// Apply a now-playing result.  Returns the new version if anything was
    /// published.
    pub async fn apply_poll(&self, ticket: PollTicket, polled: Option<PlaybackState>) -> Option<u64> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let Some(mut state) = polled else {
            if inner.snapshot.is_none() && inner.version > 0 {
                return None;
            }
            inner.snapshot = None;
            inner.pending_seek = None;
            inner.pending_volume = None;
            return Some(self.publish(&mut inner, now));
        };

        let same_track = inner
            .snapshot
            .as_ref()
            .map(|s| s.zone_id == state.zone_id && s.track_title == state.track_title)
            .unwrap_or(false);
        let seek_since_issued = inner.last_seek_version > ticket.version;

        // A pending seek is masked by `position_at`; the base keeps tracking
        // the remote so an aborted seek falls back to the real position.
        let position = if seek_since_issued && same_track {
            debug!(
                "broadcast: ignoring position {:.1}s from poll issued at v{} (seek at v{})",
                state.position_seconds, ticket.version, inner.last_seek_version
            );
            inner.base_position_at(now)
        } else {
            state.position_seconds
        };

        if inner.pending_volume.is_some() {
            state.volume_percent = inner.snapshot.as_ref().and_then(|s| s.volume_percent);
        }

        inner.snapshot = Some(state);
        inner.rebase(position, now);
        Some(self.publish(&mut inner, now))
    }

    /// A seek is about to be sent.  Until it is committed or aborted the
    /// published position is frozen at `target`.
    pub async fn begin_seek(&self, target: f64) {
        self.inner.write().await.pending_seek = Some(target.max(0.0));
    }

    /// The remote acknowledged the seek.  The base position moves right away
    /// so an older poll still in flight cannot drag it back.
    pub async fn commit_seek(&self, target: f64) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.pending_seek = None;
        let target = match &inner.snapshot {
            Some(s) => s.clamp_position(target),
            None => target.max(0.0),
        };
        inner.rebase(target, now);
        let version = self.publish(&mut inner, now);
        inner.last_seek_version = version;
        version
    }

    /// The seek failed; resume extrapolating from the last known base.
    pub async fn abort_seek(&self) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.pending_seek = None;
        self.publish(&mut inner, now)
    }

    pub async fn begin_volume(&self, percent: u8) {
        self.inner.write().await.pending_volume = Some(percent.min(100));
    }

    pub async fn commit_volume(&self, percent: u8) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.pending_volume = None;
        if let Some(state) = inner.snapshot.as_mut() {
            state.volume_percent = Some(percent.min(100));
        }
        self.publish(&mut inner, now)
    }

    pub async fn abort_volume(&self) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.pending_volume = None;
        self.publish(&mut inner, now)
    }

    /// Resend the current version so idle observers can tell they are still
    /// connected, and lagging ones that they missed something.
    pub async fn heartbeat(&self) -> SyncBroadcast {
        let msg = SyncBroadcast::Heartbeat {
            version: self.inner.read().await.version,
            protocol_version: PROTOCOL_VERSION,
        };
        let _ = self.tx.send(msg.clone());
        msg
    }

    pub fn publish_error(&self, message: String) {
        let _ = self.tx.send(SyncBroadcast::Error { message });
    }

    fn publish(&self, inner: &mut Inner, now: Instant) -> u64 {
        inner.version += 1;
        let msg = inner.message(now);
        debug!("broadcast: v{} {}", inner.version, msg.kind());
        // No receivers is fine
        let _ = self.tx.send(msg);
        inner.version
    }
}

/// Polls now-playing on an interval and on bridge invalidation events, and
/// emits heartbeats, until `cancel` fires.
pub async fn run_poller(
    broadcaster: Arc<PlaybackStateBroadcaster>,
    transport: Arc<dyn TransportApi>,
    mut events: mpsc::Receiver<BridgeEvent>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        "poller: every {:?}, heartbeat every {:?}",
        poll_interval, heartbeat_interval
    );
    let mut poll_tick = tokio::time::interval(poll_interval);
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut heartbeat_tick = tokio::time::interval(heartbeat_interval);
    heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failing = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("poller: stopping");
                break;
            }
            _ = poll_tick.tick() => {
                poll_once(&broadcaster, transport.as_ref(), &mut failing).await;
            }
            _ = heartbeat_tick.tick() => {
                broadcaster.heartbeat().await;
            }
            Some(event) = events.recv() => {
                if event.invalidates_now_playing() {
                    debug!("poller: {:?} -> poll", event.event_name());
                    poll_once(&broadcaster, transport.as_ref(), &mut failing).await;
                    poll_tick.reset();
                }
            }
        }
    }
}

async fn poll_once(
    broadcaster: &PlaybackStateBroadcaster,
    transport: &dyn TransportApi,
    failing: &mut bool,
) {
    let ticket = broadcaster.poll_ticket().await;
    match transport.now_playing().await {
        Ok(state) => {
            if *failing {
                info!("poller: now-playing available again");
                *failing = false;
            }
            broadcaster.apply_poll(ticket, state).await;
        }
        Err(e) => {
            // Log once per outage, not every interval
            if !*failing {
                warn!("poller: now-playing failed: {}", e);
                *failing = true;
            } else {
                debug!("poller: now-playing still failing: {}", e);
            }
        }
    }
}
