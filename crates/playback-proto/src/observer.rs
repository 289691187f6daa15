//! Observer-side view of the daemon's playback state.
//!
//! Every detached window (or the in-page panel) keeps one `ObserverView`.
//! Messages arrive over independent paths (poll broadcasts, acknowledgements
//! of this observer's own actions, echoes of another window's actions) and can
//! be reordered, so the view only ever applies a message whose version is
//! strictly greater than the last one it applied.
//!
//! ```text
//!   Disconnected ──connect──▶ Connected ──first state/idle──▶ Active
//!        ▲                    (heartbeats)                     │
//!        └──────────────────────disconnect─────────────────────┘
//! ```
use std::time::{Duration, Instant};

use crate::protocol::{ObserverMessage, PlaybackState, SyncBroadcast};

/// Optimistic local values are dropped after this long without confirmation.
pub const PENDING_TTL: Duration = Duration::from_secs(10);

/// A polled position within this distance of a pending seek target counts as
/// the acknowledgement of that seek.
pub const SEEK_ACK_TOLERANCE_SECS: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPhase {
    #[default]
    Disconnected,
    /// Socket is up, only heartbeats so far.
    Connected,
    /// Received a snapshot; incremental updates follow.
    Active,
}

/// What `ObserverView::apply` did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    State,
    Idle,
    /// Version not newer than the last applied one; dropped.
    Stale,
    Heartbeat,
    /// A heartbeat revealed a version this view never saw.  The caller should
    /// re-announce readiness to receive a fresh snapshot.
    ResyncNeeded,
    Notice(String),
}

#[derive(Debug, Clone, Copy)]
struct Pending<T> {
    value: T,
    since: Instant,
}

#[derive(Debug, Default)]
pub struct ObserverView {
    phase: ChannelPhase,
    last_version: Option<u64>,
    state: Option<PlaybackState>,
    base_position: f64,
    base_at: Option<Instant>,
    pending_seek: Option<Pending<f64>>,
    pending_volume: Option<Pending<u8>>,
}

impl ObserverView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn last_version(&self) -> Option<u64> {
        self.last_version
    }

    pub fn state(&self) -> Option<&PlaybackState> {
        self.state.as_ref()
    }

    /// Transport is up.  Returns the message announcing readiness.
    ///
    /// The version floor is reset: a restarted daemon counts from zero again
    /// and its first snapshot must not be discarded.
    pub fn on_connected(&mut self) -> ObserverMessage {
        self.phase = ChannelPhase::Connected;
        self.last_version = None;
        ObserverMessage::Ready
    }

    pub fn on_disconnected(&mut self) {
        self.phase = ChannelPhase::Disconnected;
        self.pending_seek = None;
        self.pending_volume = None;
    }

    pub fn apply(&mut self, msg: &SyncBroadcast, now: Instant) -> Applied {
        match msg {
            SyncBroadcast::Log { message } | SyncBroadcast::Error { message } => {
                Applied::Notice(message.clone())
            }
            SyncBroadcast::Heartbeat { version, .. } => {
                if self.phase == ChannelPhase::Disconnected {
                    self.phase = ChannelPhase::Connected;
                }
                match self.last_version {
                    Some(last) if *version > last => Applied::ResyncNeeded,
                    None if self.phase == ChannelPhase::Active => Applied::ResyncNeeded,
                    _ => Applied::Heartbeat,
                }
            }
            SyncBroadcast::State { version, state } => {
                if !self.accept(*version) {
                    return Applied::Stale;
                }
                self.base_position = state.position_seconds;
                self.base_at = Some(now);
                self.settle_pending(state, now);
                self.state = Some(state.clone());
                Applied::State
            }
            SyncBroadcast::Idle { version } => {
                if !self.accept(*version) {
                    return Applied::Stale;
                }
                self.state = None;
                self.base_position = 0.0;
                self.base_at = None;
                self.pending_seek = None;
                self.pending_volume = None;
                Applied::Idle
            }
        }
    }

    fn accept(&mut self, version: u64) -> bool {
        if matches!(self.last_version, Some(last) if version <= last) {
            return false;
        }
        self.last_version = Some(version);
        self.phase = ChannelPhase::Active;
        true
    }

    fn settle_pending(&mut self, incoming: &PlaybackState, now: Instant) {
        if let Some(p) = self.pending_seek {
            let acked = (incoming.position_seconds - p.value).abs() <= SEEK_ACK_TOLERANCE_SECS;
            if acked || now.duration_since(p.since) >= PENDING_TTL {
                self.pending_seek = None;
            }
        }
        if let Some(p) = self.pending_volume {
            let acked = incoming.volume_percent == Some(p.value);
            if acked || now.duration_since(p.since) >= PENDING_TTL {
                self.pending_volume = None;
            }
        }
    }

    /// User dragged the scrubber.  Shows the target immediately and returns
    /// the message to send to the daemon.
    pub fn request_seek(&mut self, position: f64, now: Instant) -> ObserverMessage {
        let position = match &self.state {
            Some(s) => s.clamp_position(position),
            None => position.max(0.0),
        };
        self.pending_seek = Some(Pending {
            value: position,
            since: now,
        });
        ObserverMessage::UserSeek { position }
    }

    pub fn request_volume(&mut self, percent: u8, now: Instant) -> ObserverMessage {
        let percent = percent.min(100);
        self.pending_volume = Some(Pending {
            value: percent,
            since: now,
        });
        ObserverMessage::UserVolume { percent }
    }

    /// Position to render at `now`.  Frozen on a pending seek target;
    /// otherwise extrapolated from the last applied snapshot while playing.
    pub fn display_position(&self, now: Instant) -> Option<f64> {
        let state = self.state.as_ref()?;
        if let Some(p) = self.pending_seek {
            return Some(p.value);
        }
        let position = match (state.transport_state.is_playing(), self.base_at) {
            (true, Some(at)) => self.base_position + now.duration_since(at).as_secs_f64(),
            _ => self.base_position,
        };
        Some(state.clamp_position(position))
    }

    pub fn display_volume(&self) -> Option<u8> {
        if let Some(p) = self.pending_volume {
            return Some(p.value);
        }
        self.state.as_ref()?.volume_percent
    }
}
