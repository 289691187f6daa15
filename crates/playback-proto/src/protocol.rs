use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current sync protocol version.  Bump this when the wire format changes in a
/// breaking way.  Observers receive it in the first heartbeat and can refuse
/// to talk to an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Transport state of a zone as reported by the remote system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Playing,
    Paused,
    #[default]
    Stopped,
}

impl TransportState {
    pub fn is_playing(&self) -> bool {
        matches!(self, TransportState::Playing)
    }
}

/// One addressable output endpoint in the remote system.  Enumerated on
/// demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    pub id: String,
    #[serde(rename = "name", alias = "display_name")]
    pub display_name: String,
    #[serde(rename = "state", alias = "playback_state", default)]
    pub playback_state: TransportState,
}

/// Immutable snapshot of what a zone is playing.  Superseded by every poll or
/// committed seek; never mutated in place once published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackState {
    pub track_title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    pub zone_id: String,
    #[serde(default)]
    pub zone_name: String,
    #[serde(default)]
    pub position_seconds: f64,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub volume_percent: Option<u8>,
    #[serde(default)]
    pub transport_state: TransportState,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl PlaybackState {
    /// Clamp a position into `[0, duration]` (upper bound only when known).
    pub fn clamp_position(&self, position: f64) -> f64 {
        let position = position.max(0.0);
        match self.duration_seconds {
            Some(d) if d > 0.0 => position.min(d),
            _ => position,
        }
    }
}

/// Transport commands accepted by `POST /playback/control`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportAction {
    Play,
    Pause,
    Next,
    Previous,
    Stop,
}

impl TransportAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportAction::Play => "play",
            TransportAction::Pause => "pause",
            TransportAction::Next => "next",
            TransportAction::Previous => "previous",
            TransportAction::Stop => "stop",
        }
    }
}

/// Messages sent from an observer window to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ObserverMessage {
    /// Observer is ready to receive state; the daemon answers with a full snapshot.
    Ready,
    UserSeek { position: f64 },
    UserVolume { percent: u8 },
}

/// Messages sent from the daemon to observers.  Every state-bearing message
/// carries the `StateVersion` it was stamped with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncBroadcast {
    State {
        version: u64,
        #[serde(flatten)]
        state: PlaybackState,
    },
    /// Nothing is playing anywhere.
    Idle { version: u64 },
    /// Liveness resend.  Does not carry state; an observer whose last applied
    /// version is behind this one has missed an update.
    Heartbeat {
        version: u64,
        #[serde(default)]
        protocol_version: u32,
    },
    Log { message: String },
    Error { message: String },
}

impl SyncBroadcast {
    pub fn version(&self) -> Option<u64> {
        match self {
            SyncBroadcast::State { version, .. }
            | SyncBroadcast::Idle { version }
            | SyncBroadcast::Heartbeat { version, .. } => Some(*version),
            SyncBroadcast::Log { .. } | SyncBroadcast::Error { .. } => None,
        }
    }

    /// Short SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncBroadcast::State { .. } => "state",
            SyncBroadcast::Idle { .. } => "idle",
            SyncBroadcast::Heartbeat { .. } => "heartbeat",
            SyncBroadcast::Log { .. } => "log",
            SyncBroadcast::Error { .. } => "error",
        }
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Observer(ObserverMessage),
    Broadcast(SyncBroadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

/// Refuse frames larger than this; no sync message comes close.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One complete frame popped off a read buffer.
#[derive(Debug)]
pub enum Frame {
    Message(Message),
    /// Well-framed but not a message this build understands (e.g. a newer
    /// peer).  Already drained; the reader should carry on.
    Unreadable(String),
}

impl Frame {
    /// Pops one complete frame from the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed.  An error means the stream is
    /// no longer framed sensibly and the connection should be dropped.
    pub fn next(buf: &mut Vec<u8>) -> anyhow::Result<Option<Frame>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("frame of {} bytes is too large", len);
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = match Message::decode(buf) {
            Ok((msg, _)) => Frame::Message(msg),
            Err(e) => Frame::Unreadable(e.to_string()),
        };
        buf.drain(..4 + len);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> PlaybackState {
        PlaybackState {
            track_title: "So What".into(),
            artist: "Miles Davis".into(),
            album: "Kind of Blue".into(),
            zone_id: "zone-1".into(),
            zone_name: "Living Room".into(),
            position_seconds: 12.5,
            duration_seconds: Some(545.0),
            volume_percent: Some(40),
            transport_state: TransportState::Playing,
            image_url: None,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_ready_wire_shape() {
        let json = serde_json::to_value(ObserverMessage::Ready).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "ready" }));

        let seek: ObserverMessage =
            serde_json::from_str(r#"{"type":"user-seek","position":120.0}"#).unwrap();
        assert_eq!(seek, ObserverMessage::UserSeek { position: 120.0 });
    }

    #[test]
    fn test_state_message_is_flattened() {
        let msg = SyncBroadcast::State {
            version: 7,
            state: sample_state(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["version"], 7);
        assert_eq!(json["track_title"], "So What");
        assert_eq!(json["transport_state"], "playing");
    }

    #[test]
    fn test_framed_broadcast_decodes_with_remainder() {
        let first = Message::Broadcast(SyncBroadcast::Idle { version: 3 })
            .encode()
            .unwrap();
        let second = Message::Observer(ObserverMessage::Ready).encode().unwrap();
        let mut buf = first.clone();
        buf.extend_from_slice(&second[..2]);

        let (decoded, consumed) = Message::decode(&buf).unwrap();
        assert_eq!(consumed, first.len());
        match decoded {
            Message::Broadcast(SyncBroadcast::Idle { version }) => assert_eq!(version, 3),
            other => panic!("Wrong message type: {:?}", other),
        }
        assert!(Message::decode(&buf[consumed..]).is_err());
    }

    #[test]
    fn test_observer_message_decodes_as_observer() {
        let encoded = Message::Observer(ObserverMessage::UserVolume { percent: 30 })
            .encode()
            .unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        assert!(matches!(
            decoded,
            Message::Observer(ObserverMessage::UserVolume { percent: 30 })
        ));
    }

    #[test]
    fn test_zone_uses_short_field_names() {
        let zone = Zone {
            id: "z".into(),
            display_name: "Kitchen".into(),
            playback_state: TransportState::Paused,
        };
        let json = serde_json::to_value(&zone).unwrap();
        assert_eq!(json, serde_json::json!({"id": "z", "name": "Kitchen", "state": "paused"}));
    }

    #[test]
    fn test_clamp_position() {
        let state = sample_state();
        assert_eq!(state.clamp_position(-3.0), 0.0);
        assert_eq!(state.clamp_position(600.0), 545.0);
        assert_eq!(state.clamp_position(100.0), 100.0);
    }

    #[test]
    fn test_unreadable_frame_does_not_block_the_next_one() {
        let junk = br#"{"type":"zones-changed"}"#;
        let mut buf = (junk.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(junk);
        buf.extend_from_slice(
            &Message::Broadcast(SyncBroadcast::Idle { version: 1 })
                .encode()
                .unwrap(),
        );
        buf.extend_from_slice(&[0, 0]);

        assert!(matches!(Frame::next(&mut buf), Ok(Some(Frame::Unreadable(_)))));
        assert!(matches!(
            Frame::next(&mut buf),
            Ok(Some(Frame::Message(Message::Broadcast(SyncBroadcast::Idle { version: 1 }))))
        ));
        assert!(matches!(Frame::next(&mut buf), Ok(None)));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        assert!(Frame::next(&mut buf).is_err());
    }
}
