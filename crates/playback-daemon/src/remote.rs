//! Seams to the remote playback system.
//!
//! `BrowseApi` is the raw navigate/select primitive over the single remote
//! browse cursor; `TransportApi` covers zone enumeration, now-playing and
//! transport commands.  The bridge client implements both; tests substitute
//! in-memory fakes.
use async_trait::async_trait;
use playback_proto::protocol::{PlaybackState, TransportAction, Zone};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("remote request timed out")]
    Timeout,
    #[error("remote system is busy")]
    Busy,
    #[error("not connected to the remote system")]
    Disconnected,
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("malformed remote response: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Worth retrying as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Timeout | RemoteError::Busy)
    }
}

/// Hint attached to a browse item describing what browsing into it does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemHint {
    /// Selecting it performs an action (starts playback).
    Action,
    /// Browsing into it lists actions.
    ActionList,
    List,
    Header,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrowseItem {
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub item_key: Option<String>,
    #[serde(default)]
    pub hint: Option<ItemHint>,
}

/// One navigation step against the browse cursor.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BrowseRequest {
    #[serde(skip_serializing_if = "Option::is_none", rename = "zone_or_output_id")]
    pub zone_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub pop_all: bool,
}

impl BrowseRequest {
    pub fn root(zone_id: &str) -> Self {
        Self {
            zone_id: Some(zone_id.to_string()),
            pop_all: true,
            ..Default::default()
        }
    }

    pub fn open(zone_id: &str, item_key: &str) -> Self {
        Self {
            zone_id: Some(zone_id.to_string()),
            item_key: Some(item_key.to_string()),
            ..Default::default()
        }
    }

    pub fn search(zone_id: &str, item_key: &str, input: &str) -> Self {
        Self {
            input: Some(input.to_string()),
            ..Self::open(zone_id, item_key)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrowseAction {
    /// Cursor moved to a new list; `load` returns its items.
    List,
    /// The remote replied with a message (e.g. an action was performed).
    Message,
    /// Nothing to show; typically an action was performed silently.
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ListInfo {
    pub title: String,
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BrowseResult {
    #[serde(default)]
    pub action: BrowseAction,
    #[serde(default)]
    pub list: Option<ListInfo>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

#[async_trait]
pub trait BrowseApi: Send + Sync {
    /// Move the cursor.  Stateful: every call is relative to wherever the
    /// previous call left it.
    async fn browse(&self, request: BrowseRequest) -> Result<BrowseResult, RemoteError>;

    /// Items of the list the cursor currently points at.
    async fn load(&self, offset: usize, count: usize) -> Result<Vec<BrowseItem>, RemoteError>;
}

#[async_trait]
pub trait TransportApi: Send + Sync {
    async fn zones(&self) -> Result<Vec<Zone>, RemoteError>;

    /// Whatever is playing right now, if anything.
    async fn now_playing(&self) -> Result<Option<PlaybackState>, RemoteError>;

    async fn control(&self, zone_id: &str, action: TransportAction) -> Result<(), RemoteError>;

    async fn seek(&self, zone_id: &str, position_seconds: f64) -> Result<(), RemoteError>;

    async fn set_volume(&self, zone_id: &str, percent: u8) -> Result<(), RemoteError>;
}
