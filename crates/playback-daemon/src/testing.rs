//! In-memory stand-ins for the remote system, shared by the daemon's tests.
use async_trait::async_trait;
use chrono::Utc;
use playback_proto::protocol::{PlaybackState, TransportAction, TransportState, Zone};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::remote::{
    BrowseAction, BrowseApi, BrowseItem, BrowseRequest, BrowseResult, ItemHint, ListInfo,
    RemoteError, TransportApi,
};

#[derive(Debug, Clone)]
pub struct FakeAction {
    pub title: String,
    /// Selecting it starts playback; otherwise the remote answers with an error.
    pub works: bool,
}

#[derive(Debug, Clone)]
pub struct FakeAlbum {
    pub artist: String,
    pub title: String,
    pub actions: Vec<FakeAction>,
}

fn standard_actions() -> Vec<FakeAction> {
    ["Play Now", "Add Next", "Queue", "Start Radio"]
        .iter()
        .map(|t| FakeAction {
            title: t.to_string(),
            works: true,
        })
        .collect()
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Default)]
struct Cursor {
    items: Vec<BrowseItem>,
    /// Set by the last search, consumed by the category lists.
    query: String,
}

/// A hierarchical catalog behind a single browse cursor.
///
/// Like the real system, every `browse` is relative to the cursor's current
/// list, so an `item_key` that is not in the current list is rejected.  That
/// makes interleaved descents observable as failures.
#[derive(Default)]
pub struct FakeCatalog {
    albums: Vec<FakeAlbum>,
    hop_delay: Duration,
    fail_with: Mutex<Option<RemoteError>>,
    cursor: Mutex<Cursor>,
    pub plays: Mutex<Vec<(String, String)>>,
    pub searches: Mutex<Vec<String>>,
    pub stale_keys: AtomicUsize,
    active: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_album(mut self, artist: &str, title: &str) -> Self {
        self.albums.push(FakeAlbum {
            artist: artist.to_string(),
            title: title.to_string(),
            actions: standard_actions(),
        });
        self
    }

    pub fn with_album_actions(mut self, artist: &str, title: &str, actions: &[(&str, bool)]) -> Self {
        self.albums.push(FakeAlbum {
            artist: artist.to_string(),
            title: title.to_string(),
            actions: actions
                .iter()
                .map(|(t, works)| FakeAction {
                    title: t.to_string(),
                    works: *works,
                })
                .collect(),
        });
        self
    }

    /// Every browse/load call sleeps this long.
    pub fn with_hop_delay(mut self, delay: Duration) -> Self {
        self.hop_delay = delay;
        self
    }

    pub fn fail_with(&self, error: RemoteError) {
        *self.fail_with.lock().unwrap() = Some(error);
    }

    pub fn plays(&self) -> Vec<(String, String)> {
        self.plays.lock().unwrap().clone()
    }

    pub fn searches(&self) -> Vec<String> {
        self.searches.lock().unwrap().clone()
    }

    fn artists(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for album in &self.albums {
            if !names.contains(&album.artist) {
                names.push(album.artist.clone());
            }
        }
        names
    }

    fn listing(&self, key: &str, query: &str) -> Option<(String, Vec<BrowseItem>)> {
        let list = |title: &str, key: String, hint: ItemHint| BrowseItem {
            title: title.to_string(),
            subtitle: None,
            item_key: Some(key),
            hint: Some(hint),
        };

        if key == "library" {
            return Some((
                "Library".into(),
                vec![
                    list("Search", "search".into(), ItemHint::List),
                    list("Artists", "all-artists".into(), ItemHint::List),
                ],
            ));
        }
        if key == "cat:albums" {
            let q = normalize(query);
            let items = self
                .albums
                .iter()
                .enumerate()
                .filter(|(_, a)| q.contains(&normalize(&a.title)))
                .map(|(i, a)| BrowseItem {
                    title: a.title.clone(),
                    subtitle: Some(a.artist.clone()),
                    item_key: Some(format!("album:{}", i)),
                    hint: Some(ItemHint::List),
                })
                .collect();
            return Some(("Albums".into(), items));
        }
        if key == "cat:artists" {
            let q = normalize(query);
            let items = self
                .artists()
                .iter()
                .enumerate()
                .filter(|(_, a)| q.contains(&normalize(a)))
                .map(|(i, a)| list(a, format!("artist:{}", i), ItemHint::List))
                .collect();
            return Some(("Artists".into(), items));
        }
        let parts: Vec<&str> = key.split(':').collect();
        match parts.as_slice() {
            ["album", i] => {
                let album = self.albums.get(i.parse::<usize>().ok()?)?;
                Some((
                    album.title.clone(),
                    vec![
                        list("Play Album", format!("album:{}:actions", i), ItemHint::ActionList),
                        list("1. Intro", format!("album:{}:track", i), ItemHint::ActionList),
                    ],
                ))
            }
            ["album", i, "actions"] => {
                let album = self.albums.get(i.parse::<usize>().ok()?)?;
                let items = album
                    .actions
                    .iter()
                    .enumerate()
                    .map(|(j, a)| list(&a.title, format!("album:{}:act:{}", i, j), ItemHint::Action))
                    .collect();
                Some(("Play Album".into(), items))
            }
            ["artist", i] => {
                let name = self.artists().get(i.parse::<usize>().ok()?)?.clone();
                Some((
                    name,
                    vec![list("Play Artist", format!("artist:{}:actions", i), ItemHint::ActionList)],
                ))
            }
            ["artist", i, "actions"] => Some((
                "Play Artist".into(),
                vec![
                    list("Shuffle", format!("artist:{}:act:0", i), ItemHint::Action),
                    list("Start Radio", format!("artist:{}:act:1", i), ItemHint::Action),
                ],
            )),
            _ => None,
        }
    }

    /// Selecting an action item: records the play, reports whether it worked.
    fn perform(&self, zone: &str, key: &str) -> Option<bool> {
        let parts: Vec<&str> = key.split(':').collect();
        match parts.as_slice() {
            ["album", i, "act", j] => {
                let album = self.albums.get(i.parse::<usize>().ok()?)?;
                let action = album.actions.get(j.parse::<usize>().ok()?)?;
                if action.works {
                    self.plays
                        .lock()
                        .unwrap()
                        .push((zone.to_string(), album.title.clone()));
                }
                Some(action.works)
            }
            ["artist", i, "act", _] => {
                let name = self.artists().get(i.parse::<usize>().ok()?)?.clone();
                self.plays.lock().unwrap().push((zone.to_string(), name));
                Some(true)
            }
            _ => None,
        }
    }

    async fn enter_hop(&self) -> Result<HopGuard<'_>, RemoteError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        let guard = HopGuard(&self.active);
        if !self.hop_delay.is_zero() {
            tokio::time::sleep(self.hop_delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(guard)
    }
}

struct HopGuard<'a>(&'a AtomicUsize);

impl Drop for HopGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn list_result(title: String, count: usize) -> BrowseResult {
    BrowseResult {
        action: BrowseAction::List,
        list: Some(ListInfo { title, count }),
        message: None,
        is_error: false,
    }
}

fn error_result(message: &str) -> BrowseResult {
    BrowseResult {
        action: BrowseAction::Message,
        list: None,
        message: Some(message.to_string()),
        is_error: true,
    }
}

#[async_trait]
impl BrowseApi for FakeCatalog {
    async fn browse(&self, request: BrowseRequest) -> Result<BrowseResult, RemoteError> {
        let _hop = self.enter_hop().await?;
        let zone = request.zone_id.clone().unwrap_or_default();
        let mut cursor = self.cursor.lock().unwrap();

        if request.pop_all {
            cursor.items = vec![
                BrowseItem {
                    title: "Library".into(),
                    subtitle: None,
                    item_key: Some("library".into()),
                    hint: Some(ItemHint::List),
                },
                BrowseItem {
                    title: "Settings".into(),
                    subtitle: None,
                    item_key: Some("settings".into()),
                    hint: Some(ItemHint::List),
                },
            ];
            return Ok(list_result("Explore".into(), cursor.items.len()));
        }

        let key = request.item_key.clone().unwrap_or_default();
        if !cursor.items.iter().any(|i| i.item_key.as_deref() == Some(key.as_str())) {
            self.stale_keys.fetch_add(1, Ordering::SeqCst);
            return Err(RemoteError::Rejected(format!("item key {} is not in the current list", key)));
        }

        if key == "search" {
            let query = request.input.clone().unwrap_or_default();
            self.searches.lock().unwrap().push(query.clone());
            let q = normalize(&query);
            let mut items = Vec::new();
            if self.albums.iter().any(|a| q.contains(&normalize(&a.title))) {
                items.push(BrowseItem {
                    title: "Albums".into(),
                    subtitle: None,
                    item_key: Some("cat:albums".into()),
                    hint: Some(ItemHint::List),
                });
            }
            if self.artists().iter().any(|a| q.contains(&normalize(a))) {
                items.push(BrowseItem {
                    title: "Artists".into(),
                    subtitle: None,
                    item_key: Some("cat:artists".into()),
                    hint: Some(ItemHint::List),
                });
            }
            cursor.query = query;
            cursor.items = items;
            return Ok(list_result("Search".into(), cursor.items.len()));
        }

        if let Some(started) = self.perform(&zone, &key) {
            return Ok(if started {
                BrowseResult {
                    action: BrowseAction::None,
                    ..Default::default()
                }
            } else {
                error_result("That action is not available")
            });
        }

        match self.listing(&key, &cursor.query) {
            Some((title, items)) => {
                cursor.items = items;
                Ok(list_result(title, cursor.items.len()))
            }
            None => Ok(error_result("Nothing here")),
        }
    }

    async fn load(&self, offset: usize, count: usize) -> Result<Vec<BrowseItem>, RemoteError> {
        let _hop = self.enter_hop().await?;
        let cursor = self.cursor.lock().unwrap();
        Ok(cursor.items.iter().skip(offset).take(count).cloned().collect())
    }
}

/// Transport double: scripted failures, a call log, mutable now-playing.
#[derive(Default)]
pub struct FakeTransport {
    pub zones: Vec<Zone>,
    now_playing: Mutex<Option<PlaybackState>>,
    failures: Mutex<VecDeque<RemoteError>>,
    pub calls: Mutex<Vec<String>>,
    call_delay: Duration,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            zones: vec![
                Zone {
                    id: "zone-1".into(),
                    display_name: "Living Room".into(),
                    playback_state: TransportState::Playing,
                },
                Zone {
                    id: "zone-2".into(),
                    display_name: "Kitchen".into(),
                    playback_state: TransportState::Stopped,
                },
            ],
            ..Default::default()
        }
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn set_now_playing(&self, state: Option<PlaybackState>) {
        *self.now_playing.lock().unwrap() = state;
    }

    /// Queue errors returned by the next transport calls, in order.
    pub fn fail_next(&self, errors: &[RemoteError]) {
        self.failures.lock().unwrap().extend(errors.iter().cloned());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn call(&self, entry: String) -> Result<(), RemoteError> {
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        self.calls.lock().unwrap().push(entry);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TransportApi for FakeTransport {
    async fn zones(&self) -> Result<Vec<Zone>, RemoteError> {
        Ok(self.zones.clone())
    }

    async fn now_playing(&self) -> Result<Option<PlaybackState>, RemoteError> {
        Ok(self.now_playing.lock().unwrap().clone())
    }

    async fn control(&self, zone_id: &str, action: TransportAction) -> Result<(), RemoteError> {
        self.call(format!("{} {}", action.as_str(), zone_id)).await
    }

    async fn seek(&self, zone_id: &str, position_seconds: f64) -> Result<(), RemoteError> {
        self.call(format!("seek {} {}", zone_id, position_seconds)).await?;
        if let Some(state) = self.now_playing.lock().unwrap().as_mut() {
            state.position_seconds = position_seconds;
        }
        Ok(())
    }

    async fn set_volume(&self, zone_id: &str, percent: u8) -> Result<(), RemoteError> {
        self.call(format!("volume {} {}", zone_id, percent)).await?;
        if let Some(state) = self.now_playing.lock().unwrap().as_mut() {
            state.volume_percent = Some(percent);
        }
        Ok(())
    }
}

pub fn playing_state(zone_id: &str, position: f64) -> PlaybackState {
    PlaybackState {
        track_title: "Girls & Boys".into(),
        artist: "Blur".into(),
        album: "Parklife".into(),
        zone_id: zone_id.to_string(),
        zone_name: "Living Room".into(),
        position_seconds: position,
        duration_seconds: Some(290.0),
        volume_percent: Some(30),
        transport_state: TransportState::Playing,
        image_url: None,
        fetched_at: Utc::now(),
    }
}
