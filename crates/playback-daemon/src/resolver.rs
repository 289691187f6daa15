//! Turns a loosely spelled (artist, album) pair into started playback.
//!
//! For each configured strategy, in order, every candidate spelling is tried
//! through the browse session coordinator until one descent ends in a
//! successful action.  Each attempt holds the cursor for its whole descent
//! and is bounded by one generous timeout: a descent is 6-10 round trips, and
//! a per-hop timeout fires during perfectly healthy descents.
//!
//! ```text
//!   root (pop_all) → <source> → Search(query) → Albums|Artists → entry
//!        → action list → action
//! ```
use playback_proto::config::{ResolverConfig, StrategyKind};
use playback_proto::state::SelectionStore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coordinator::BrowseSessionCoordinator;
use crate::error::PlaybackError;
use crate::remote::{BrowseAction, BrowseApi, BrowseItem, BrowseRequest, BrowseResult, ItemHint, RemoteError};
use crate::variants::VariantGenerator;

const SEARCH_TITLE: &str = "Search";
const ALBUMS_TITLE: &str = "Albums";
const ARTISTS_TITLE: &str = "Artists";

/// Never page through more than this many items of one list.
const MAX_LIST_ITEMS: usize = 1000;

/// Result of a resolution that did not hit a hard remote failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Started {
        strategy: StrategyKind,
        artist_variant: String,
        album_variant: Option<String>,
        attempts: usize,
    },
    NotFound {
        attempts: usize,
        strategies: Vec<StrategyKind>,
    },
}

impl Resolution {
    pub fn is_started(&self) -> bool {
        matches!(self, Resolution::Started { .. })
    }
}

/// One cell of the variant cross-product, shaped for a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Candidate {
    artist: String,
    album: Option<String>,
    query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionPick {
    First,
    Named,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Started,
    Miss,
    TimedOut,
}

pub struct PlaybackResolver {
    coordinator: Arc<BrowseSessionCoordinator>,
    variants: VariantGenerator,
    selection: Arc<SelectionStore>,
    strategies: Vec<StrategyKind>,
    attempt_timeout: Duration,
    play_action_title: String,
    source_title: String,
    page_size: usize,
}

impl PlaybackResolver {
    pub fn new(
        coordinator: Arc<BrowseSessionCoordinator>,
        variants: VariantGenerator,
        selection: Arc<SelectionStore>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            coordinator,
            variants,
            selection,
            strategies: config.strategies.clone(),
            attempt_timeout: config.attempt_timeout(),
            play_action_title: config.play_action_title.clone(),
            source_title: config.source_title.clone(),
            page_size: config.page_size.max(1),
        }
    }

    /// Resolve and start `album` by `artist` in `zone_id`.
    ///
    /// Exhausting every option is `Ok(Resolution::NotFound)`; only a lost
    /// bridge connection is an error.
    pub async fn play_album(
        &self,
        artist: &str,
        album: &str,
        zone_id: &str,
    ) -> Result<Resolution, PlaybackError> {
        let artist_variants = self.variants.generate_artist_variants(artist);
        let album_variants = self.variants.generate_album_variants(album);
        info!(
            "resolve: '{}' by '{}' in {} ({} artist x {} album variants)",
            album,
            artist,
            zone_id,
            artist_variants.len(),
            album_variants.len()
        );

        let mut attempts = 0usize;
        let mut tried = Vec::new();
        for &strategy in &self.strategies {
            tried.push(strategy);
            let candidates = candidates_for(strategy, &artist_variants, &album_variants);
            debug!(
                "resolve: strategy {} with {} candidates",
                strategy.as_str(),
                candidates.len()
            );

            for candidate in &candidates {
                attempts += 1;
                match self.attempt(strategy, candidate, zone_id).await? {
                    AttemptOutcome::Started => {
                        info!(
                            "resolve: started '{}' via {} after {} attempts",
                            candidate.query,
                            strategy.as_str(),
                            attempts
                        );
                        if let Err(e) = self.selection.select_zone(zone_id).await {
                            warn!("resolve: could not persist zone {}: {}", zone_id, e);
                        }
                        return Ok(Resolution::Started {
                            strategy,
                            artist_variant: candidate.artist.clone(),
                            album_variant: candidate.album.clone(),
                            attempts,
                        });
                    }
                    AttemptOutcome::TimedOut => {
                        warn!(
                            "resolve: '{}' via {} timed out after {:?}",
                            candidate.query,
                            strategy.as_str(),
                            self.attempt_timeout
                        );
                    }
                    AttemptOutcome::Miss => {}
                }
            }
        }

        info!(
            "resolve: no match for '{}' by '{}' after {} attempts",
            album, artist, attempts
        );
        Ok(Resolution::NotFound {
            attempts,
            strategies: tried,
        })
    }

    /// One navigate-and-select under exclusive access.  The timeout starts
    /// once the cursor is ours, so time spent queued is not charged to it.
    async fn attempt(
        &self,
        strategy: StrategyKind,
        candidate: &Candidate,
        zone_id: &str,
    ) -> Result<AttemptOutcome, PlaybackError> {
        let timeout = self.attempt_timeout;
        let result = self
            .coordinator
            .with_exclusive_access(|api| async move {
                let descent = self.navigate_and_select(api.as_ref(), strategy, candidate, zone_id);
                match tokio::time::timeout(timeout, descent).await {
                    Ok(Ok(true)) => Ok(AttemptOutcome::Started),
                    Ok(Ok(false)) => Ok(AttemptOutcome::Miss),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Ok(AttemptOutcome::TimedOut),
                }
            })
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(RemoteError::Disconnected) => Err(PlaybackError::Remote(RemoteError::Disconnected)),
            Err(e) => {
                warn!("resolve: '{}' failed: {}", candidate.query, e);
                Ok(AttemptOutcome::Miss)
            }
        }
    }

    async fn navigate_and_select(
        &self,
        api: &dyn BrowseApi,
        strategy: StrategyKind,
        candidate: &Candidate,
        zone_id: &str,
    ) -> Result<bool, RemoteError> {
        let root = api.browse(BrowseRequest::root(zone_id)).await?;
        let items = self.list_items(api, &root).await?;

        let Some(items) = self.open_titled(api, zone_id, &items, &self.source_title).await? else {
            return Ok(false);
        };

        let Some(search) = find_titled(&items, SEARCH_TITLE).and_then(|i| i.item_key.clone()) else {
            debug!("resolve: no search entry under {}", self.source_title);
            return Ok(false);
        };
        debug!("resolve: search '{}'", candidate.query);
        let result = api
            .browse(BrowseRequest::search(zone_id, &search, &candidate.query))
            .await?;
        if !is_list(&result) {
            return Ok(false);
        }
        let items = self.list_items(api, &result).await?;

        let category = if candidate.album.is_some() {
            ALBUMS_TITLE
        } else {
            ARTISTS_TITLE
        };
        let Some(entries) = self.open_titled(api, zone_id, &items, category).await? else {
            return Ok(false);
        };

        let entry = entries.iter().find(|item| match &candidate.album {
            Some(album) => album_matches(item, &candidate.artist, album),
            None => same_name(&item.title, &candidate.artist),
        });
        let Some(entry) = entry else {
            debug!("resolve: no {} entry matches '{}'", category, candidate.query);
            return Ok(false);
        };

        let Some(actions) = self.open_action_list(api, zone_id, entry).await? else {
            return Ok(false);
        };

        let pick = match strategy {
            StrategyKind::DefaultAction | StrategyKind::ArtistOnly => ActionPick::First,
            StrategyKind::NamedAction | StrategyKind::ExactOnly => ActionPick::Named,
        };
        let action = match pick {
            ActionPick::First => actions.iter().find(|i| i.hint == Some(ItemHint::Action)),
            ActionPick::Named => actions
                .iter()
                .find(|i| i.hint == Some(ItemHint::Action) && same_name(&i.title, &self.play_action_title)),
        };
        let Some(key) = action.and_then(|a| a.item_key.as_deref()) else {
            debug!("resolve: no {:?} action for '{}'", pick, entry.title);
            return Ok(false);
        };

        let outcome = api.browse(BrowseRequest::open(zone_id, key)).await?;
        if outcome.is_error {
            debug!(
                "resolve: action rejected: {}",
                outcome.message.as_deref().unwrap_or("no message")
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Open the entry and return the actions under it.  Entries either are an
    /// action list themselves or contain one (e.g. "Play Album") first.
    async fn open_action_list(
        &self,
        api: &dyn BrowseApi,
        zone_id: &str,
        entry: &BrowseItem,
    ) -> Result<Option<Vec<BrowseItem>>, RemoteError> {
        let Some(items) = self.open(api, zone_id, entry).await? else {
            return Ok(None);
        };
        if entry.hint == Some(ItemHint::ActionList) {
            return Ok(Some(items));
        }
        match items.iter().find(|i| i.hint == Some(ItemHint::ActionList)) {
            Some(list) => self.open(api, zone_id, list).await,
            None => Ok(None),
        }
    }

    async fn open_titled(
        &self,
        api: &dyn BrowseApi,
        zone_id: &str,
        items: &[BrowseItem],
        title: &str,
    ) -> Result<Option<Vec<BrowseItem>>, RemoteError> {
        match find_titled(items, title) {
            Some(item) => self.open(api, zone_id, item).await,
            None => {
                debug!("resolve: no '{}' entry", title);
                Ok(None)
            }
        }
    }

    /// Browse into `item` and load the list it leads to.
    async fn open(
        &self,
        api: &dyn BrowseApi,
        zone_id: &str,
        item: &BrowseItem,
    ) -> Result<Option<Vec<BrowseItem>>, RemoteError> {
        let Some(key) = item.item_key.as_deref() else {
            return Ok(None);
        };
        let result = api.browse(BrowseRequest::open(zone_id, key)).await?;
        if !is_list(&result) {
            return Ok(None);
        }
        self.list_items(api, &result).await.map(Some)
    }

    async fn list_items(
        &self,
        api: &dyn BrowseApi,
        result: &BrowseResult,
    ) -> Result<Vec<BrowseItem>, RemoteError> {
        let total = result
            .list
            .as_ref()
            .map(|l| l.count)
            .unwrap_or(self.page_size)
            .min(MAX_LIST_ITEMS);
        let mut items = Vec::new();
        while items.len() < total {
            let page = api.load(items.len(), self.page_size).await?;
            if page.is_empty() {
                break;
            }
            items.extend(page);
        }
        Ok(items)
    }
}

/// Candidates for one strategy, in priority order (artist varies slowest),
/// without duplicates.
fn candidates_for(
    strategy: StrategyKind,
    artist_variants: &[String],
    album_variants: &[String],
) -> Vec<Candidate> {
    let identity = |v: &[String]| v.first().cloned().unwrap_or_default();
    let raw: Vec<Candidate> = match strategy {
        StrategyKind::DefaultAction | StrategyKind::NamedAction => artist_variants
            .iter()
            .flat_map(|artist| {
                album_variants.iter().map(move |album| Candidate {
                    artist: artist.clone(),
                    album: Some(album.clone()),
                    query: format!("{} {}", artist.trim(), album.trim()),
                })
            })
            .collect(),
        StrategyKind::ExactOnly => {
            let album = identity(album_variants);
            vec![Candidate {
                artist: identity(artist_variants),
                query: album.trim().to_string(),
                album: Some(album),
            }]
        }
        StrategyKind::ArtistOnly => artist_variants
            .iter()
            .map(|artist| Candidate {
                artist: artist.clone(),
                album: None,
                query: artist.trim().to_string(),
            })
            .collect(),
    };

    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|c| !c.query.is_empty() && seen.insert(c.clone()))
        .collect()
}

fn is_list(result: &BrowseResult) -> bool {
    !result.is_error && result.action == BrowseAction::List
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn same_name(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

fn find_titled<'a>(items: &'a [BrowseItem], title: &str) -> Option<&'a BrowseItem> {
    items.iter().find(|i| same_name(&i.title, title))
}

/// Album title must match exactly; the artist only has to appear in the
/// subtitle, which often lists several performers.
fn album_matches(item: &BrowseItem, artist: &str, album: &str) -> bool {
    if !same_name(&item.title, album) {
        return false;
    }
    match &item.subtitle {
        Some(subtitle) => normalize(subtitle).contains(&normalize(artist)),
        None => true,
    }
}
