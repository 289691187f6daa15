//! Transport commands against an explicit or inferred zone.
//!
//! Control is single-hop and never touches the browse cursor, so it does not
//! queue behind a resolution in progress.
use playback_proto::config::ControlConfig;
use playback_proto::protocol::{TransportAction, Zone};
use playback_proto::state::SelectionStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broadcaster::PlaybackStateBroadcaster;
use crate::error::PlaybackError;
use crate::remote::{RemoteError, TransportApi};

/// Bounded retry for single-hop remote calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
}

impl From<&ControlConfig> for RetryPolicy {
    fn from(config: &ControlConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            attempt_timeout: config.attempt_timeout(),
            retry_delay: config.retry_delay(),
        }
    }
}

impl RetryPolicy {
    /// Run `call` until it succeeds, fails permanently, or the retries run
    /// out.  Only transient errors (timeout, busy) are retried.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "control: {} failed ({}), retry {}/{}",
                        what, e, attempt, self.max_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                other => return other,
            }
        }
    }
}

pub struct ControlChannel {
    transport: Arc<dyn TransportApi>,
    broadcaster: Arc<PlaybackStateBroadcaster>,
    selection: Arc<SelectionStore>,
    retry: RetryPolicy,
}

impl ControlChannel {
    pub fn new(
        transport: Arc<dyn TransportApi>,
        broadcaster: Arc<PlaybackStateBroadcaster>,
        selection: Arc<SelectionStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            broadcaster,
            selection,
            retry,
        }
    }

    /// Explicit zone, else whatever is playing, else the user's last pick.
    pub async fn resolve_zone(&self, explicit: Option<&str>) -> Result<String, PlaybackError> {
        if let Some(zone) = explicit.map(str::trim).filter(|z| !z.is_empty()) {
            self.select_zone(zone).await;
            return Ok(zone.to_string());
        }
        if let Some(zone) = self.broadcaster.current_zone().await {
            debug!("control: inferred playing zone {}", zone);
            return Ok(zone);
        }
        if let Some(zone) = self.selection.selected_zone().await {
            debug!("control: falling back to selected zone {}", zone);
            return Ok(zone);
        }
        Err(PlaybackError::NothingPlaying)
    }

    /// Remember an explicit choice.  Persisting is best effort.
    pub async fn select_zone(&self, zone_id: &str) {
        if let Err(e) = self.selection.select_zone(zone_id).await {
            warn!("control: could not persist zone {}: {}", zone_id, e);
        }
    }

    pub async fn clear_selection(&self) {
        if let Err(e) = self.selection.clear().await {
            warn!("control: could not clear zone selection: {}", e);
        }
    }

    pub async fn zones(&self) -> Result<Vec<Zone>, PlaybackError> {
        let transport = self.transport.clone();
        let zones = self
            .retry
            .run("zones", || {
                let transport = transport.clone();
                async move { transport.zones().await }
            })
            .await?;
        Ok(zones)
    }

    /// Returns the zone the command went to.
    pub async fn control(
        &self,
        zone: Option<&str>,
        action: TransportAction,
    ) -> Result<String, PlaybackError> {
        let zone_id = self.resolve_zone(zone).await?;
        let transport = self.transport.clone();
        self.retry
            .run(action.as_str(), || {
                let transport = transport.clone();
                let zone_id = zone_id.clone();
                async move { transport.control(&zone_id, action).await }
            })
            .await?;
        info!("control: {} -> {}", action.as_str(), zone_id);
        Ok(zone_id)
    }

    pub async fn seek(&self, zone: Option<&str>, position_seconds: f64) -> Result<String, PlaybackError> {
        if !position_seconds.is_finite() || position_seconds < 0.0 {
            return Err(PlaybackError::InvalidRequest(format!(
                "seek position must be a non-negative number of seconds, got {}",
                position_seconds
            )));
        }
        let zone_id = self.resolve_zone(zone).await?;
        let tracked = self.tracks(&zone_id).await;
        if tracked {
            self.broadcaster.begin_seek(position_seconds).await;
        }

        let transport = self.transport.clone();
        let result = self
            .retry
            .run("seek", || {
                let transport = transport.clone();
                let zone_id = zone_id.clone();
                async move { transport.seek(&zone_id, position_seconds).await }
            })
            .await;

        match result {
            Ok(()) => {
                if tracked {
                    let version = self.broadcaster.commit_seek(position_seconds).await;
                    debug!("control: seek {:.1}s committed as v{}", position_seconds, version);
                }
                Ok(zone_id)
            }
            Err(e) => {
                if tracked {
                    self.broadcaster.abort_seek().await;
                    self.broadcaster.publish_error(format!("Seek failed: {}", e));
                }
                Err(e.into())
            }
        }
    }

    pub async fn set_volume(&self, zone: Option<&str>, percent: i64) -> Result<String, PlaybackError> {
        let percent = u8::try_from(percent)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                PlaybackError::InvalidRequest(format!("volume must be 0-100, got {}", percent))
            })?;
        let zone_id = self.resolve_zone(zone).await?;
        let tracked = self.tracks(&zone_id).await;
        if tracked {
            self.broadcaster.begin_volume(percent).await;
        }

        let transport = self.transport.clone();
        let result = self
            .retry
            .run("volume", || {
                let transport = transport.clone();
                let zone_id = zone_id.clone();
                async move { transport.set_volume(&zone_id, percent).await }
            })
            .await;

        match result {
            Ok(()) => {
                if tracked {
                    self.broadcaster.commit_volume(percent).await;
                }
                Ok(zone_id)
            }
            Err(e) => {
                if tracked {
                    self.broadcaster.abort_volume().await;
                    self.broadcaster.publish_error(format!("Volume change failed: {}", e));
                }
                Err(e.into())
            }
        }
    }

    /// Whether the broadcaster is currently showing this zone.
    async fn tracks(&self, zone_id: &str) -> bool {
        self.broadcaster.current_zone().await.as_deref() == Some(zone_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::BrowseSessionCoordinator;
    use crate::testing::{playing_state, FakeCatalog, FakeTransport};
    use playback_proto::protocol::SyncBroadcast;
    use tokio::sync::broadcast;

    struct Harness {
        transport: Arc<FakeTransport>,
        broadcaster: Arc<PlaybackStateBroadcaster>,
        selection: Arc<SelectionStore>,
        control: ControlChannel,
        _dir: tempfile::TempDir,
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            attempt_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(10),
        }
    }

    fn harness(transport: FakeTransport) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = broadcast::channel(32);
        let transport = Arc::new(transport);
        let broadcaster = Arc::new(PlaybackStateBroadcaster::new(tx));
        let selection = Arc::new(SelectionStore::new(dir.path().join("state.json")));
        let control = ControlChannel::new(
            transport.clone(),
            broadcaster.clone(),
            selection.clone(),
            policy(),
        );
        Harness {
            transport,
            broadcaster,
            selection,
            control,
            _dir: dir,
        }
    }

    async fn observe(h: &Harness, zone: &str, position: f64) {
        let t = h.broadcaster.poll_ticket().await;
        h.broadcaster
            .apply_poll(t, Some(playing_state(zone, position)))
            .await;
    }

    #[tokio::test]
    async fn test_pause_infers_playing_zone() {
        let h = harness(FakeTransport::new());
        observe(&h, "zone-2", 10.0).await;

        let zone = h.control.control(None, TransportAction::Pause).await.unwrap();
        assert_eq!(zone, "zone-2");
        assert_eq!(h.transport.calls(), vec!["pause zone-2"]);
    }

    #[tokio::test]
    async fn test_nothing_playing_is_a_distinct_error() {
        let h = harness(FakeTransport::new());
        let err = h.control.control(None, TransportAction::Pause).await.unwrap_err();
        assert!(matches!(err, PlaybackError::NothingPlaying));
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_selected_zone_used_when_nothing_plays() {
        let h = harness(FakeTransport::new());
        h.selection.select_zone("zone-1").await.unwrap();
        h.control.control(None, TransportAction::Play).await.unwrap();
        assert_eq!(h.transport.calls(), vec!["play zone-1"]);
    }

    #[tokio::test]
    async fn test_playing_zone_beats_selected_zone() {
        let h = harness(FakeTransport::new());
        h.selection.select_zone("zone-1").await.unwrap();
        observe(&h, "zone-2", 0.0).await;
        assert_eq!(h.control.resolve_zone(None).await.unwrap(), "zone-2");

        // Explicit wins and becomes the selection
        assert_eq!(h.control.resolve_zone(Some("zone-9")).await.unwrap(), "zone-9");
        assert_eq!(h.selection.selected_zone().await.as_deref(), Some("zone-9"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_twice() {
        let h = harness(FakeTransport::new());
        h.transport
            .fail_next(&[RemoteError::Busy, RemoteError::Timeout]);
        h.control
            .control(Some("zone-1"), TransportAction::Next)
            .await
            .unwrap();
        assert_eq!(h.transport.calls().len(), 3);

        h.transport.fail_next(&[
            RemoteError::Busy,
            RemoteError::Busy,
            RemoteError::Busy,
            RemoteError::Busy,
        ]);
        let err = h
            .control
            .control(Some("zone-1"), TransportAction::Next)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybackError::Remote(RemoteError::Busy)));
        assert_eq!(h.transport.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness(FakeTransport::new());
        h.transport
            .fail_next(&[RemoteError::Rejected("zone offline".into())]);
        let err = h
            .control
            .control(Some("zone-1"), TransportAction::Stop)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybackError::Remote(RemoteError::Rejected(_))));
        assert_eq!(h.transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_times_out_per_attempt() {
        let h = harness(FakeTransport::new().with_call_delay(Duration::from_secs(60)));
        let started = tokio::time::Instant::now();
        let err = h
            .control
            .control(Some("zone-1"), TransportAction::Pause)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybackError::Remote(RemoteError::Timeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_seek_commits_new_version() {
        let h = harness(FakeTransport::new());
        observe(&h, "zone-1", 40.0).await;
        let mut rx = h.broadcaster.subscribe();

        h.control.seek(None, 120.0).await.unwrap();
        assert_eq!(h.transport.calls(), vec!["seek zone-1 120"]);
        match rx.try_recv().unwrap() {
            SyncBroadcast::State { version, state } => {
                assert_eq!(version, 2);
                assert!((state.position_seconds - 120.0).abs() < 0.5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_seek_rebroadcasts_and_reports() {
        let h = harness(FakeTransport::new());
        observe(&h, "zone-1", 40.0).await;
        let mut rx = h.broadcaster.subscribe();
        h.transport
            .fail_next(&[RemoteError::Rejected("not seekable".into())]);

        assert!(h.control.seek(None, 120.0).await.is_err());
        let pos = h.broadcaster.current().await.unwrap().position_seconds;
        assert!(pos < 41.0);
        assert!(matches!(rx.try_recv().unwrap(), SyncBroadcast::State { version: 2, .. }));
        assert!(matches!(rx.try_recv().unwrap(), SyncBroadcast::Error { .. }));
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected_before_any_call() {
        let h = harness(FakeTransport::new());
        observe(&h, "zone-1", 0.0).await;
        assert!(matches!(
            h.control.set_volume(None, 101).await,
            Err(PlaybackError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.control.set_volume(None, -1).await,
            Err(PlaybackError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.control.seek(None, f64::NAN).await,
            Err(PlaybackError::InvalidRequest(_))
        ));
        assert!(h.transport.calls().is_empty());

        h.control.set_volume(None, 100).await.unwrap();
        assert_eq!(h.broadcaster.current().await.unwrap().volume_percent, Some(100));
    }

    #[tokio::test]
    async fn test_control_does_not_wait_for_browse_session() {
        let h = harness(FakeTransport::new());
        let coordinator = Arc::new(BrowseSessionCoordinator::new(Arc::new(FakeCatalog::new())));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let c = coordinator.clone();
        let busy = tokio::spawn(async move {
            c.with_exclusive_access(|_api| async move {
                let _ = release_rx.await;
                Ok::<_, RemoteError>(())
            })
            .await
        });
        while coordinator.queue_depth() == 0 {
            tokio::task::yield_now().await;
        }

        h.control
            .control(Some("zone-1"), TransportAction::Pause)
            .await
            .unwrap();
        assert_eq!(coordinator.queue_depth(), 1);

        release_tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
    }
}
