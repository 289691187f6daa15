use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// What survives a daemon restart: the zone the user last picked explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistentState {
    #[serde(default)]
    pub selected_zone: Option<String>,
}

/// Holds the user's explicit zone selection and mirrors it to `state.json`.
///
/// Zone inference only falls back to this when nothing is currently playing,
/// so it is written on every explicit choice and read rarely.
pub struct SelectionStore {
    state: Arc<RwLock<PersistentState>>,
    state_file: PathBuf,
}

impl SelectionStore {
    pub fn new(state_file: PathBuf) -> Self {
        let persistent = Self::load_persistent(&state_file);
        Self {
            state: Arc::new(RwLock::new(persistent)),
            state_file,
        }
    }

    pub async fn selected_zone(&self) -> Option<String> {
        self.state.read().await.selected_zone.clone()
    }

    /// Record an explicit selection.  Re-selecting the current zone is a no-op.
    pub async fn select_zone(&self, zone_id: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            if state.selected_zone.as_deref() == Some(zone_id) {
                return Ok(());
            }
            state.selected_zone = Some(zone_id.to_string());
        }
        self.save().await
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        self.state.write().await.selected_zone = None;
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = self.state.read().await.clone();

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            match serde_json::from_str::<PersistentState>(&content) {
                Ok(persistent) => return persistent,
                Err(e) => tracing::warn!("ignoring unreadable {:?}: {}", state_file, e),
            }
        }
        PersistentState::default()
    }
}
