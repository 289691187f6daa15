//! Album id lookup against the collection service.
use async_trait::async_trait;
use playback_proto::config::CollectionConfig;
use serde::Deserialize;
use tracing::debug;

use crate::error::PlaybackError;

const USER_AGENT: &str = concat!("playback-daemon/", env!("CARGO_PKG_VERSION"));

/// Names to hand to the resolver for one collection album.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AlbumNames {
    pub artist_name: String,
    pub title: String,
}

#[async_trait]
pub trait AlbumDirectory: Send + Sync {
    async fn lookup(&self, album_id: &str) -> Result<AlbumNames, PlaybackError>;
}

pub struct HttpAlbumDirectory {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpAlbumDirectory {
    pub fn new(config: &CollectionConfig) -> Result<Self, PlaybackError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()
            .map_err(|e| PlaybackError::Collection(e.to_string()))?;
        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AlbumDirectory for HttpAlbumDirectory {
    async fn lookup(&self, album_id: &str) -> Result<AlbumNames, PlaybackError> {
        let album_id = album_id.trim();
        if album_id.is_empty() || album_id.contains('/') {
            return Err(PlaybackError::InvalidRequest(format!(
                "bad album id '{}'",
                album_id
            )));
        }

        let url = format!("{}/api/albums/{}", self.base_url, album_id);
        debug!("collection: GET {}", url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| PlaybackError::Collection(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PlaybackError::UnknownAlbum(album_id.to_string()));
        }
        if !status.is_success() {
            return Err(PlaybackError::Collection(format!(
                "collection service answered {}",
                status
            )));
        }

        response
            .json::<AlbumNames>()
            .await
            .map_err(|e| PlaybackError::Collection(e.to_string()))
    }
}
