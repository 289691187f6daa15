use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::remote::RemoteError;

/// Outcomes surfaced to HTTP callers and observers.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// Every strategy and spelling was tried.  Actionable: try another spelling.
    #[error("could not find \"{album}\" by {artist}; try a different spelling")]
    NotFound { artist: String, album: String },
    /// No zone given and none could be inferred.
    #[error("nothing is playing yet; start an album or pick a zone first")]
    NothingPlaying,
    #[error("unknown album id {0}")]
    UnknownAlbum(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("collection lookup failed: {0}")]
    Collection(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlaybackError {
    pub fn status(&self) -> StatusCode {
        match self {
            PlaybackError::NotFound { .. } | PlaybackError::UnknownAlbum(_) => {
                StatusCode::NOT_FOUND
            }
            PlaybackError::NothingPlaying => StatusCode::CONFLICT,
            PlaybackError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PlaybackError::Remote(RemoteError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            PlaybackError::Remote(_) | PlaybackError::Collection(_) => StatusCode::BAD_GATEWAY,
            PlaybackError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PlaybackError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "reason": self.to_string() }));
        (status, body).into_response()
    }
}
