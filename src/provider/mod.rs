mod spotify;

use async_trait::async_trait;
use thiserror::Error;

use crate::data::{TrackId, TrackMetadata};

pub use spotify::*;

/// A reference to a playlist created at the music provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRef {
    pub id: String,
    pub url: Option<String>,
}

/// The outcome of adding tracks to an external playlist. The provider may
/// accept some tracks and reject others without failing the request.
#[derive(Debug, Clone, Default)]
pub struct PlaylistAddition {
    pub added: Vec<TrackId>,
    pub rejected: Vec<TrackId>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Resource was not found")]
    NotFound,
    #[error("Provider rejected the request with status {0}")]
    Status(u16),
    #[error("Provider request failed: {0}")]
    Request(String),
}

/// The external music provider the subsystem collaborates with.
///
/// Everything the subsystem needs from it goes through this seam, so
/// rooms, sessions, and exports are testable without a network.
#[async_trait]
pub trait MusicProvider: Send + Sync + 'static {
    /// Looks up the display metadata for a track.
    async fn track_metadata(&self, track: &TrackId) -> Result<TrackMetadata, ProviderError>;

    /// Moves the caller's active playback to the given device. Best-effort
    /// from the session's point of view.
    async fn transfer_playback(&self, device_id: &str) -> Result<(), ProviderError>;

    /// Creates an empty playlist and returns a reference to it.
    async fn create_playlist(
        &self,
        name: &str,
        description: &str,
    ) -> Result<PlaylistRef, ProviderError>;

    /// Adds tracks to a playlist, reporting which were accepted.
    async fn add_to_playlist(
        &self,
        playlist: &PlaylistRef,
        tracks: &[TrackId],
    ) -> Result<PlaylistAddition, ProviderError>;
}

impl From<reqwest::Error> for ProviderError {
    fn from(value: reqwest::Error) -> Self {
        if value.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            return Self::NotFound;
        }

        Self::Request(value.to_string())
    }
}
