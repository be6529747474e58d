use async_trait::async_trait;
use log::warn;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::{AuthApi, AuthError, Credential},
    data::{TrackId, TrackMetadata},
};

use super::{MusicProvider, PlaylistAddition, PlaylistRef, ProviderError};

const API_BASE: &str = "https://api.spotify.com/v1";
const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";

/// How many tracks can be added to a playlist per request
const ADD_CHUNK_SIZE: usize = 100;

/// A Spotify-backed [MusicProvider].
pub struct SpotifyProvider {
    client: Client,
    /// The id of the account the provider acts on behalf of
    user_id: String,
    access_token: RwLock<String>,
}

/// The token-renewal half of the Spotify integration.
pub struct SpotifyAuth {
    client: Client,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Track {
    name: String,
    duration_ms: u64,
    artists: Vec<Artist>,
    album: Album,
}

#[derive(Debug, Clone, Deserialize)]
struct Artist {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Album {
    name: String,
    images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize)]
struct Image {
    url: String,
    width: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct Playlist {
    id: String,
    external_urls: Option<ExternalUrls>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Spotify only returns a new refresh token when it rotates
    refresh_token: Option<String>,
}

impl Album {
    /// Picks the largest artwork, if the album has any.
    fn best_art(&self) -> Option<String> {
        let mut images: Vec<_> = self.images.iter().collect();
        images.sort_by_key(|i| i.width.unwrap_or(0));

        images.pop().map(|i| i.url.clone())
    }
}

impl Track {
    fn into_metadata(self) -> TrackMetadata {
        let artist = self
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        TrackMetadata {
            artist,
            name: self.name,
            art_url: self.album.best_art(),
            album: self.album.name,
            duration_ms: self.duration_ms,
        }
    }
}

impl SpotifyProvider {
    pub fn new(user_id: &str, access_token: &str) -> Self {
        Self {
            client: Client::new(),
            user_id: user_id.to_string(),
            access_token: RwLock::new(access_token.to_string()),
        }
    }

    /// Replaces the bearer token used for subsequent calls, after a
    /// renewal elsewhere.
    pub fn set_access_token(&self, access_token: &str) {
        *self.access_token.write() = access_token.to_string();
    }

    fn token(&self) -> String {
        self.access_token.read().clone()
    }

    /// Spotify addresses tracks by uri in playlist operations.
    fn track_uri(track: &TrackId) -> String {
        if track.0.starts_with("spotify:") {
            return track.0.clone();
        }

        format!("spotify:track:{}", track.0)
    }

    /// Strips the uri prefix when the metadata endpoint needs a bare id.
    fn track_id(track: &TrackId) -> &str {
        track.0.rsplit(':').next().unwrap_or(&track.0)
    }
}

#[async_trait]
impl MusicProvider for SpotifyProvider {
    async fn track_metadata(&self, track: &TrackId) -> Result<TrackMetadata, ProviderError> {
        let response = self
            .client
            .get(format!("{}/tracks/{}", API_BASE, Self::track_id(track)))
            .bearer_auth(self.token())
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound),
            status if !status.is_success() => Err(ProviderError::Status(status.as_u16())),
            _ => {
                let track: Track = response.json().await?;
                Ok(track.into_metadata())
            }
        }
    }

    async fn transfer_playback(&self, device_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(format!("{}/me/player", API_BASE))
            .bearer_auth(self.token())
            .json(&json!({ "device_ids": [device_id], "play": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        Ok(())
    }

    async fn create_playlist(
        &self,
        name: &str,
        description: &str,
    ) -> Result<PlaylistRef, ProviderError> {
        let response = self
            .client
            .post(format!("{}/users/{}/playlists", API_BASE, self.user_id))
            .bearer_auth(self.token())
            .json(&json!({
                "name": name,
                "description": description,
                "public": false,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        let playlist: Playlist = response.json().await?;

        Ok(PlaylistRef {
            id: playlist.id,
            url: playlist.external_urls.and_then(|u| u.spotify),
        })
    }

    async fn add_to_playlist(
        &self,
        playlist: &PlaylistRef,
        tracks: &[TrackId],
    ) -> Result<PlaylistAddition, ProviderError> {
        let mut addition = PlaylistAddition::default();

        for chunk in tracks.chunks(ADD_CHUNK_SIZE) {
            let uris: Vec<_> = chunk.iter().map(Self::track_uri).collect();

            let response = self
                .client
                .post(format!("{}/playlists/{}/tracks", API_BASE, playlist.id))
                .bearer_auth(self.token())
                .json(&json!({ "uris": uris }))
                .send()
                .await?;

            let status = response.status();

            if status.is_success() {
                addition.added.extend(chunk.iter().cloned());
                continue;
            }

            // A rejected chunk is retried track by track so one bad id
            // does not sink the rest of the batch
            warn!(
                "Playlist addition chunk rejected with status {}, retrying individually",
                status
            );

            for track in chunk {
                let response = self
                    .client
                    .post(format!("{}/playlists/{}/tracks", API_BASE, playlist.id))
                    .bearer_auth(self.token())
                    .json(&json!({ "uris": [Self::track_uri(track)] }))
                    .send()
                    .await?;

                if response.status().is_success() {
                    addition.added.push(track.clone());
                } else {
                    addition.rejected.push(track.clone());
                }
            }
        }

        Ok(addition)
    }
}

impl SpotifyAuth {
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            client: Client::new(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }
}

#[async_trait]
impl AuthApi for SpotifyAuth {
    async fn renew(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        let response = self
            .client
            .post(format!("{}/api/token", ACCOUNTS_BASE))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Renewal(e.to_string()))?;

        match response.status() {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                Err(AuthError::InvalidRefreshToken)
            }
            status if !status.is_success() => Err(AuthError::Renewal(status.to_string())),
            _ => {
                let token: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| AuthError::Renewal(e.to_string()))?;

                Ok(Credential {
                    access_token: token.access_token,
                    refresh_token: token
                        .refresh_token
                        .unwrap_or_else(|| refresh_token.to_string()),
                })
            }
        }
    }
}
