use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The identity of a participant, as issued by the music provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

/// A track identifier understood by the music provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub String);

/// Display metadata for a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub name: String,
    pub artist: String,
    pub album: String,
    pub art_url: Option<String>,
    pub duration_ms: u64,
}

/// The authoritative description of what a room is playing.
///
/// `position_ms` is the position at `updated_at`, not the current position.
/// Clients derive the current position from the pair, which is what keeps
/// listeners in sync without continuous broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub track: TrackId,
    pub metadata: TrackMetadata,
    pub playing: bool,
    pub position_ms: u64,
    pub updated_at: DateTime<Utc>,
}

/// What a participant is allowed to do in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The single participant allowed to mutate playback
    Host,
    Listener,
}

/// A participant's membership in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub participant: ParticipantId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// A single played track in a room's durable history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub track: TrackId,
    pub metadata: TrackMetadata,
    /// The participant whose command started the track
    pub played_by: ParticipantId,
    pub started_at: DateTime<Utc>,
}

impl PlaybackState {
    /// The playback position the state describes at the given moment.
    pub fn position_at(&self, now: DateTime<Utc>) -> u64 {
        if !self.playing {
            return self.position_ms;
        }

        let elapsed = now
            .signed_duration_since(self.updated_at)
            .num_milliseconds()
            .max(0) as u64;

        (self.position_ms + elapsed).min(self.metadata.duration_ms)
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
impl TrackMetadata {
    pub fn mock(name: &str) -> Self {
        Self {
            name: name.to_string(),
            artist: "mock artist".to_string(),
            album: "mock album".to_string(),
            art_url: None,
            duration_ms: 180_000,
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::*;

    #[test]
    fn position_advances_only_while_playing() {
        let now = Utc::now();

        let state = PlaybackState {
            track: "track:1".into(),
            metadata: TrackMetadata::mock("song"),
            playing: true,
            position_ms: 1000,
            updated_at: now,
        };

        assert_eq!(state.position_at(now + Duration::seconds(2)), 3000);

        let paused = PlaybackState {
            playing: false,
            ..state
        };

        assert_eq!(paused.position_at(now + Duration::seconds(2)), 1000);
    }

    #[test]
    fn position_is_clamped_to_duration() {
        let now = Utc::now();

        let state = PlaybackState {
            track: "track:1".into(),
            metadata: TrackMetadata::mock("song"),
            playing: true,
            position_ms: 179_000,
            updated_at: now,
        };

        assert_eq!(state.position_at(now + Duration::seconds(30)), 180_000);
    }
}
