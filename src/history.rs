use dashmap::DashMap;
use log::debug;

use crate::data::HistoryEntry;

/// The durable play history of every room, past and present.
///
/// History is owned here rather than by the room itself, so it outlives
/// room teardown and stays exportable until explicitly purged.
#[derive(Debug, Default)]
pub struct HistoryRecorder {
    entries: DashMap<String, Vec<HistoryEntry>>,
}

impl HistoryRecorder {
    /// Appends an entry to a room's history, keeping ascending start
    /// order. Idempotent per (room, track, start), so duplicate delivery
    /// from the coordinator is harmless.
    ///
    /// Returns whether the entry was actually appended.
    pub fn record(&self, slug: &str, entry: HistoryEntry) -> bool {
        let mut entries = self.entries.entry(slug.to_string()).or_default();

        let duplicate = entries
            .iter()
            .any(|e| e.track == entry.track && e.started_at == entry.started_at);

        if duplicate {
            debug!("Ignoring duplicate history entry for room {}", slug);
            return false;
        }

        let position = entries.partition_point(|e| e.started_at <= entry.started_at);
        entries.insert(position, entry);

        true
    }

    /// The history of a room, in ascending start order. Defined for both
    /// active and torn-down rooms.
    pub fn list(&self, slug: &str) -> Vec<HistoryEntry> {
        self.entries
            .get(slug)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Drops a room's history for good.
    pub fn purge(&self, slug: &str) {
        self.entries.remove(slug);
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, Utc};

    use crate::data::{HistoryEntry, TrackMetadata};

    use super::*;

    fn entry(track: &str, offset_secs: i64) -> HistoryEntry {
        HistoryEntry {
            track: track.into(),
            metadata: TrackMetadata::mock(track),
            played_by: "host".into(),
            started_at: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn appends_are_idempotent() {
        let recorder = HistoryRecorder::default();
        let first = entry("track:1", 0);

        assert!(recorder.record("chill-vibes", first.clone()));
        assert!(!recorder.record("chill-vibes", first));

        assert_eq!(recorder.list("chill-vibes").len(), 1);
    }

    #[test]
    fn entries_are_ordered_by_start() {
        let recorder = HistoryRecorder::default();

        recorder.record("chill-vibes", entry("track:2", 10));
        recorder.record("chill-vibes", entry("track:1", 0));
        recorder.record("chill-vibes", entry("track:3", 20));

        let tracks: Vec<_> = recorder
            .list("chill-vibes")
            .into_iter()
            .map(|e| e.track.0)
            .collect();

        assert_eq!(tracks, vec!["track:1", "track:2", "track:3"]);
    }

    #[test]
    fn purge_drops_history() {
        let recorder = HistoryRecorder::default();

        recorder.record("chill-vibes", entry("track:1", 0));
        recorder.purge("chill-vibes");

        assert!(recorder.list("chill-vibes").is_empty());
    }
}
