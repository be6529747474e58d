use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::{
    data::TrackId,
    history::HistoryRecorder,
    provider::{MusicProvider, PlaylistRef},
    rooms::RoomError,
};

/// The terminal record of one export request. Failed jobs are not
/// retried automatically.
#[derive(Debug)]
pub struct ExportJob {
    pub slug: String,
    pub name: String,
    pub description: String,
    /// The created playlist, present unless the job failed
    pub playlist: Option<PlaylistRef>,
    pub exported: Vec<TrackId>,
    /// Tracks the provider rejected; their presence alone does not fail
    /// the job
    pub skipped: Vec<TrackId>,
    pub failure: Option<String>,
}

impl ExportJob {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Converts a room's play history into a playlist at the music provider.
pub struct PlaylistExporter<P> {
    provider: Arc<P>,
    history: Arc<HistoryRecorder>,
}

impl<P> PlaylistExporter<P>
where
    P: MusicProvider,
{
    pub fn new(provider: &Arc<P>, history: &Arc<HistoryRecorder>) -> Self {
        Self {
            provider: provider.clone(),
            history: history.clone(),
        }
    }

    /// Exports a room's history, in play order, to a new playlist.
    ///
    /// Name and description default to ones derived from the slug and
    /// the current date. Partial rejection by the provider still counts
    /// as success, with the rejected tracks reported on the job.
    pub async fn export(
        &self,
        slug: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<ExportJob, RoomError> {
        let entries = self.history.list(slug);

        if entries.is_empty() {
            return Err(RoomError::EmptyHistory);
        }

        let date = Utc::now().format("%Y-%m-%d");
        let name = name.unwrap_or_else(|| format!("{} {}", slug, date));
        let description =
            description.unwrap_or_else(|| format!("Tracks played in {} on {}", slug, date));

        let tracks: Vec<TrackId> = entries.into_iter().map(|e| e.track).collect();

        let mut job = ExportJob {
            slug: slug.to_string(),
            name,
            description,
            playlist: None,
            exported: Vec::new(),
            skipped: Vec::new(),
            failure: None,
        };

        let playlist = match self
            .provider
            .create_playlist(&job.name, &job.description)
            .await
        {
            Ok(playlist) => playlist,
            Err(error) => {
                warn!("Export of room {} failed: {}", slug, error);
                job.failure = Some(error.to_string());
                return Ok(job);
            }
        };

        match self.provider.add_to_playlist(&playlist, &tracks).await {
            Ok(addition) => {
                job.exported = addition.added;
                job.skipped = addition.rejected;
            }
            Err(error) => {
                warn!("Export of room {} failed: {}", slug, error);
                job.failure = Some(error.to_string());
                return Ok(job);
            }
        }

        // A playlist that took none of the tracks is a failure in all
        // but name
        if job.exported.is_empty() {
            job.failure = Some("every track was rejected".to_string());
            return Ok(job);
        }

        job.playlist = Some(playlist);

        info!(
            "Exported {} tracks from room {} ({} skipped)",
            job.exported.len(),
            slug,
            job.skipped.len()
        );

        Ok(job)
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use parking_lot::Mutex;

    use crate::{
        data::{HistoryEntry, TrackMetadata},
        provider::{PlaylistAddition, ProviderError},
    };

    use super::*;

    /// Accepts everything except the tracks it is told to reject.
    struct PickyProvider {
        rejects: Vec<TrackId>,
        fail_creation: bool,
        created: Mutex<Vec<String>>,
    }

    impl PickyProvider {
        fn new(rejects: Vec<TrackId>, fail_creation: bool) -> Arc<Self> {
            Arc::new(Self {
                rejects,
                fail_creation,
                created: Default::default(),
            })
        }
    }

    #[async_trait]
    impl MusicProvider for PickyProvider {
        async fn track_metadata(&self, _track: &TrackId) -> Result<TrackMetadata, ProviderError> {
            unimplemented!("not used by export tests")
        }

        async fn transfer_playback(&self, _device_id: &str) -> Result<(), ProviderError> {
            unimplemented!("not used by export tests")
        }

        async fn create_playlist(
            &self,
            name: &str,
            _description: &str,
        ) -> Result<PlaylistRef, ProviderError> {
            if self.fail_creation {
                return Err(ProviderError::Status(500));
            }

            self.created.lock().push(name.to_string());

            Ok(PlaylistRef {
                id: "playlist-1".to_string(),
                url: None,
            })
        }

        async fn add_to_playlist(
            &self,
            _playlist: &PlaylistRef,
            tracks: &[TrackId],
        ) -> Result<PlaylistAddition, ProviderError> {
            let (rejected, added) = tracks
                .iter()
                .cloned()
                .partition(|t| self.rejects.contains(t));

            Ok(PlaylistAddition { added, rejected })
        }
    }

    fn recorded_history() -> Arc<HistoryRecorder> {
        let history = Arc::new(HistoryRecorder::default());
        let base = Utc::now();

        for (index, track) in ["track:1", "track:2", "track:3"].iter().enumerate() {
            history.record(
                "chill-vibes",
                HistoryEntry {
                    track: (*track).into(),
                    metadata: TrackMetadata::mock(track),
                    played_by: "host".into(),
                    started_at: base + Duration::seconds(index as i64),
                },
            );
        }

        history
    }

    #[tokio::test]
    async fn partial_rejection_still_succeeds() {
        let provider = PickyProvider::new(vec!["track:2".into()], false);
        let exporter = PlaylistExporter::new(&provider, &recorded_history());

        let job = exporter
            .export("chill-vibes", None, None)
            .await
            .expect("exports");

        assert!(job.succeeded());
        assert!(job.playlist.is_some());
        assert_eq!(job.exported, vec!["track:1".into(), "track:3".into()]);
        assert_eq!(job.skipped, vec![TrackId::from("track:2")]);
    }

    #[tokio::test]
    async fn empty_history_refuses_to_export() {
        let provider = PickyProvider::new(vec![], false);
        let exporter = PlaylistExporter::new(&provider, &Arc::new(HistoryRecorder::default()));

        let result = exporter.export("chill-vibes", None, None).await;
        assert!(matches!(result, Err(RoomError::EmptyHistory)));
    }

    #[tokio::test]
    async fn provider_failure_fails_the_job() {
        let provider = PickyProvider::new(vec![], true);
        let exporter = PlaylistExporter::new(&provider, &recorded_history());

        let job = exporter
            .export("chill-vibes", None, None)
            .await
            .expect("produces a job");

        assert!(!job.succeeded());
        assert!(job.playlist.is_none());
    }

    #[tokio::test]
    async fn total_rejection_fails_the_job() {
        let provider = PickyProvider::new(
            vec!["track:1".into(), "track:2".into(), "track:3".into()],
            false,
        );
        let exporter = PlaylistExporter::new(&provider, &recorded_history());

        let job = exporter
            .export("chill-vibes", None, None)
            .await
            .expect("produces a job");

        assert!(!job.succeeded());
        assert_eq!(job.skipped.len(), 3);
    }

    #[tokio::test]
    async fn names_default_to_slug_and_date() {
        let provider = PickyProvider::new(vec![], false);
        let exporter = PlaylistExporter::new(&provider, &recorded_history());

        let job = exporter
            .export("chill-vibes", Some("Custom Name".to_string()), None)
            .await
            .expect("exports");

        assert_eq!(job.name, "Custom Name");
        assert_eq!(provider.created.lock().as_slice(), ["Custom Name"]);

        let job = exporter
            .export("chill-vibes", None, None)
            .await
            .expect("exports");

        assert!(job.name.starts_with("chill-vibes"));
    }
}
