mod auth;
mod config;
mod data;
mod events;
mod export;
mod history;
mod logging;
mod provider;
mod rooms;
mod session;
mod util;

use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

pub use auth::*;
pub use config::*;
pub use data::*;
pub use events::*;
pub use export::*;
pub use history::*;
pub use logging::init_logger;
pub use provider::*;
pub use rooms::*;
pub use session::*;
pub use util::slugify;

/// The tandem listening-room subsystem: room lifecycle and membership,
/// host-authoritative playback sync, durable play history, and playlist
/// export.
pub struct Tandem<P> {
    context: TandemContext,
    provider: Arc<P>,

    pub rooms: Arc<RoomManager>,
    pub exporter: PlaylistExporter<P>,
}

/// A type passed to the components of the subsystem, to access shared
/// state and emit events.
#[derive(Clone)]
pub struct TandemContext {
    pub config: Config,
    pub events: Events,
    pub history: Arc<HistoryRecorder>,
    pub rooms: Arc<DashMap<String, Arc<Room>>>,
}

impl<P> Tandem<P>
where
    P: MusicProvider,
{
    pub fn new(provider: P, config: Config) -> Self {
        let provider = Arc::new(provider);
        let history = Arc::new(HistoryRecorder::default());

        let context = TandemContext {
            config,
            history: history.clone(),
            events: Events::default(),
            rooms: Default::default(),
        };

        let rooms = RoomManager::new(&context);
        rooms.spawn_reaper();

        let exporter = PlaylistExporter::new(&provider, &history);

        Self {
            context,
            provider,
            rooms,
            exporter,
        }
    }

    /// The subsystem's event feed, for observers outside of it.
    pub fn events(&self) -> EventReceiver {
        self.context.events.receiver()
    }

    pub fn history(&self) -> &Arc<HistoryRecorder> {
        &self.context.history
    }

    /// Routes one inbound client command to the room layer.
    ///
    /// `sink` is where the participant's session receives room events;
    /// it is subscribed on join. Stale playback commands are dropped
    /// here silently, since they reflect normal reordering under
    /// latency rather than a caller error.
    pub async fn dispatch(
        &self,
        participant: &ParticipantId,
        sink: &EventSink,
        command: ClientCommand,
    ) -> Result<(), RoomError> {
        match command {
            ClientCommand::CreateRoom { name } => {
                self.rooms.create_room(&name, participant)?;
                Ok(())
            }
            ClientCommand::JoinRoom { slug } => {
                self.rooms.join_room(&slug, participant, sink.clone())?;
                Ok(())
            }
            ClientCommand::LeaveRoom { slug } => self.rooms.leave_room(&slug, participant),
            ClientCommand::CloseRoom { slug } => self.rooms.close_room(&slug, participant),
            ClientCommand::Play {
                track,
                position_ms,
                issued_at,
            } => {
                // Resolved before the command enters the coordinator, so
                // the lookup never stalls the room's broadcasts
                let metadata = self.resolve_metadata(&track).await?;

                self.submit(
                    participant,
                    CommandEnvelope {
                        issuer: participant.clone(),
                        issued_at,
                        command: HostCommand::Play {
                            track,
                            metadata,
                            position_ms,
                        },
                    },
                )
                .await
            }
            ClientCommand::Pause { issued_at } => {
                self.submit(
                    participant,
                    CommandEnvelope {
                        issuer: participant.clone(),
                        issued_at,
                        command: HostCommand::Pause,
                    },
                )
                .await
            }
            ClientCommand::Seek {
                position_ms,
                issued_at,
            } => {
                self.submit(
                    participant,
                    CommandEnvelope {
                        issuer: participant.clone(),
                        issued_at,
                        command: HostCommand::Seek { position_ms },
                    },
                )
                .await
            }
            ClientCommand::Skip { track, issued_at } => {
                let metadata = self.resolve_metadata(&track).await?;

                self.submit(
                    participant,
                    CommandEnvelope {
                        issuer: participant.clone(),
                        issued_at,
                        command: HostCommand::Skip { track, metadata },
                    },
                )
                .await
            }
        }
    }

    async fn resolve_metadata(&self, track: &TrackId) -> Result<TrackMetadata, RoomError> {
        // A track the provider cannot resolve does not exist as far as
        // the room is concerned
        self.provider
            .track_metadata(track)
            .await
            .map_err(|_| RoomError::NotFound)
    }

    async fn submit(
        &self,
        participant: &ParticipantId,
        envelope: CommandEnvelope,
    ) -> Result<(), RoomError> {
        let room = self.rooms.room_of(participant)?;

        match room.submit(envelope).await {
            Ok(_) => Ok(()),
            Err(RoomError::StaleCommand) => {
                debug!("Dropped stale command from {}", participant);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
impl TandemContext {
    pub fn mock() -> Self {
        Self::mock_with(Config::default())
    }

    pub fn mock_with(config: Config) -> Self {
        Self {
            config,
            events: Events::default(),
            history: Arc::new(HistoryRecorder::default()),
            rooms: Default::default(),
        }
    }
}
