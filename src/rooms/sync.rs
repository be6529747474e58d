use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::{
    data::{HistoryEntry, ParticipantId, PlaybackState, TrackId, TrackMetadata},
    events::{EventSink, ServerEvent, TandemEvent},
    util::ID_COUNTER,
    TandemContext,
};

use super::RoomError;

pub type SubscriberId = u64;
pub type SyncSender = mpsc::UnboundedSender<SyncMessage>;

/// A playback mutation only the room's host may issue.
#[derive(Debug, Clone)]
pub enum HostCommand {
    Play {
        track: TrackId,
        metadata: TrackMetadata,
        position_ms: u64,
    },
    Pause,
    Seek {
        position_ms: u64,
    },
    Skip {
        track: TrackId,
        metadata: TrackMetadata,
    },
}

/// A host command together with who issued it and when, logically.
///
/// `issued_at` orders commands by time rather than by arrival, which is
/// what makes concurrent races under latency well-defined.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub issuer: ParticipantId,
    pub issued_at: DateTime<Utc>,
    pub command: HostCommand,
}

/// Everything the coordinator task can be asked to do. All state
/// mutations and fan-out changes arrive here, in one totally ordered
/// sequence per room.
pub enum SyncMessage {
    Command {
        envelope: CommandEnvelope,
        reply: oneshot::Sender<Result<PlaybackState, RoomError>>,
    },
    Subscribe {
        id: SubscriberId,
        sink: EventSink,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    SetHost {
        host: Option<ParticipantId>,
    },
    /// A non-playback event to fan out in order with state broadcasts
    Broadcast {
        event: ServerEvent,
    },
    Close,
}

/// The handle to a room's coordinator task, the sole writer of that
/// room's [PlaybackState].
pub struct SyncCoordinator {
    slug: String,
    sender: SyncSender,
}

/// Keeps a session subscribed to a room's broadcasts for as long as it
/// is held. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    sender: SyncSender,
}

struct SyncTask {
    context: TandemContext,
    slug: String,
    state: Option<PlaybackState>,
    host: Option<ParticipantId>,
    subscribers: Vec<(SubscriberId, EventSink)>,
}

impl SyncCoordinator {
    pub fn spawn(slug: &str, host: ParticipantId, context: &TandemContext) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let task = SyncTask {
            context: context.clone(),
            slug: slug.to_string(),
            state: None,
            host: Some(host),
            subscribers: Vec::new(),
        };

        tokio::spawn(task.run(receiver));

        Self {
            slug: slug.to_string(),
            sender,
        }
    }

    /// Submits a host command and waits for it to be applied, returning
    /// the resulting state.
    pub async fn submit(&self, envelope: CommandEnvelope) -> Result<PlaybackState, RoomError> {
        let (reply, response) = oneshot::channel();

        self.sender
            .send(SyncMessage::Command { envelope, reply })
            .map_err(|_| RoomError::NotFound)?;

        response.await.map_err(|_| RoomError::NotFound)?
    }

    /// Adds a session to the broadcast fan-out. The sink immediately
    /// receives the current state as a synchronization baseline.
    pub fn subscribe(&self, sink: EventSink) -> Subscription {
        let id = ID_COUNTER.fetch_add(1);

        // A send only fails after close, at which point the subscription
        // is moot anyway
        self.sender.send(SyncMessage::Subscribe { id, sink }).ok();

        Subscription {
            id,
            sender: self.sender.clone(),
        }
    }

    pub fn set_host(&self, host: Option<ParticipantId>) {
        self.sender.send(SyncMessage::SetHost { host }).ok();
    }

    /// Fans an event out to every subscriber, ordered with state
    /// broadcasts.
    pub fn broadcast(&self, event: ServerEvent) {
        self.sender.send(SyncMessage::Broadcast { event }).ok();
    }

    /// Shuts the coordinator task down after the messages already queued.
    pub fn close(&self) {
        self.sender.send(SyncMessage::Close).ok();
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.sender
            .send(SyncMessage::Unsubscribe { id: self.id })
            .ok();
    }
}

impl SyncTask {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<SyncMessage>) {
        while let Some(message) = receiver.recv().await {
            match message {
                SyncMessage::Command { envelope, reply } => {
                    let result = self.apply(envelope);
                    reply.send(result).ok();
                }
                SyncMessage::Subscribe { id, sink } => {
                    if let Some(state) = &self.state {
                        sink.send(ServerEvent::RoomState {
                            slug: self.slug.clone(),
                            state: state.clone(),
                        })
                        .ok();
                    }

                    self.subscribers.push((id, sink));
                }
                SyncMessage::Unsubscribe { id } => {
                    self.subscribers.retain(|(s, _)| *s != id);
                }
                SyncMessage::SetHost { host } => {
                    self.host = host;
                }
                SyncMessage::Broadcast { event } => {
                    self.fan_out(event);
                }
                SyncMessage::Close => break,
            }
        }
    }

    /// Applies a host command, stamping and broadcasting the new state.
    fn apply(&mut self, envelope: CommandEnvelope) -> Result<PlaybackState, RoomError> {
        let host = self.host.as_ref().ok_or(RoomError::Forbidden)?;

        if *host != envelope.issuer {
            return Err(RoomError::Forbidden);
        }

        if let Some(state) = &self.state {
            // Last writer by time, not by arrival
            if envelope.issued_at < state.updated_at {
                debug!(
                    "Dropping stale command for room {}: issued at {}, state at {}",
                    self.slug, envelope.issued_at, state.updated_at
                );
                return Err(RoomError::StaleCommand);
            }
        }

        // The authoritative timestamp never goes backwards
        let now = Utc::now();
        let now = self
            .state
            .as_ref()
            .map(|s| s.updated_at.max(now))
            .unwrap_or(now);

        let new_state = match envelope.command {
            HostCommand::Play {
                track,
                metadata,
                position_ms,
            } => {
                let started = self.state.as_ref().map(|s| s.track != track).unwrap_or(true);

                let state = PlaybackState {
                    track,
                    metadata,
                    playing: true,
                    position_ms,
                    updated_at: now,
                };

                if started {
                    self.record_start(&state, &envelope.issuer);
                }

                state
            }
            HostCommand::Skip { track, metadata } => {
                let state = PlaybackState {
                    track,
                    metadata,
                    playing: true,
                    position_ms: 0,
                    updated_at: now,
                };

                self.record_start(&state, &envelope.issuer);
                state
            }
            HostCommand::Pause => {
                let state = self.state.as_ref().ok_or(RoomError::StaleCommand)?;

                PlaybackState {
                    playing: false,
                    position_ms: state.position_at(now),
                    updated_at: now,
                    ..state.clone()
                }
            }
            HostCommand::Seek { position_ms } => {
                let state = self.state.as_ref().ok_or(RoomError::StaleCommand)?;

                PlaybackState {
                    position_ms,
                    updated_at: now,
                    ..state.clone()
                }
            }
        };

        self.state = Some(new_state.clone());
        self.fan_out(ServerEvent::RoomState {
            slug: self.slug.clone(),
            state: new_state.clone(),
        });

        Ok(new_state)
    }

    /// Records a distinct (track, start) pair exactly once.
    fn record_start(&self, state: &PlaybackState, issuer: &ParticipantId) {
        let entry = HistoryEntry {
            track: state.track.clone(),
            metadata: state.metadata.clone(),
            played_by: issuer.clone(),
            started_at: state.updated_at,
        };

        if self.context.history.record(&self.slug, entry.clone()) {
            self.context.events.emit(TandemEvent::TrackStarted {
                slug: self.slug.clone(),
                entry,
            });
        }
    }

    fn fan_out(&mut self, event: ServerEvent) {
        // Sinks whose session is gone fall out of the list here
        self.subscribers
            .retain(|(_, sink)| sink.send(event.clone()).is_ok());
    }
}
