use std::{
    pin::Pin,
    task::{Context, Poll},
};

use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::data::{HistoryEntry, Member, ParticipantId, PlaybackState, TrackId};

pub type EventSender = Sender<TandemEvent>;
pub type EventReceiver = Receiver<TandemEvent>;

/// Events emitted by the subsystem for observers outside of it.
#[derive(Debug, Clone)]
pub enum TandemEvent {
    RoomCreated {
        slug: String,
    },
    MemberJoined {
        slug: String,
        member: Member,
    },
    MemberLeft {
        slug: String,
        participant: ParticipantId,
    },
    /// A room was torn down, explicitly or by the reaper. Its history
    /// remains available for export until purged.
    RoomClosed {
        slug: String,
    },
    /// A distinct track started playing in a room
    TrackStarted {
        slug: String,
        entry: HistoryEntry,
    },
}

/// The internal event bus, handed to every component via the context.
#[derive(Debug, Clone)]
pub struct Events {
    sender: EventSender,
    receiver: EventReceiver,
}

impl Events {
    pub fn emit(&self, event: TandemEvent) {
        // The bus holds its own receiver, so the channel cannot close
        self.sender.send(event).expect("event channel is open");
    }

    pub fn receiver(&self) -> EventReceiver {
        self.receiver.clone()
    }
}

impl Default for Events {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

/// Messages sent to every session joined to a room.
///
/// This is the outbound half of the wire contract, rendered to the user
/// by the layer above.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomState {
        slug: String,
        state: PlaybackState,
    },
    RoomJoined {
        slug: String,
        member: Member,
    },
    RoomLeft {
        slug: String,
        participant: ParticipantId,
    },
    RoomClosed {
        slug: String,
    },
    AuthError {
        message: String,
    },
}

/// Messages a client may send, the inbound half of the wire contract.
///
/// Playback commands carry the logical time they were issued at, so the
/// coordinator can order them by time instead of by arrival.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    CreateRoom {
        name: String,
    },
    JoinRoom {
        slug: String,
    },
    LeaveRoom {
        slug: String,
    },
    CloseRoom {
        slug: String,
    },
    Play {
        track: TrackId,
        position_ms: u64,
        #[serde(default = "Utc::now")]
        issued_at: DateTime<Utc>,
    },
    Pause {
        #[serde(default = "Utc::now")]
        issued_at: DateTime<Utc>,
    },
    Seek {
        position_ms: u64,
        #[serde(default = "Utc::now")]
        issued_at: DateTime<Utc>,
    },
    Skip {
        track: TrackId,
        #[serde(default = "Utc::now")]
        issued_at: DateTime<Utc>,
    },
}

/// The sending end of a session's event feed, subscribed to a room.
pub type EventSink = mpsc::UnboundedSender<ServerEvent>;

/// The receiving end of a session's event feed.
pub struct EventFeed {
    receiver: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Creates the channel a session receives room events through.
pub fn event_channel() -> (EventSink, EventFeed) {
    let (sender, receiver) = mpsc::unbounded_channel();

    (sender, EventFeed { receiver })
}

impl EventFeed {
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.receiver.recv().await
    }

    /// Drains everything that is immediately available.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }

        events
    }
}

impl Stream for EventFeed {
    type Item = ServerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_commands_deserialize() {
        let command: ClientCommand =
            serde_json::from_str(r#"{ "type": "create_room", "name": "Chill Vibes" }"#)
                .expect("deserializes");

        assert!(matches!(command, ClientCommand::CreateRoom { name } if name == "Chill Vibes"));

        // issued_at falls back to the time of arrival
        let command: ClientCommand =
            serde_json::from_str(r#"{ "type": "play", "track": "track:1", "position_ms": 0 }"#)
                .expect("deserializes");

        assert!(matches!(command, ClientCommand::Play { .. }));
    }

    #[test]
    fn server_events_are_tagged() {
        let event = ServerEvent::RoomClosed {
            slug: "chill-vibes".to_string(),
        };

        let json = serde_json::to_string(&event).expect("serializes");
        assert_eq!(json, r#"{"type":"room_closed","slug":"chill-vibes"}"#);
    }
}
