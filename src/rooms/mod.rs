mod room;
mod sync;

use std::sync::Arc;

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use log::info;
use thiserror::Error;

use crate::{
    data::ParticipantId,
    events::{EventSink, TandemEvent},
    util::slugify,
    TandemContext,
};

pub use room::*;
pub use sync::*;

/// The result union for room operations. The layer above maps each
/// variant to a user-facing message; no text is rendered here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("No active room has this slug")]
    NotFound,
    #[error("An active room with this slug already exists")]
    Conflict,
    #[error("Only the host can do this")]
    Forbidden,
    #[error("Command is older than the current playback state")]
    StaleCommand,
    #[error("Room has no recorded history")]
    EmptyHistory,
    #[error("Room name does not produce a usable slug")]
    InvalidName,
    #[error("Participant is not a member of this room")]
    NotInRoom,
}

/// The in-memory directory of active rooms.
///
/// The registry is the only owner of slug existence: creates race
/// through an atomic map entry, and membership bookkeeping enforces
/// that a participant is in at most one room at a time.
pub struct RoomManager {
    context: TandemContext,
    memberships: DashMap<ParticipantId, String>,
    subscriptions: DashMap<ParticipantId, Subscription>,
}

impl RoomManager {
    pub fn new(context: &TandemContext) -> Arc<Self> {
        Arc::new(Self {
            context: context.clone(),
            memberships: Default::default(),
            subscriptions: Default::default(),
        })
    }

    /// Creates a new room named by the requester, who becomes its host.
    pub fn create_room(
        &self,
        raw_name: &str,
        requester: &ParticipantId,
    ) -> Result<Arc<Room>, RoomError> {
        let slug = slugify(raw_name);

        if slug.is_empty() {
            return Err(RoomError::InvalidName);
        }

        let room = match self.context.rooms.entry(slug.clone()) {
            Entry::Occupied(_) => return Err(RoomError::Conflict),
            Entry::Vacant(vacant) => {
                let room = Arc::new(Room::new(&slug, requester.clone(), &self.context));
                vacant.insert(room.clone());

                room
            }
        };

        // Creating a room implies leaving whichever one came before
        self.leave_current(requester, &slug);
        self.memberships.insert(requester.clone(), slug.clone());

        info!("Room {} created by {}", slug, requester);
        self.context.events.emit(TandemEvent::RoomCreated { slug });

        Ok(room)
    }

    /// Adds the requester to a room and subscribes their sink to its
    /// broadcasts. The sink immediately receives the current playback
    /// state as a baseline.
    pub fn join_room(
        &self,
        slug: &str,
        requester: &ParticipantId,
        sink: EventSink,
    ) -> Result<Arc<Room>, RoomError> {
        let room = self.room_by_slug(slug)?;

        self.leave_current(requester, slug);

        room.add_member(requester);
        let subscription = room.subscribe(sink);

        self.memberships.insert(requester.clone(), slug.to_string());
        self.subscriptions.insert(requester.clone(), subscription);

        Ok(room)
    }

    /// Removes the requester's membership and subscription.
    pub fn leave_room(&self, slug: &str, requester: &ParticipantId) -> Result<(), RoomError> {
        let room = self.room_by_slug(slug)?;

        room.remove_member(requester)?;

        self.memberships
            .remove_if(requester, |_, current| current == slug);
        self.subscriptions.remove(requester);

        Ok(())
    }

    /// Explicit teardown by the room's host.
    pub fn close_room(&self, slug: &str, requester: &ParticipantId) -> Result<(), RoomError> {
        let room = self.room_by_slug(slug)?;

        if room.host() != Some(requester.clone()) {
            return Err(RoomError::Forbidden);
        }

        self.context.rooms.remove(slug);

        // Close before dropping subscriptions, so the teardown broadcast
        // reaches every member's sink ahead of their unsubscribe
        room.close();

        for member in room.members() {
            self.memberships.remove(&member.participant);
            self.subscriptions.remove(&member.participant);
        }

        info!("Room {} closed by its host", slug);
        self.context.events.emit(TandemEvent::RoomClosed {
            slug: slug.to_string(),
        });

        Ok(())
    }

    /// Drops whatever membership a disconnecting participant still has.
    pub fn disconnect(&self, participant: &ParticipantId) {
        if let Some((_, slug)) = self.memberships.remove(participant) {
            if let Some(room) = self.context.rooms.get(&slug) {
                room.remove_member(participant).ok();
            }
        }

        self.subscriptions.remove(participant);
    }

    pub fn room_by_slug(&self, slug: &str) -> Result<Arc<Room>, RoomError> {
        self.context
            .rooms
            .get(slug)
            .map(|r| r.clone())
            .ok_or(RoomError::NotFound)
    }

    /// The room a participant is currently a member of, if any.
    pub fn room_of(&self, participant: &ParticipantId) -> Result<Arc<Room>, RoomError> {
        let slug = self
            .memberships
            .get(participant)
            .map(|s| s.clone())
            .ok_or(RoomError::NotFound)?;

        self.room_by_slug(&slug)
    }

    pub fn list_all(&self) -> Vec<Arc<Room>> {
        self.context.rooms.iter().map(|r| r.clone()).collect()
    }

    /// Removes rooms that sat empty past the idle timeout. History is
    /// retained for export until purged.
    pub fn reap(&self) {
        let now = Utc::now();
        let timeout = self.context.config.room_idle_timeout;

        let reapable: Vec<_> = self
            .context
            .rooms
            .iter()
            .filter(|r| r.is_reapable(now, timeout))
            .map(|r| r.slug().to_string())
            .collect();

        for slug in reapable {
            if let Some((_, room)) = self.context.rooms.remove(&slug) {
                room.close();

                info!("Reaped idle room {}", slug);
                self.context.events.emit(TandemEvent::RoomClosed { slug });
            }
        }
    }

    /// Runs [RoomManager::reap] on a fixed interval until the manager is
    /// dropped.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let interval = self.context.config.reap_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately, skip it
            ticker.tick().await;

            while let Some(manager) = manager.upgrade() {
                ticker.tick().await;
                manager.reap();
            }
        });
    }

    /// Leaves the requester's current room, unless it is the one they
    /// are moving into.
    fn leave_current(&self, requester: &ParticipantId, next_slug: &str) {
        let previous = self
            .memberships
            .get(requester)
            .map(|s| s.clone())
            .filter(|s| s != next_slug);

        if let Some(previous) = previous {
            self.leave_room(&previous, requester).ok();
        }
    }
}

impl RoomError {
    /// The wire code the layer above maps to a user-facing message.
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::StaleCommand => "stale",
            Self::EmptyHistory => "empty_history",
            Self::InvalidName => "invalid_name",
            Self::NotInRoom => "not_in_room",
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::Utc;

    use crate::{
        data::TrackMetadata,
        events::event_channel,
        Config,
    };

    use super::*;

    fn manager() -> Arc<RoomManager> {
        RoomManager::new(&TandemContext::mock())
    }

    fn play_envelope(issuer: &str, track: &str) -> CommandEnvelope {
        CommandEnvelope {
            issuer: issuer.into(),
            issued_at: Utc::now(),
            command: HostCommand::Play {
                track: track.into(),
                metadata: TrackMetadata::mock(track),
                position_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn creates_normalize_names_and_conflict() {
        let manager = manager();

        let room = manager
            .create_room("Chill Vibes!", &"host".into())
            .expect("creates");

        assert_eq!(room.slug(), "chill-vibes");

        let conflict = manager.create_room("chill vibes", &"other".into());
        assert!(matches!(conflict, Err(RoomError::Conflict)));

        let invalid = manager.create_room("???", &"other".into());
        assert!(matches!(invalid, Err(RoomError::InvalidName)));
    }

    #[tokio::test]
    async fn concurrent_creates_yield_one_room() {
        let manager = manager();

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_room("chill-vibes", &"one".into()).map(|_| ()) })
        };
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_room("chill-vibes", &"two".into()).map(|_| ()) })
        };

        let results = [
            first.await.expect("task completes"),
            second.await.expect("task completes"),
        ];

        let created = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(RoomError::Conflict)))
            .count();

        assert_eq!(created, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn joining_an_unknown_room_fails() {
        let manager = manager();
        let (sink, _feed) = event_channel();

        let result = manager.join_room("nowhere", &"listener".into(), sink);
        assert!(matches!(result, Err(RoomError::NotFound)));
    }

    #[tokio::test]
    async fn departing_host_leaves_the_room_hostless() {
        let manager = manager();
        let host: ParticipantId = "host".into();
        let listener: ParticipantId = "listener".into();

        let room = manager.create_room("chill-vibes", &host).expect("creates");

        let (sink, _feed) = event_channel();
        manager
            .join_room("chill-vibes", &listener, sink)
            .expect("joins");

        manager.leave_room("chill-vibes", &host).expect("leaves");
        assert_eq!(room.host(), None);

        // Nobody can command a hostless room, not even the one who left
        let result = room.submit(play_envelope("host", "track:1")).await;
        assert!(matches!(result, Err(RoomError::Forbidden)));

        // The original host reclaims the role by rejoining
        let (sink, _feed) = event_channel();
        manager
            .join_room("chill-vibes", &host, sink)
            .expect("rejoins");

        assert_eq!(room.host(), Some(host));
        room.submit(play_envelope("host", "track:1"))
            .await
            .expect("applies");
    }

    #[tokio::test]
    async fn participants_are_in_at_most_one_room() {
        let manager = manager();

        manager
            .create_room("room-a", &"host-a".into())
            .expect("creates");
        manager
            .create_room("room-b", &"host-b".into())
            .expect("creates");

        let listener: ParticipantId = "listener".into();

        let (sink, _feed) = event_channel();
        let room_a = manager.join_room("room-a", &listener, sink).expect("joins");

        let (sink, _feed) = event_channel();
        let room_b = manager.join_room("room-b", &listener, sink).expect("joins");

        assert!(!room_a.is_member(&listener));
        assert!(room_b.is_member(&listener));
    }

    #[tokio::test]
    async fn closing_is_host_only() {
        let manager = manager();
        let host: ParticipantId = "host".into();
        let listener: ParticipantId = "listener".into();

        manager.create_room("chill-vibes", &host).expect("creates");

        let (sink, mut feed) = event_channel();
        manager
            .join_room("chill-vibes", &listener, sink)
            .expect("joins");

        let denied = manager.close_room("chill-vibes", &listener);
        assert!(matches!(denied, Err(RoomError::Forbidden)));

        manager.close_room("chill-vibes", &host).expect("closes");
        assert!(matches!(
            manager.room_by_slug("chill-vibes"),
            Err(RoomError::NotFound)
        ));

        // The listener was told before teardown
        let event = feed.recv().await.expect("receives teardown");
        assert!(matches!(
            event,
            crate::events::ServerEvent::RoomClosed { .. }
        ));
    }

    #[tokio::test]
    async fn reap_removes_idle_rooms_but_keeps_history() {
        let config = Config {
            room_idle_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let context = TandemContext::mock_with(config);
        let manager = RoomManager::new(&context);

        let host: ParticipantId = "host".into();
        let room = manager.create_room("chill-vibes", &host).expect("creates");

        room.submit(play_envelope("host", "track:1"))
            .await
            .expect("applies");

        manager.leave_room("chill-vibes", &host).expect("leaves");

        // Not idle for long enough yet
        manager.reap();
        assert!(manager.room_by_slug("chill-vibes").is_ok());

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.reap();

        assert!(matches!(
            manager.room_by_slug("chill-vibes"),
            Err(RoomError::NotFound)
        ));

        // History outlives the room
        assert_eq!(context.history.list("chill-vibes").len(), 1);
    }
}
