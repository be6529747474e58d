use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;

use crate::{
    data::{Member, ParticipantId, PlaybackState, Role},
    events::{EventSink, ServerEvent, TandemEvent},
    TandemContext,
};

use super::{CommandEnvelope, RoomError, Subscription, SyncCoordinator};

/// An ephemeral named session grouping participants around one shared
/// playback state.
pub struct Room {
    context: TandemContext,
    slug: String,
    created_at: DateTime<Utc>,
    coordinator: SyncCoordinator,
    inner: Mutex<RoomInner>,
}

struct RoomInner {
    members: Vec<Member>,
    /// The identity that created the room, the only one that can
    /// reclaim the host role after going hostless
    original_host: ParticipantId,
    last_activity: DateTime<Utc>,
}

impl Room {
    pub fn new(slug: &str, host: ParticipantId, context: &TandemContext) -> Self {
        let now = Utc::now();

        let host_member = Member {
            participant: host.clone(),
            role: Role::Host,
            joined_at: now,
        };

        Self {
            context: context.clone(),
            slug: slug.to_string(),
            created_at: now,
            coordinator: SyncCoordinator::spawn(slug, host.clone(), context),
            inner: Mutex::new(RoomInner {
                members: vec![host_member],
                original_host: host,
                last_activity: now,
            }),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn members(&self) -> Vec<Member> {
        self.inner.lock().members.clone()
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_member(&self, participant: &ParticipantId) -> bool {
        self.inner
            .lock()
            .members
            .iter()
            .any(|m| m.participant == *participant)
    }

    /// The current host identity, if the room is not hostless.
    pub fn host(&self) -> Option<ParticipantId> {
        self.inner
            .lock()
            .members
            .iter()
            .find(|m| m.role == Role::Host)
            .map(|m| m.participant.clone())
    }

    /// Adds a participant as a member, a no-op if they already are one.
    ///
    /// The original host rejoining a hostless room takes the host role
    /// back; everyone else joins as a listener.
    pub fn add_member(&self, participant: &ParticipantId) -> Member {
        let member = {
            let mut inner = self.inner.lock();
            inner.last_activity = Utc::now();

            if let Some(existing) = inner
                .members
                .iter()
                .find(|m| m.participant == *participant)
            {
                return existing.clone();
            }

            let hostless = !inner.members.iter().any(|m| m.role == Role::Host);
            let role = if hostless && inner.original_host == *participant {
                Role::Host
            } else {
                Role::Listener
            };

            let member = Member {
                participant: participant.clone(),
                role,
                joined_at: Utc::now(),
            };

            inner.members.push(member.clone());
            member
        };

        if member.role == Role::Host {
            info!("Host {} reclaimed room {}", participant, self.slug);
            self.coordinator.set_host(Some(participant.clone()));
        }

        self.coordinator.broadcast(ServerEvent::RoomJoined {
            slug: self.slug.clone(),
            member: member.clone(),
        });

        self.context.events.emit(TandemEvent::MemberJoined {
            slug: self.slug.clone(),
            member: member.clone(),
        });

        member
    }

    /// Removes a participant's membership. A departing host leaves the
    /// room hostless, refusing playback commands until the original host
    /// returns or the room is reaped.
    pub fn remove_member(&self, participant: &ParticipantId) -> Result<(), RoomError> {
        let was_host = {
            let mut inner = self.inner.lock();

            let member = inner
                .members
                .iter()
                .find(|m| m.participant == *participant)
                .cloned()
                .ok_or(RoomError::NotInRoom)?;

            inner.members.retain(|m| m.participant != *participant);
            inner.last_activity = Utc::now();

            member.role == Role::Host
        };

        if was_host {
            info!("Host left room {}, room is now hostless", self.slug);
            self.coordinator.set_host(None);
        }

        self.coordinator.broadcast(ServerEvent::RoomLeft {
            slug: self.slug.clone(),
            participant: participant.clone(),
        });

        self.context.events.emit(TandemEvent::MemberLeft {
            slug: self.slug.clone(),
            participant: participant.clone(),
        });

        Ok(())
    }

    /// Submits a playback command to the room's coordinator.
    pub async fn submit(&self, envelope: CommandEnvelope) -> Result<PlaybackState, RoomError> {
        self.touch();
        self.coordinator.submit(envelope).await
    }

    /// Subscribes a session's sink to the room's broadcasts.
    pub fn subscribe(&self, sink: EventSink) -> Subscription {
        self.coordinator.subscribe(sink)
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity = Utc::now();
    }

    /// How long the room has gone without membership or playback
    /// activity.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.inner.lock().last_activity)
            .to_std()
            .unwrap_or_default()
    }

    /// Whether the reaper may remove this room.
    pub fn is_reapable(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        self.member_count() == 0 && self.idle_for(now) >= idle_timeout
    }

    /// Tears the room down, notifying every subscribed session first.
    pub fn close(&self) {
        self.coordinator.broadcast(ServerEvent::RoomClosed {
            slug: self.slug.clone(),
        });
        self.coordinator.close();
    }
}
