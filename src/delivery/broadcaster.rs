use std::collections::HashSet;
use std::sync::Arc;

use super::sessions::{ConnectionRefused, EventReceiver, SessionId, SessionRegistry};
use crate::models::{ParticipantId, ServerEvent};

/// Fan-out of server events to live sessions with per-recipient filtering.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
}

/// Holds a session's connection slot. Dropping it releases the slot and refreshes the online
/// count, so teardown happens on every exit path of the connection task.
pub struct SessionGuard {
    id: SessionId,
    broadcaster: Broadcaster,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.broadcaster.disconnect(self.id);
    }
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Open a session for `origin`, enforcing the per-origin cap.
    pub fn connect(&self, origin: &str) -> Result<(SessionGuard, EventReceiver), ConnectionRefused> {
        let (id, rx) = self.registry.open(origin)?;
        metrics::gauge!("chat_sessions_active", self.registry.connection_count() as f64);
        tracing::debug!(session = id, "session opened");
        Ok((
            SessionGuard {
                id,
                broadcaster: self.clone(),
            },
            rx,
        ))
    }

    /// Bind a participant to a session and announce the new online count.
    pub fn authenticate(&self, session: SessionId, participant: ParticipantId) {
        if self.registry.bind(session, participant) {
            tracing::debug!(session, participant = %participant, "session authenticated");
            self.broadcast_count();
        }
    }

    fn disconnect(&self, session: SessionId) {
        if self.registry.close(session) {
            tracing::debug!(session, "session closed");
        }
        metrics::gauge!("chat_sessions_active", self.registry.connection_count() as f64);
        self.broadcast_count();
    }

    /// Recompute distinct online participants and push the figure to everyone.
    pub fn broadcast_count(&self) -> usize {
        let (count, _) = self.registry.send_online_count();
        metrics::gauge!("chat_online_participants", count as f64);
        count
    }

    pub fn broadcast(&self, event: &ServerEvent) {
        self.registry.send_where(event, |_, _| true);
    }

    pub fn send_to_session(&self, session: SessionId, event: &ServerEvent) {
        self.registry.send_where(event, |id, _| id == session);
    }

    /// Every live session of one participant.
    pub fn send_to_participant(&self, participant: ParticipantId, event: &ServerEvent) {
        self.registry
            .send_where(event, |_, bound| bound == Some(participant));
    }

    pub fn send_to_participants(&self, recipients: &HashSet<ParticipantId>, event: &ServerEvent) {
        if recipients.is_empty() {
            return;
        }
        self.registry.send_where(event, |_, bound| {
            bound.map_or(false, |participant| recipients.contains(&participant))
        });
    }

    /// Every session except the ones bound to `excluded` participants, anonymous ones included.
    pub fn broadcast_except(&self, excluded: &HashSet<ParticipantId>, event: &ServerEvent) {
        self.registry.send_where(event, |_, bound| {
            bound.map_or(true, |participant| !excluded.contains(&participant))
        });
    }

    pub fn online_count(&self) -> usize {
        self.registry.online_count()
    }
}
