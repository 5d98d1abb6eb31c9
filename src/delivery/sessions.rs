use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::{ParticipantId, ServerEvent};

pub type SessionId = u64;
pub type EventReceiver = mpsc::Receiver<ServerEvent>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionRefused {
    #[error("too many concurrent connections from this origin (limit {limit})")]
    OriginLimit { limit: usize },
}

struct SessionEntry {
    origin: String,
    participant: Option<ParticipantId>,
    tx: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    origins: HashMap<String, usize>,
}

impl Inner {
    fn remove(&mut self, id: SessionId) -> Option<SessionEntry> {
        let entry = self.sessions.remove(&id)?;
        if let Some(count) = self.origins.get_mut(&entry.origin) {
            *count -= 1;
            if *count == 0 {
                self.origins.remove(&entry.origin);
            }
        }
        Some(entry)
    }

    fn online_count(&self) -> usize {
        self.sessions
            .values()
            .filter_map(|entry| entry.participant)
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Live connections, their bound participants and per-origin slot accounting.
///
/// All bookkeeping happens under one short lock that is never held across an await.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    max_per_origin: usize,
    buffer: usize,
}

impl SessionRegistry {
    pub fn new(max_per_origin: usize, buffer: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            max_per_origin,
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a connection slot for `origin`.
    pub fn open(&self, origin: &str) -> Result<(SessionId, EventReceiver), ConnectionRefused> {
        let mut inner = self.lock();
        let in_use = inner.origins.get(origin).copied().unwrap_or(0);
        if in_use >= self.max_per_origin {
            return Err(ConnectionRefused::OriginLimit {
                limit: self.max_per_origin,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        inner.origins.insert(origin.to_string(), in_use + 1);
        inner.sessions.insert(
            id,
            SessionEntry {
                origin: origin.to_string(),
                participant: None,
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Release a session. Returns false when it was already gone, so the slot is freed once.
    pub fn close(&self, id: SessionId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Attach an authenticated participant to a session.
    pub fn bind(&self, id: SessionId, participant: ParticipantId) -> bool {
        match self.lock().sessions.get_mut(&id) {
            Some(entry) => {
                entry.participant = Some(participant);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn participant_of(&self, id: SessionId) -> Option<ParticipantId> {
        self.lock().sessions.get(&id).and_then(|entry| entry.participant)
    }

    /// Distinct authenticated participants with at least one live session.
    pub fn online_count(&self) -> usize {
        self.lock().online_count()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().sessions.len()
    }

    #[cfg(test)]
    pub fn origin_connections(&self, origin: &str) -> usize {
        self.lock().origins.get(origin).copied().unwrap_or(0)
    }

    /// Queue `event` for every session accepted by `filter`.
    ///
    /// Sessions whose queue is full are dropped on the spot (slot released here, their guard's
    /// later close is a no-op). Returns how many were dropped.
    pub fn send_where<F>(&self, event: &ServerEvent, filter: F) -> usize
    where
        F: Fn(SessionId, Option<ParticipantId>) -> bool,
    {
        let mut inner = self.lock();
        Self::deliver(&mut inner, event, filter)
    }

    /// Compute the online count and queue it to everyone under the same lock, so counts reach
    /// sessions in the order the membership changed.
    pub fn send_online_count(&self) -> (usize, usize) {
        let mut inner = self.lock();
        let count = inner.online_count();
        let dropped = Self::deliver(&mut inner, &ServerEvent::OnlineCount { count }, |_, _| true);
        (count, dropped)
    }

    fn deliver<F>(inner: &mut Inner, event: &ServerEvent, filter: F) -> usize
    where
        F: Fn(SessionId, Option<ParticipantId>) -> bool,
    {
        let mut laggards = Vec::new();
        for (id, entry) in inner.sessions.iter() {
            if !filter(*id, entry.participant) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(session = id, "session queue full, dropping slow consumer");
                    laggards.push(*id);
                }
                Err(TrySendError::Closed(_)) => laggards.push(*id),
            }
        }
        for id in &laggards {
            inner.remove(*id);
        }
        laggards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_cap_and_release() {
        let registry = SessionRegistry::new(2, 8);
        let (a, _rx_a) = registry.open("origin-1").unwrap();
        let (_b, _rx_b) = registry.open("origin-1").unwrap();
        assert_eq!(
            registry.open("origin-1").unwrap_err(),
            ConnectionRefused::OriginLimit { limit: 2 }
        );
        assert!(registry.open("origin-2").is_ok());

        assert!(registry.close(a));
        assert!(!registry.close(a), "second close must not free another slot");
        assert_eq!(registry.origin_connections("origin-1"), 1);
        assert!(registry.open("origin-1").is_ok());
    }

    #[test]
    fn test_online_count_is_distinct_participants() {
        let registry = SessionRegistry::new(10, 8);
        let alice = ParticipantId::new();
        let (s1, _r1) = registry.open("o").unwrap();
        let (s2, _r2) = registry.open("o").unwrap();
        let (_s3, _r3) = registry.open("o").unwrap();
        registry.bind(s1, alice);
        registry.bind(s2, alice);
        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.participant_of(s2), Some(alice));
    }

    #[test]
    fn test_full_queue_drops_session_once() {
        let registry = SessionRegistry::new(10, 1);
        let (slow, _rx) = registry.open("o").unwrap();
        let event = ServerEvent::HistoryCleared;
        assert_eq!(registry.send_where(&event, |_, _| true), 0);
        assert_eq!(registry.send_where(&event, |_, _| true), 1);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.origin_connections("o"), 0);
        assert!(!registry.close(slow));
    }

    #[test]
    fn test_closed_receiver_is_reaped() {
        let registry = SessionRegistry::new(10, 4);
        let (_gone, rx) = registry.open("o").unwrap();
        drop(rx);
        let (count, dropped) = registry.send_online_count();
        assert_eq!((count, dropped), (0, 1));
        assert_eq!(registry.connection_count(), 0);
    }
}
