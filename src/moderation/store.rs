use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::{Message, MessageId};

struct History {
    messages: VecDeque<Message>,
    last_id: MessageId,
}

/// Bounded in-memory history of visible messages, oldest first.
pub struct MessageStore {
    cap: usize,
    history: Mutex<History>,
}

impl MessageStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            history: Mutex::new(History {
                messages: VecDeque::with_capacity(cap),
                last_id: 0,
            }),
        }
    }

    /// Seed from persisted messages. Ids handed out afterwards stay above every loaded id.
    pub fn hydrate(&self, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.id);
        let skip = messages.len().saturating_sub(self.cap);

        let mut history = self.lock();
        history.last_id = messages.last().map_or(history.last_id, |m| m.id.max(history.last_id));
        history.messages = messages.into_iter().skip(skip).collect();
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Next message id: the wall clock, bumped past the previous id on same-millisecond bursts
    /// or when the clock steps backwards.
    pub fn next_id(&self, now: i64) -> MessageId {
        let mut history = self.lock();
        let id = now.max(history.last_id + 1);
        history.last_id = id;
        id
    }

    /// Append at the tail and return whatever fell off the head.
    pub fn append(&self, message: Message) -> Vec<Message> {
        let mut history = self.lock();
        history.last_id = history.last_id.max(message.id);
        history.messages.push_back(message);

        let excess = history.messages.len().saturating_sub(self.cap);
        history.messages.drain(..excess).collect()
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    /// Replace the body of a stored message and flag it edited.
    pub fn edit(&self, id: MessageId, body: String) -> Option<Message> {
        let mut history = self.lock();
        let message = history.messages.iter_mut().find(|m| m.id == id)?;
        message.body = body;
        message.edited = true;
        Some(message.clone())
    }

    pub fn remove(&self, id: MessageId) -> Option<Message> {
        let mut history = self.lock();
        let index = history.messages.iter().position(|m| m.id == id)?;
        history.messages.remove(index)
    }

    /// Empty the history; returns how many messages were dropped.
    pub fn clear(&self) -> usize {
        let mut history = self.lock();
        let dropped = history.messages.len();
        history.messages.clear();
        dropped
    }

    /// Highest id handed out so far.
    pub fn last_id(&self) -> MessageId {
        self.lock().last_id
    }

    pub fn recent(&self) -> Vec<Message> {
        self.lock().messages.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParticipantId, Role};

    fn message(id: MessageId) -> Message {
        Message {
            id,
            author_id: ParticipantId::new(),
            author: "alice".to_string(),
            body: format!("message {}", id),
            role: Role::User,
            color: "#000000".to_string(),
            edited: false,
            reply_to: None,
            created_at: id,
        }
    }

    #[test]
    fn test_ids_are_unique_within_one_millisecond() {
        let store = MessageStore::new(50);
        let a = store.next_id(1_000);
        let b = store.next_id(1_000);
        let c = store.next_id(999);
        assert_eq!((a, b, c), (1_000, 1_001, 1_002));
        assert_eq!(store.next_id(5_000), 5_000);
    }

    #[test]
    fn test_cap_evicts_oldest_in_order() {
        let store = MessageStore::new(3);
        let mut evicted = Vec::new();
        for id in 1..=5 {
            evicted.extend(store.append(message(id)));
        }
        let kept: Vec<_> = store.recent().iter().map(|m| m.id).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        let dropped: Vec<_> = evicted.iter().map(|m| m.id).collect();
        assert_eq!(dropped, vec![1, 2]);
    }

    #[test]
    fn test_edit_remove_clear() {
        let store = MessageStore::new(10);
        store.append(message(1));
        store.append(message(2));

        let edited = store.edit(1, "changed".to_string()).unwrap();
        assert!(edited.edited);
        assert_eq!(store.get(1).unwrap().body, "changed");
        assert!(store.edit(9, "nope".to_string()).is_none());

        assert_eq!(store.remove(2).map(|m| m.id), Some(2));
        assert!(store.remove(2).is_none());
        assert_eq!(store.clear(), 1);
        assert!(store.recent().is_empty());
    }

    #[test]
    fn test_hydrate_keeps_newest_and_advances_ids() {
        let store = MessageStore::new(2);
        store.hydrate(vec![message(30), message(10), message(20)]);
        let kept: Vec<_> = store.recent().iter().map(|m| m.id).collect();
        assert_eq!(kept, vec![20, 30]);
        assert_eq!(store.next_id(5), 31);
    }
}
