use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{MessageRepository, ParticipantLookup, ParticipantRepository, Repository};
use crate::models::{Message, MessageId, Participant, ParticipantId};

/// Process-local backend. Used for tests and `CHAT_STORAGE=memory` deployments.
#[derive(Default)]
pub struct MemoryRepository {
    messages: RwLock<BTreeMap<MessageId, Message>>,
    participants: RwLock<HashMap<ParticipantId, Participant>>,
    failing: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, to exercise error paths.
    #[cfg(test)]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("memory repository unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryRepository {
    async fn append_message(&self, message: &Message) -> anyhow::Result<()> {
        self.check()?;
        self.messages.write().await.insert(message.id, message.clone());
        Ok(())
    }

    async fn find_message(&self, id: MessageId) -> anyhow::Result<Option<Message>> {
        self.check()?;
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn update_message(&self, message: &Message) -> anyhow::Result<()> {
        self.check()?;
        if let Some(stored) = self.messages.write().await.get_mut(&message.id) {
            stored.body = message.body.clone();
            stored.edited = message.edited;
        }
        Ok(())
    }

    async fn delete_message(&self, id: MessageId) -> anyhow::Result<bool> {
        self.check()?;
        Ok(self.messages.write().await.remove(&id).is_some())
    }

    async fn list_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>> {
        self.check()?;
        let messages = self.messages.read().await;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.values().skip(skip).cloned().collect())
    }

    async fn count_messages(&self) -> anyhow::Result<usize> {
        self.check()?;
        Ok(self.messages.read().await.len())
    }

    async fn delete_oldest_excess(&self, keep: usize) -> anyhow::Result<usize> {
        self.check()?;
        let mut messages = self.messages.write().await;
        let excess = messages.len().saturating_sub(keep);
        let doomed: Vec<MessageId> = messages.keys().take(excess).copied().collect();
        for id in &doomed {
            messages.remove(id);
        }
        Ok(doomed.len())
    }

    async fn clear_messages(&self) -> anyhow::Result<()> {
        self.check()?;
        self.messages.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl ParticipantRepository for MemoryRepository {
    async fn upsert_participant(&self, participant: &Participant) -> anyhow::Result<()> {
        self.check()?;
        self.participants
            .write()
            .await
            .insert(participant.id, participant.clone());
        Ok(())
    }

    async fn find_participant(&self, lookup: ParticipantLookup<'_>) -> anyhow::Result<Option<Participant>> {
        self.check()?;
        let participants = self.participants.read().await;
        Ok(match lookup {
            ParticipantLookup::Id(id) => participants.get(&id).cloned(),
            ParticipantLookup::Name(name) => participants
                .values()
                .find(|p| p.name.to_lowercase() == name.to_lowercase())
                .cloned(),
        })
    }

    async fn list_participants(&self) -> anyhow::Result<Vec<Participant>> {
        self.check()?;
        let mut all: Vec<Participant> = self.participants.read().await.values().cloned().collect();
        all.sort_by_key(|p| p.created_at);
        Ok(all)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> bool {
        self.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

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

    #[tokio::test]
    async fn test_trim_keeps_newest() {
        let repo = MemoryRepository::new();
        for id in 1..=5 {
            repo.append_message(&message(id)).await.unwrap();
        }
        assert_eq!(repo.delete_oldest_excess(3).await.unwrap(), 2);
        let ids: Vec<_> = repo.list_recent(10).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        let ids: Vec<_> = repo.list_recent(2).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(repo.count_messages().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let repo = MemoryRepository::new();
        repo.set_failing(true);
        assert!(repo.append_message(&message(1)).await.is_err());
        repo.set_failing(false);
        assert!(repo.append_message(&message(1)).await.is_ok());
        assert!(repo.find_message(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_name_lookup_ignores_case() {
        let repo = MemoryRepository::new();
        let participant = Participant {
            id: ParticipantId::new(),
            name: "Alice".to_string(),
            credential: String::new(),
            role: Role::User,
            banned: false,
            shadow_banned: false,
            mute_until: None,
            color: "#000000".to_string(),
            created_at: 0,
        };
        repo.upsert_participant(&participant).await.unwrap();
        let found = repo
            .find_participant(ParticipantLookup::Name("aLICE"))
            .await
            .unwrap();
        assert_eq!(found.map(|p| p.id), Some(participant.id));
    }
}
