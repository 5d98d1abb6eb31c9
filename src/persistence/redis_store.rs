use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{MessageRepository, ParticipantLookup, ParticipantRepository, Repository};
use crate::models::{Message, MessageId, Participant};
use crate::redis_client::RedisClient;

const MESSAGES_KEY: &str = "chat:messages";
const MESSAGE_KEY_PREFIX: &str = "chat:message:";
const PARTICIPANTS_KEY: &str = "chat:participants";
const PARTICIPANT_NAMES_KEY: &str = "chat:participant_names";

fn message_key(id: MessageId) -> String {
    format!("{}{}", MESSAGE_KEY_PREFIX, id)
}

/// Messages live under `chat:message:<id>` with their ids in the `chat:messages` sorted set
/// (score = id). Participants are JSON values in the `chat:participants` hash, with a lowercased
/// name index in `chat:participant_names`.
#[derive(Clone)]
pub struct RedisRepository {
    redis: RedisClient,
}

impl RedisRepository {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    async fn load_messages(&self, ids: Vec<String>) -> Result<Vec<Message>> {
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}{}", MESSAGE_KEY_PREFIX, id))
            .collect();
        let values = self.redis.mget(&keys).await.context("Failed to load messages")?;

        let mut messages = Vec::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            match value.map(|json| serde_json::from_str::<Message>(&json)) {
                Some(Ok(message)) => messages.push(message),
                Some(Err(e)) => tracing::warn!(key = %key, error = %e, "skipping unreadable message"),
                None => tracing::warn!(key = %key, "message indexed but missing"),
            }
        }
        Ok(messages)
    }

    async fn oldest_ids(&self, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.redis
            .zrange(MESSAGES_KEY, 0, count as isize - 1)
            .await
            .context("Failed to read message index")
    }
}

#[async_trait]
impl MessageRepository for RedisRepository {
    async fn append_message(&self, message: &Message) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.redis
            .set(&message_key(message.id), &json)
            .await
            .context("Failed to store message")?;
        self.redis
            .zadd(MESSAGES_KEY, message.id, &message.id.to_string())
            .await
            .context("Failed to index message")?;
        Ok(())
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        match self.redis.get(&message_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let Some(mut stored) = self.find_message(message.id).await? else {
            return Ok(());
        };
        stored.body = message.body.clone();
        stored.edited = message.edited;
        let json = serde_json::to_string(&stored)?;
        self.redis
            .set(&message_key(message.id), &json)
            .await
            .context("Failed to update message")
    }

    async fn delete_message(&self, id: MessageId) -> Result<bool> {
        let deleted = self
            .redis
            .zrem_and_del(MESSAGES_KEY, &[id.to_string()], &[message_key(id)])
            .await
            .context("Failed to delete message")?;
        Ok(deleted > 0)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = self
            .redis
            .zrange(MESSAGES_KEY, -(limit as isize), -1)
            .await
            .context("Failed to read message index")?;
        self.load_messages(ids).await
    }

    async fn count_messages(&self) -> Result<usize> {
        Ok(self.redis.zcard(MESSAGES_KEY).await? as usize)
    }

    async fn delete_oldest_excess(&self, keep: usize) -> Result<usize> {
        let total = self.count_messages().await?;
        let excess = total.saturating_sub(keep);
        let doomed = self.oldest_ids(excess).await?;
        if doomed.is_empty() {
            return Ok(0);
        }

        // Exactly the members read above, never by rank: trims from other processes may overlap.
        let keys: Vec<String> = doomed
            .iter()
            .map(|id| format!("{}{}", MESSAGE_KEY_PREFIX, id))
            .collect();
        self.redis
            .zrem_and_del(MESSAGES_KEY, &doomed, &keys)
            .await
            .context("Failed to evict messages")?;
        Ok(doomed.len())
    }

    async fn clear_messages(&self) -> Result<()> {
        let mut keys: Vec<String> = self
            .redis
            .zrange(MESSAGES_KEY, 0, -1)
            .await?
            .iter()
            .map(|id| format!("{}{}", MESSAGE_KEY_PREFIX, id))
            .collect();
        keys.push(MESSAGES_KEY.to_string());
        self.redis.del(&keys).await.context("Failed to clear messages")?;
        Ok(())
    }
}

#[async_trait]
impl ParticipantRepository for RedisRepository {
    async fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        let id = participant.id.to_string();
        let json = serde_json::to_string(participant)?;
        self.redis
            .hset(PARTICIPANTS_KEY, &id, &json)
            .await
            .context("Failed to store participant")?;
        self.redis
            .hset(PARTICIPANT_NAMES_KEY, &participant.name.to_lowercase(), &id)
            .await
            .context("Failed to index participant name")?;
        Ok(())
    }

    async fn find_participant(&self, lookup: ParticipantLookup<'_>) -> Result<Option<Participant>> {
        let id = match lookup {
            ParticipantLookup::Id(id) => id.to_string(),
            ParticipantLookup::Name(name) => match self.redis.hget(PARTICIPANT_NAMES_KEY, &name.to_lowercase()).await? {
                Some(id) => id,
                None => return Ok(None),
            },
        };
        match self.redis.hget(PARTICIPANTS_KEY, &id).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn list_participants(&self) -> Result<Vec<Participant>> {
        let mut participants = Vec::new();
        for json in self.redis.hvals(PARTICIPANTS_KEY).await? {
            match serde_json::from_str::<Participant>(&json) {
                Ok(participant) => participants.push(participant),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable participant record"),
            }
        }
        participants.sort_by_key(|p| p.created_at);
        Ok(participants)
    }
}

#[async_trait]
impl Repository for RedisRepository {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> bool {
        self.redis.ping().await.unwrap_or(false)
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
    fn test_message_key_layout() {
        assert_eq!(message_key(1_700_000_000_123), "chat:message:1700000000123");
        assert!(message_key(7).starts_with(MESSAGE_KEY_PREFIX));
    }

    /// Runs against the scratch Redis in `CHAT_TEST_REDIS_URL`; skipped when unset.
    /// Wipes the chat message keys there.
    #[tokio::test]
    async fn test_overlapping_trims_leave_no_orphans() {
        let Ok(url) = std::env::var("CHAT_TEST_REDIS_URL") else {
            return;
        };
        let repo = RedisRepository::new(RedisClient::new(&url).await.unwrap());
        repo.clear_messages().await.unwrap();
        for id in 1..=10 {
            repo.append_message(&message(id)).await.unwrap();
        }

        let (a, b) = tokio::join!(repo.delete_oldest_excess(7), repo.delete_oldest_excess(5));
        a.unwrap();
        b.unwrap();

        let ids: Vec<_> = repo.list_recent(100).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, (6..=10).collect::<Vec<_>>());
        assert_eq!(repo.count_messages().await.unwrap(), 5);
        for id in 1..=5 {
            assert!(repo.find_message(id).await.unwrap().is_none());
        }
        repo.clear_messages().await.unwrap();
    }
}
