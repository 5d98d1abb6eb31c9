//! Storage ports for messages and participants.
//!
//! The in-memory state held by the directory and the message store is authoritative while the
//! process runs; these traits are the durable side they write through to and hydrate from.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;

use crate::models::{Message, MessageId, Participant, ParticipantId};

pub use memory::MemoryRepository;
pub use redis_store::RedisRepository;

#[derive(Clone, Copy, Debug)]
pub enum ParticipantLookup<'a> {
    Id(ParticipantId),
    Name(&'a str),
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn append_message(&self, message: &Message) -> anyhow::Result<()>;
    async fn find_message(&self, id: MessageId) -> anyhow::Result<Option<Message>>;
    /// Replace the stored body/edited flag of an existing message.
    async fn update_message(&self, message: &Message) -> anyhow::Result<()>;
    /// Returns whether a message was removed.
    async fn delete_message(&self, id: MessageId) -> anyhow::Result<bool>;
    /// Most recent `limit` messages, oldest first.
    async fn list_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>>;
    async fn count_messages(&self) -> anyhow::Result<usize>;
    /// Drop everything but the newest `keep` messages; returns how many were removed.
    async fn delete_oldest_excess(&self, keep: usize) -> anyhow::Result<usize>;
    async fn clear_messages(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ParticipantRepository: Send + Sync {
    async fn upsert_participant(&self, participant: &Participant) -> anyhow::Result<()>;
    async fn find_participant(&self, lookup: ParticipantLookup<'_>) -> anyhow::Result<Option<Participant>>;
    async fn list_participants(&self) -> anyhow::Result<Vec<Participant>>;
}

/// A backend providing both repositories.
#[async_trait]
pub trait Repository: MessageRepository + ParticipantRepository {
    fn backend_name(&self) -> &'static str;

    /// Cheap reachability probe for `/health`.
    async fn ping(&self) -> bool;
}
