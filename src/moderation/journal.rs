use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::models::{Message, MessageId};
use crate::persistence::Repository;

/// One durable change to message history.
#[derive(Debug)]
pub enum HistoryWrite {
    /// Append, then trim storage back to the history cap.
    Append(Message),
    Update(Message),
    Delete(MessageId),
    Clear,
}

impl HistoryWrite {
    fn label(&self) -> &'static str {
        match self {
            HistoryWrite::Append(_) => "append",
            HistoryWrite::Update(_) => "update",
            HistoryWrite::Delete(_) => "delete",
            HistoryWrite::Clear => "clear",
        }
    }
}

type Job = (HistoryWrite, oneshot::Sender<anyhow::Result<()>>);

/// Completion handle for a queued write.
#[must_use]
pub struct PendingWrite(oneshot::Receiver<anyhow::Result<()>>);

impl PendingWrite {
    pub async fn wait(self) -> anyhow::Result<()> {
        self.0
            .await
            .unwrap_or_else(|_| Err(anyhow!("history writer stopped")))
    }
}

/// Applies history writes one at a time, in the order they were queued.
///
/// Writes are queued while the engine holds its delivery lock, so storage sees the same order as
/// the in-memory store: a delete queued after a post's append always runs after it.
pub struct HistoryJournal {
    tx: mpsc::UnboundedSender<Job>,
}

impl HistoryJournal {
    /// Start the writer task. It stops once the journal is dropped and the queue drains.
    pub fn spawn(repo: Arc<dyn Repository>, cap: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some((write, done)) = rx.recv().await {
                let label = write.label();
                let result = apply(repo.as_ref(), cap, write).await;
                if let Err(err) = &result {
                    tracing::debug!(write = label, error = %err, "history write failed");
                }
                let _ = done.send(result);
            }
        });
        Self { tx }
    }

    /// Queue `write`. Never blocks, so it is safe to call under a std mutex.
    pub fn submit(&self, write: HistoryWrite) -> PendingWrite {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError((_, done))) = self.tx.send((write, done)) {
            let _ = done.send(Err(anyhow!("history writer stopped")));
        }
        PendingWrite(rx)
    }
}

async fn apply(repo: &dyn Repository, cap: usize, write: HistoryWrite) -> anyhow::Result<()> {
    match write {
        HistoryWrite::Append(message) => {
            repo.append_message(&message).await?;
            if let Err(err) = repo.delete_oldest_excess(cap).await {
                tracing::warn!(error = %err, "failed to trim persisted history");
            }
            Ok(())
        }
        HistoryWrite::Update(message) => repo.update_message(&message).await,
        HistoryWrite::Delete(id) => repo.delete_message(id).await.map(|_| ()),
        HistoryWrite::Clear => repo.clear_messages().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParticipantId, Role};
    use crate::persistence::{MemoryRepository, MessageRepository};

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
    async fn test_writes_apply_in_queue_order() {
        let repo = Arc::new(MemoryRepository::new());
        let journal = HistoryJournal::spawn(repo.clone(), 2);

        let writes = vec![
            journal.submit(HistoryWrite::Append(message(1))),
            journal.submit(HistoryWrite::Append(message(2))),
            journal.submit(HistoryWrite::Delete(2)),
            journal.submit(HistoryWrite::Append(message(3))),
            journal.submit(HistoryWrite::Append(message(4))),
        ];
        for write in writes {
            write.wait().await.unwrap();
        }

        let ids: Vec<_> = repo.list_recent(10).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_failures_reach_the_caller() {
        let repo = Arc::new(MemoryRepository::new());
        let journal = HistoryJournal::spawn(repo.clone(), 10);
        repo.set_failing(true);
        assert!(journal.submit(HistoryWrite::Clear).wait().await.is_err());
        repo.set_failing(false);
        assert!(journal.submit(HistoryWrite::Clear).wait().await.is_ok());
    }
}
