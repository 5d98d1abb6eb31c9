use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;

use super::commands::{AdminCommand, Command, MuteDuration, OwnerCommand};
use super::directory::{MuteSetting, ParticipantDirectory};
use super::journal::{HistoryJournal, HistoryWrite, PendingWrite};
use super::store::MessageStore;
use crate::clock::{format_until, Clock};
use crate::config::ModerationConfig;
use crate::delivery::{Broadcaster, SessionId};
use crate::error::{ChatError, RateLimitKind, Result};
use crate::models::{
    ClientEvent, Message, MessageId, Participant, ParticipantId, ReplyRequest, ReplySnapshot, Role,
    ServerEvent,
};
use crate::persistence::Repository;
use crate::security::rate_limiter::{RateDecision, RateLimiter};
use crate::security::sanitizer::{clean, truncate};

/// Visible length of the author name inside a reply snapshot.
const REPLY_AUTHOR_CHARS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    /// Delivered to the author alone.
    Shadowed,
}

impl Visibility {
    fn as_str(self) -> &'static str {
        match self {
            Visibility::Visible => "visible",
            Visibility::Shadowed => "shadowed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Posted {
    pub message: Message,
    pub visibility: Visibility,
}

#[derive(Clone, Debug)]
pub enum CommandOutcome {
    Participant(Participant),
    MessageRemoved(MessageId),
    HistoryCleared,
    Kicked,
}

impl CommandOutcome {
    fn summary(&self) -> String {
        match self {
            CommandOutcome::Participant(p) => format!(
                "{} role={} banned={} muted_until={:?} shadow_banned={}",
                p.id, p.role, p.banned, p.mute_until, p.shadow_banned
            ),
            CommandOutcome::MessageRemoved(id) => format!("message {} removed", id),
            CommandOutcome::HistoryCleared => "history cleared".to_string(),
            CommandOutcome::Kicked => "all sessions kicked".to_string(),
        }
    }
}

/// Decides what happens to every post and command, and who gets told.
pub struct ModerationEngine {
    config: ModerationConfig,
    clock: Arc<dyn Clock>,
    journal: HistoryJournal,
    directory: ParticipantDirectory,
    store: MessageStore,
    limiter: RateLimiter,
    broadcaster: Broadcaster,
    /// Posts of shadow-banned authors, visible to those authors only.
    shadowed: Mutex<HashMap<ParticipantId, VecDeque<Message>>>,
    /// Held across id assignment, store mutation and fan-out so delivery order matches store
    /// order. Never held across I/O.
    delivery: Mutex<()>,
}

impl ModerationEngine {
    /// Hydrate participants and recent history from `repo`.
    pub async fn load(
        config: ModerationConfig,
        clock: Arc<dyn Clock>,
        repo: Arc<dyn Repository>,
        broadcaster: Broadcaster,
    ) -> anyhow::Result<Self> {
        let directory = ParticipantDirectory::load(repo.clone())
            .await
            .context("Failed to load participants")?;

        let store = MessageStore::new(config.history_cap);
        let recent = repo
            .list_recent(config.history_cap)
            .await
            .context("Failed to load message history")?;
        tracing::info!(messages = recent.len(), "message history loaded");
        store.hydrate(recent);

        Ok(Self {
            limiter: RateLimiter::new(config.rate),
            journal: HistoryJournal::spawn(repo, config.history_cap),
            config,
            clock,
            directory,
            store,
            broadcaster,
            shadowed: Mutex::new(HashMap::new()),
            delivery: Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &ParticipantDirectory {
        &self.directory
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn delivery_lock(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shadowed(&self) -> MutexGuard<'_, HashMap<ParticipantId, VecDeque<Message>>> {
        self.shadowed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn participant(&self, id: ParticipantId) -> Result<Participant> {
        self.directory
            .get(id)
            .ok_or_else(|| ChatError::NotFound("participant".to_string()))
    }

    /// Route one inbound frame. Anonymous sessions may only watch.
    pub async fn dispatch(&self, actor: Option<ParticipantId>, event: ClientEvent) -> Result<()> {
        let result = match actor {
            None => Err(ChatError::Authorization(
                "Sign in to take part in the chat.".to_string(),
            )),
            Some(actor) => match event {
                ClientEvent::Submit { body, reply_to } => self
                    .submit_message(actor, &body, reply_to)
                    .await
                    .map(|_| ()),
                ClientEvent::Edit { message_id, body } => self
                    .edit_message(actor, message_id, &body)
                    .await
                    .map(|_| ()),
                ClientEvent::DeleteOwn { message_id } => {
                    self.delete_own_message(actor, message_id).await
                }
                ClientEvent::Command { command } => self.execute(actor, command).await.map(|_| ()),
            },
        };

        if let Err(err) = &result {
            if let ChatError::Persistence(cause) = err {
                tracing::error!(error = %cause, "storage failure, action not applied");
            }
            metrics::counter!("chat_rejections_total", 1, "reason" => err.reason_label());
        }
        result
    }

    /// Queue the viewer's history on a fresh session.
    ///
    /// Runs under the delivery lock, so a post racing with the connect shows up exactly once:
    /// either in the history or as a live event after it.
    pub fn welcome(&self, session: SessionId, viewer: Option<ParticipantId>) {
        let _order = self.delivery_lock();
        let messages = self.history_for(viewer);
        self.broadcaster
            .send_to_session(session, &ServerEvent::LoadHistory { messages });
    }

    /// Store contents, merged with the viewer's own shadowed posts.
    pub fn history_for(&self, viewer: Option<ParticipantId>) -> Vec<Message> {
        let mut messages = self.store.recent();
        let Some(viewer) = viewer else {
            return messages;
        };

        if let Some(own) = self.shadowed().get(&viewer) {
            messages.extend(own.iter().cloned());
            messages.sort_by_key(|m| m.id);
            let excess = messages.len().saturating_sub(self.store.cap());
            messages.drain(..excess);
        }
        messages
    }

    fn validate_body(&self, body: &str) -> Result<()> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::Validation("Message cannot be empty.".to_string()));
        }
        if body.chars().count() > self.config.max_body_chars {
            return Err(ChatError::Validation(format!(
                "Message is too long (max {} characters).",
                self.config.max_body_chars
            )));
        }
        Ok(())
    }

    fn ensure_postable(participant: &Participant, now: i64) -> Result<()> {
        if participant.is_postable(now) {
            return Ok(());
        }
        if participant.banned {
            return Err(ChatError::Authorization("You are banned.".to_string()));
        }
        let until = participant.mute_until.unwrap_or_default();
        Err(ChatError::Authorization(format!(
            "You are muted until {}.",
            format_until(until)
        )))
    }

    /// Quoted content comes from the stored message when it is still in history; otherwise the
    /// client's copy is escaped and bounded.
    fn reply_snapshot(&self, reply: ReplyRequest) -> ReplySnapshot {
        let limit = self.config.reply_snippet_chars;
        match self.store.get(reply.id) {
            Some(quoted) => ReplySnapshot {
                id: quoted.id,
                author: truncate(&clean(&quoted.author), REPLY_AUTHOR_CHARS),
                body: truncate(&clean(&quoted.body), limit),
            },
            None => ReplySnapshot {
                id: reply.id,
                author: truncate(&clean(&reply.author), REPLY_AUTHOR_CHARS),
                body: truncate(&clean(&reply.body), limit),
            },
        }
    }

    pub async fn submit_message(
        &self,
        sender: ParticipantId,
        body: &str,
        reply_to: Option<ReplyRequest>,
    ) -> Result<Posted> {
        let now = self.clock.now_ms();
        let participant = self.participant(sender)?;
        if participant.banned {
            return Err(ChatError::Authorization("You are banned.".to_string()));
        }
        self.validate_body(body)?;

        match self.limiter.check(sender, now) {
            RateDecision::Allowed => {}
            RateDecision::CoolingDown { retry_after_ms } => {
                return Err(ChatError::RateLimited(RateLimitKind::CoolingDown {
                    retry_after_ms,
                }));
            }
            RateDecision::Tripped => {
                let until = self.auto_mute(sender, now).await;
                return Err(ChatError::RateLimited(RateLimitKind::AutoMuted { until }));
            }
        }

        Self::ensure_postable(&participant, now)?;

        let body = clean(body.trim());
        let reply_to = reply_to.map(|reply| self.reply_snapshot(reply));

        let (posted, append) = {
            let _order = self.delivery_lock();
            // Re-read so a ban or shadow-ban committed since the checks above applies here.
            let author = self.participant(sender)?;
            if author.banned {
                return Err(ChatError::Authorization("You are banned.".to_string()));
            }

            let message = Message {
                id: self.store.next_id(now),
                author_id: sender,
                author: author.name,
                body,
                role: author.role,
                color: author.color,
                edited: false,
                reply_to,
                created_at: now,
            };
            let event = ServerEvent::MessagePosted {
                message: message.clone(),
            };

            if author.shadow_banned {
                self.remember_shadowed(message.clone());
                self.broadcaster.send_to_participant(sender, &event);
                let posted = Posted {
                    message,
                    visibility: Visibility::Shadowed,
                };
                (posted, None)
            } else {
                self.store.append(message.clone());
                let append = self.journal.submit(HistoryWrite::Append(message.clone()));
                self.broadcaster.broadcast(&event);
                let posted = Posted {
                    message,
                    visibility: Visibility::Visible,
                };
                (posted, Some(append))
            }
        };

        metrics::counter!("chat_messages_total", 1, "visibility" => posted.visibility.as_str());
        tracing::debug!(
            participant = %sender,
            message_id = posted.message.id,
            visibility = posted.visibility.as_str(),
            "message accepted"
        );

        if let Some(append) = append {
            if let Err(err) = append.wait().await {
                tracing::warn!(message_id = posted.message.id, error = %err, "failed to persist message");
            }
        }
        Ok(posted)
    }

    /// Mute a sender who tripped the spam threshold. Returns the effective deadline.
    async fn auto_mute(&self, sender: ParticipantId, now: i64) -> i64 {
        let until = self.limiter.auto_mute_until(now);
        metrics::counter!("chat_auto_mutes_total", 1);

        match self.directory.extend_mute(sender, until).await {
            Ok(applied) => {
                tracing::info!(participant = %sender, until, "auto-muted for spamming");
                if applied.changed {
                    self.announce_to_staff(&applied.participant);
                }
                applied.participant.mute_until.unwrap_or(until)
            }
            Err(err) => {
                tracing::error!(participant = %sender, error = %err, "failed to apply auto-mute");
                until
            }
        }
    }

    fn remember_shadowed(&self, message: Message) {
        let cap = self.store.cap();
        let mut shadowed = self.shadowed();
        let own = shadowed.entry(message.author_id).or_default();
        own.push_back(message);
        while own.len() > cap {
            own.pop_front();
        }
    }

    fn edit_shadowed(&self, author: ParticipantId, id: MessageId, body: String) -> Option<Message> {
        let mut shadowed = self.shadowed();
        let message = shadowed.get_mut(&author)?.iter_mut().find(|m| m.id == id)?;
        message.body = body;
        message.edited = true;
        Some(message.clone())
    }

    fn forget_shadowed(&self, author: ParticipantId, id: MessageId) -> bool {
        let mut shadowed = self.shadowed();
        let Some(own) = shadowed.get_mut(&author) else {
            return false;
        };
        let before = own.len();
        own.retain(|m| m.id != id);
        own.len() != before
    }

    pub async fn edit_message(&self, actor: ParticipantId, id: MessageId, body: &str) -> Result<Message> {
        let now = self.clock.now_ms();
        let author = self.participant(actor)?;
        Self::ensure_postable(&author, now)?;
        self.validate_body(body)?;
        let body = clean(body.trim());

        let (edited, update) = {
            let _order = self.delivery_lock();
            match self.store.get(id) {
                Some(stored) if stored.author_id != actor => {
                    return Err(ChatError::Authorization(
                        "You can only edit your own messages.".to_string(),
                    ));
                }
                Some(_) => {
                    let message = self
                        .store
                        .edit(id, body)
                        .ok_or_else(|| ChatError::NotFound("message".to_string()))?;
                    let update = self.journal.submit(HistoryWrite::Update(message.clone()));
                    self.broadcaster.broadcast(&ServerEvent::MessageEdited {
                        message: message.clone(),
                    });
                    (message, update)
                }
                None => {
                    let message = self
                        .edit_shadowed(actor, id, body)
                        .ok_or_else(|| ChatError::NotFound("message".to_string()))?;
                    self.broadcaster.send_to_participant(
                        actor,
                        &ServerEvent::MessageEdited {
                            message: message.clone(),
                        },
                    );
                    return Ok(message);
                }
            }
        };

        if let Err(err) = update.wait().await {
            tracing::warn!(message_id = id, error = %err, "failed to persist edit");
        }
        Ok(edited)
    }

    pub async fn delete_own_message(&self, actor: ParticipantId, id: MessageId) -> Result<()> {
        self.participant(actor)?;
        match self.store.get(id) {
            Some(stored) if stored.author_id != actor => Err(ChatError::Authorization(
                "You can only delete your own messages.".to_string(),
            )),
            Some(_) => self.remove_message(id).await,
            None if self.forget_shadowed(actor, id) => {
                self.broadcaster
                    .send_to_participant(actor, &ServerEvent::MessageDeleted { id });
                Ok(())
            }
            None => Err(ChatError::NotFound("message".to_string())),
        }
    }

    /// Durable delete first, then the store and everyone's view.
    async fn remove_message(&self, id: MessageId) -> Result<()> {
        let delete = {
            let _order = self.delivery_lock();
            self.journal.submit(HistoryWrite::Delete(id))
        };
        delete.wait().await?;

        let _order = self.delivery_lock();
        self.store.remove(id);
        self.broadcaster
            .broadcast(&ServerEvent::MessageDeleted { id });
        Ok(())
    }

    pub async fn execute(&self, actor: ParticipantId, command: Command) -> Result<CommandOutcome> {
        let name = command.name();
        let target = command.target();
        let required = command.required_role();
        let outcome = match command {
            Command::Admin(command) => self.admin_command(actor, command).await,
            Command::Owner(command) => self.owner_command(actor, command).await,
        };

        match &outcome {
            Ok(result) => {
                metrics::counter!("chat_commands_total", 1, "command" => name);
                tracing::info!(
                    participant = %actor,
                    command = name,
                    target = ?target,
                    result = %result.summary(),
                    "command applied"
                );
            }
            Err(err) => {
                tracing::debug!(
                    participant = %actor,
                    command = name,
                    target = ?target,
                    required = %required,
                    error = %err,
                    "command rejected"
                );
            }
        }
        outcome
    }

    fn require_role(&self, actor: ParticipantId, required: Role) -> Result<Participant> {
        let participant = self.participant(actor)?;
        if participant.banned {
            return Err(ChatError::Authorization("You are banned.".to_string()));
        }
        if participant.role < required {
            return Err(ChatError::Authorization(
                "You do not have permission to do that.".to_string(),
            ));
        }
        Ok(participant)
    }

    /// Precondition for every participant-mutating command, evaluated against the target's
    /// committed record: the actor still holds `required` and strictly outranks the target.
    fn check_target(&self, actor: ParticipantId, required: Role, target: &Participant) -> Result<()> {
        self.require_role(actor, required)?;
        if actor == target.id {
            return Err(ChatError::Authorization(
                "You cannot moderate yourself.".to_string(),
            ));
        }
        if !self.directory.authorize_target(actor, target.id) {
            return Err(ChatError::Authorization(
                "You can only moderate participants below your role.".to_string(),
            ));
        }
        Ok(())
    }

    fn notify(&self, target: ParticipantId, text: String) {
        self.broadcaster
            .send_to_participant(target, &ServerEvent::PrivateNotice { text });
    }

    fn announce_to_staff(&self, participant: &Participant) {
        let staff = self.directory.ids_with_role_at_least(Role::Moderator);
        self.broadcaster.send_to_participants(
            &staff,
            &ServerEvent::ParticipantUpdated {
                participant: participant.staff_view(),
            },
        );
    }

    /// Public view for everyone, full view for staff.
    fn announce(&self, participant: &Participant) {
        let staff = self.directory.ids_with_role_at_least(Role::Moderator);
        self.broadcaster.broadcast_except(
            &staff,
            &ServerEvent::ParticipantUpdated {
                participant: participant.public_view(),
            },
        );
        self.broadcaster.send_to_participants(
            &staff,
            &ServerEvent::ParticipantUpdated {
                participant: participant.staff_view(),
            },
        );
    }

    pub async fn admin_command(&self, actor: ParticipantId, command: AdminCommand) -> Result<CommandOutcome> {
        let required = command.required_role();
        self.require_role(actor, required)?;

        let check = |target: &Participant| self.check_target(actor, required, target);

        let applied = match command {
            AdminCommand::Delete { message_id } => {
                if self.store.get(message_id).is_none() {
                    return Err(ChatError::NotFound("message".to_string()));
                }
                self.remove_message(message_id).await?;
                return Ok(CommandOutcome::MessageRemoved(message_id));
            }
            AdminCommand::Ban { target } => {
                let applied = self.directory.set_banned(target, true, check).await?;
                if applied.changed {
                    self.limiter.forget(target);
                    self.broadcaster.broadcast(&ServerEvent::ForceDisconnect {
                        target: Some(target),
                    });
                    self.announce_to_staff(&applied.participant);
                }
                applied
            }
            AdminCommand::Unban { target } => {
                let applied = self.directory.set_banned(target, false, check).await?;
                if applied.changed {
                    self.announce_to_staff(&applied.participant);
                    self.notify(target, "Your ban has been lifted.".to_string());
                }
                applied
            }
            AdminCommand::Mute { target, duration } => {
                let setting = match duration {
                    MuteDuration::Minutes(0) => {
                        return Err(ChatError::Validation(
                            "Mute duration must be at least one minute.".to_string(),
                        ));
                    }
                    MuteDuration::Minutes(minutes) => {
                        MuteSetting::Until(self.clock.now_ms() + i64::from(minutes) * 60_000)
                    }
                    MuteDuration::Permanent => MuteSetting::Permanent,
                };
                let applied = self.directory.set_mute(target, setting, check).await?;
                if applied.changed {
                    self.announce_to_staff(&applied.participant);
                    let until = applied.participant.mute_until.unwrap_or_default();
                    self.notify(target, format!("You have been muted until {}.", format_until(until)));
                }
                applied
            }
            AdminCommand::Unmute { target } => {
                let applied = self
                    .directory
                    .set_mute(target, MuteSetting::Clear, check)
                    .await?;
                if applied.changed {
                    self.announce_to_staff(&applied.participant);
                    self.notify(target, "You can post again.".to_string());
                }
                applied
            }
            AdminCommand::ShadowBan { target } | AdminCommand::UnshadowBan { target } => {
                let hidden = matches!(command, AdminCommand::ShadowBan { .. });
                let applied = self
                    .directory
                    .set_shadow_banned(target, hidden, check)
                    .await?;
                if applied.changed {
                    if !hidden {
                        // Posts made while hidden never become public.
                        self.shadowed().remove(&target);
                    }
                    self.announce_to_staff(&applied.participant);
                }
                applied
            }
        };

        Ok(CommandOutcome::Participant(applied.participant))
    }

    pub async fn owner_command(&self, actor: ParticipantId, command: OwnerCommand) -> Result<CommandOutcome> {
        self.require_role(actor, command.required_role())?;

        match command {
            OwnerCommand::Promote { target, role } => {
                if !matches!(role, Role::Moderator | Role::Admin) {
                    return Err(ChatError::Validation(
                        "Participants can only be promoted to MODERATOR or ADMIN.".to_string(),
                    ));
                }
                self.change_role(actor, target, role).await
            }
            OwnerCommand::Demote { target } => self.change_role(actor, target, Role::User).await,
            OwnerCommand::ClearAll => {
                let (clear, cleared_through) = {
                    let _order = self.delivery_lock();
                    (self.journal.submit(HistoryWrite::Clear), self.store.last_id())
                };
                clear.wait().await?;

                let late = {
                    let _order = self.delivery_lock();
                    // Posts accepted while the durable clear ran were appended after it.
                    let late: Vec<PendingWrite> = self
                        .store
                        .recent()
                        .iter()
                        .filter(|m| m.id > cleared_through)
                        .map(|m| self.journal.submit(HistoryWrite::Delete(m.id)))
                        .collect();
                    let dropped = self.store.clear();
                    self.shadowed().clear();
                    self.broadcaster.broadcast(&ServerEvent::HistoryCleared);
                    tracing::info!(dropped, "history cleared");
                    late
                };
                for delete in late {
                    if let Err(err) = delete.wait().await {
                        tracing::warn!(error = %err, "failed to delete a post made during clear");
                    }
                }
                Ok(CommandOutcome::HistoryCleared)
            }
            OwnerCommand::KickAll => {
                self.broadcaster
                    .broadcast(&ServerEvent::ForceDisconnect { target: None });
                Ok(CommandOutcome::Kicked)
            }
        }
    }

    async fn change_role(&self, actor: ParticipantId, target: ParticipantId, role: Role) -> Result<CommandOutcome> {
        let applied = self
            .directory
            .set_role(target, role, |current| {
                self.check_target(actor, Role::Owner, current)
            })
            .await?;
        if applied.changed {
            self.announce(&applied.participant);
        }
        Ok(CommandOutcome::Participant(applied.participant))
    }

    /// Drop idle rate-limit trackers.
    pub fn prune_rate_limits(&self) -> usize {
        self.limiter.prune(self.clock.now_ms())
    }
}
