use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::clock::PERMANENT;
use crate::error::{ChatError, Result};
use crate::models::{Participant, ParticipantId, Role};
use crate::persistence::{ParticipantLookup, Repository};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuteSetting {
    Until(i64),
    Permanent,
    Clear,
}

/// A single field mutation of a participant record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Change {
    Banned(bool),
    ShadowBanned(bool),
    Mute(MuteSetting),
    /// Mute until at least this instant; an existing later deadline is kept.
    ExtendMute(i64),
    Role(Role),
}

impl Change {
    fn apply(self, mut participant: Participant) -> Participant {
        match self {
            Change::Banned(banned) => participant.banned = banned,
            Change::ShadowBanned(shadow_banned) => participant.shadow_banned = shadow_banned,
            Change::Mute(MuteSetting::Until(until)) => participant.mute_until = Some(until),
            Change::Mute(MuteSetting::Permanent) => participant.mute_until = Some(PERMANENT),
            Change::Mute(MuteSetting::Clear) => participant.mute_until = None,
            Change::ExtendMute(until) => {
                let current = participant.mute_until.unwrap_or(i64::MIN);
                participant.mute_until = Some(current.max(until));
            }
            Change::Role(role) => participant.role = role,
        }
        participant
    }
}

/// Result of a directory mutation.
#[derive(Clone, Debug)]
pub struct Applied {
    pub participant: Participant,
    /// False when the record already had the requested state.
    pub changed: bool,
}

#[derive(Default)]
struct Records {
    by_id: HashMap<ParticipantId, Participant>,
    /// Lowercased display name → id. Names are unique regardless of case.
    by_name: HashMap<String, ParticipantId>,
}

fn outranks(actor: Role, target: Role) -> bool {
    actor > target
}

/// Authoritative participant state.
///
/// Reads come from memory. Mutations take a per-record async lock, write the new record
/// durably, then publish it in memory, so concurrent commands against one participant apply
/// one after another and a failed write leaves nothing half-applied.
pub struct ParticipantDirectory {
    records: RwLock<Records>,
    record_locks: Mutex<HashMap<ParticipantId, Arc<tokio::sync::Mutex<()>>>>,
    registration: tokio::sync::Mutex<()>,
    repo: Arc<dyn Repository>,
}

impl ParticipantDirectory {
    /// Build the directory from every persisted participant.
    pub async fn load(repo: Arc<dyn Repository>) -> anyhow::Result<Self> {
        let mut records = Records::default();
        for participant in repo.list_participants().await? {
            records
                .by_name
                .insert(participant.name.to_lowercase(), participant.id);
            records.by_id.insert(participant.id, participant);
        }
        tracing::info!(participants = records.by_id.len(), "participant directory loaded");

        Ok(Self {
            records: RwLock::new(records),
            record_locks: Mutex::new(HashMap::new()),
            registration: tokio::sync::Mutex::new(()),
            repo,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_lock(&self, id: ParticipantId) -> Arc<tokio::sync::Mutex<()>> {
        self.record_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    /// Create a participant. The first registrant ever becomes OWNER, everyone after is USER.
    ///
    /// Registrations are serialized, so the "is this the first record" check and the insert
    /// are one atomic step; concurrent first registrations are ordered by lock acquisition.
    pub async fn register<F>(&self, name: &str, color: String, now: i64, credential: F) -> Result<Participant>
    where
        F: FnOnce(ParticipantId) -> String,
    {
        let _serialized = self.registration.lock().await;

        let (taken, first) = {
            let records = self.read();
            (
                records.by_name.contains_key(&name.to_lowercase()),
                records.by_id.is_empty(),
            )
        };
        // Storage may hold names written by an earlier process that this one never loaded
        let stored = !taken
            && self
                .repo
                .find_participant(ParticipantLookup::Name(name))
                .await?
                .is_some();
        if taken || stored {
            return Err(ChatError::Conflict("That name is already taken.".to_string()));
        }

        let id = ParticipantId::new();
        let participant = Participant {
            id,
            name: name.to_string(),
            credential: credential(id),
            role: if first { Role::Owner } else { Role::User },
            banned: false,
            shadow_banned: false,
            mute_until: None,
            color,
            created_at: now,
        };

        self.repo.upsert_participant(&participant).await?;

        let mut records = self.write();
        records.by_name.insert(name.to_lowercase(), id);
        records.by_id.insert(id, participant.clone());
        tracing::info!(participant = %id, role = %participant.role, "participant registered");
        Ok(participant)
    }

    pub fn get(&self, id: ParticipantId) -> Option<Participant> {
        self.read().by_id.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Participant> {
        let records = self.read();
        records
            .by_name
            .get(&name.to_lowercase())
            .and_then(|id| records.by_id.get(id))
            .cloned()
    }

    /// `role(actor) > role(target)`; unknown ids are denied.
    pub fn authorize_target(&self, actor: ParticipantId, target: ParticipantId) -> bool {
        let records = self.read();
        match (records.by_id.get(&actor), records.by_id.get(&target)) {
            (Some(actor), Some(target)) => outranks(actor.role, target.role),
            _ => false,
        }
    }

    /// Everyone at or above `role`.
    pub fn ids_with_role_at_least(&self, role: Role) -> HashSet<ParticipantId> {
        self.read()
            .by_id
            .values()
            .filter(|p| p.role >= role)
            .map(|p| p.id)
            .collect()
    }

    /// Apply `change` to `target` if `precondition` accepts its current committed state.
    ///
    /// Idempotent: when the record already has the requested state nothing is written.
    async fn apply<F>(&self, target: ParticipantId, precondition: F, change: Change) -> Result<Applied>
    where
        F: FnOnce(&Participant) -> Result<()>,
    {
        let lock = self.record_lock(target);
        let _guard = lock.lock().await;

        let current = self
            .get(target)
            .ok_or_else(|| ChatError::NotFound("participant".to_string()))?;
        precondition(&current)?;

        let updated = change.apply(current.clone());
        if updated == current {
            return Ok(Applied {
                participant: current,
                changed: false,
            });
        }

        self.repo.upsert_participant(&updated).await?;
        self.write().by_id.insert(target, updated.clone());

        Ok(Applied {
            participant: updated,
            changed: true,
        })
    }

    pub async fn set_banned<F>(&self, target: ParticipantId, banned: bool, precondition: F) -> Result<Applied>
    where
        F: FnOnce(&Participant) -> Result<()>,
    {
        self.apply(target, precondition, Change::Banned(banned)).await
    }

    pub async fn set_shadow_banned<F>(
        &self,
        target: ParticipantId,
        shadow_banned: bool,
        precondition: F,
    ) -> Result<Applied>
    where
        F: FnOnce(&Participant) -> Result<()>,
    {
        self.apply(target, precondition, Change::ShadowBanned(shadow_banned))
            .await
    }

    pub async fn set_mute<F>(&self, target: ParticipantId, setting: MuteSetting, precondition: F) -> Result<Applied>
    where
        F: FnOnce(&Participant) -> Result<()>,
    {
        self.apply(target, precondition, Change::Mute(setting)).await
    }

    /// Mute until at least `until`. Used for automatic mutes, which never shorten a longer one.
    pub async fn extend_mute(&self, target: ParticipantId, until: i64) -> Result<Applied> {
        self.apply(target, |_| Ok(()), Change::ExtendMute(until)).await
    }

    pub async fn set_role<F>(&self, target: ParticipantId, role: Role, precondition: F) -> Result<Applied>
    where
        F: FnOnce(&Participant) -> Result<()>,
    {
        self.apply(target, precondition, Change::Role(role)).await
    }
}
