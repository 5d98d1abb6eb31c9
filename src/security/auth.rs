use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ChatError;
use crate::models::{Participant, ParticipantId};
use crate::moderation::ModerationEngine;

pub const MAX_NAME_CHARS: usize = 15;
const MIN_SECRET_CHARS: usize = 4;
const MAX_SECRET_CHARS: usize = 128;

static NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    // ASCII letters and digits, hiragana, katakana, CJK ideographs, '-' and '_'
    Regex::new(r"^[a-zA-Z0-9ぁ-んァ-ヶー一-龠\-_]+$").unwrap()
});

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{0}")]
    InvalidInput(String),

    /// Same answer for an unknown name and a wrong secret.
    #[error("invalid name or secret")]
    InvalidCredentials,

    #[error("account is banned")]
    Banned,

    #[error("unknown session token")]
    UnknownToken,

    #[error(transparent)]
    Chat(#[from] ChatError),
}

/// Live bearer tokens, at most one per participant.
#[derive(Default)]
struct Tokens {
    by_token: HashMap<String, ParticipantId>,
    by_participant: HashMap<ParticipantId, String>,
}

impl Tokens {
    fn issue(&mut self, id: ParticipantId, token: String) {
        if let Some(previous) = self.by_participant.insert(id, token.clone()) {
            self.by_token.remove(&previous);
        }
        self.by_token.insert(token, id);
    }

    fn revoke(&mut self, id: ParticipantId) -> bool {
        match self.by_participant.remove(&id) {
            Some(token) => {
                self.by_token.remove(&token);
                true
            }
            None => false,
        }
    }
}

/// Accounts and bearer tokens.
///
/// Tokens are random and live in memory only, so a restart signs everyone out. A new login
/// replaces the participant's previous token.
pub struct AuthService {
    engine: Arc<ModerationEngine>,
    server_secret: String,
    tokens: RwLock<Tokens>,
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Display colour derived from the name, `#rrggbb`.
pub fn name_color(name: &str) -> String {
    format!("#{}", &sha256_hex(name)[..6])
}

fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn validate_name(name: &str) -> Result<(), AuthError> {
    if name.is_empty() {
        return Err(AuthError::InvalidInput("Name cannot be empty.".to_string()));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(AuthError::InvalidInput(format!(
            "Name must be at most {} characters.",
            MAX_NAME_CHARS
        )));
    }
    if !NAME_REGEX.is_match(name) {
        return Err(AuthError::InvalidInput(
            "Name may only contain letters, digits, '-' and '_'.".to_string(),
        ));
    }
    Ok(())
}

fn validate_secret(secret: &str) -> Result<(), AuthError> {
    let len = secret.chars().count();
    if !(MIN_SECRET_CHARS..=MAX_SECRET_CHARS).contains(&len) {
        return Err(AuthError::InvalidInput(format!(
            "Secret must be between {} and {} characters.",
            MIN_SECRET_CHARS, MAX_SECRET_CHARS
        )));
    }
    Ok(())
}

impl AuthService {
    pub fn new(engine: Arc<ModerationEngine>, server_secret: String) -> Self {
        Self {
            engine,
            server_secret,
            tokens: RwLock::new(Tokens::default()),
        }
    }

    fn credential(&self, id: ParticipantId, secret: &str) -> String {
        sha256_hex(&format!("{}:{}:{}", id, secret, self.server_secret))
    }

    fn tokens(&self) -> RwLockWriteGuard<'_, Tokens> {
        self.tokens.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue_token(&self, id: ParticipantId) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens().issue(id, token.clone());
        token
    }

    pub async fn register(&self, name: &str, secret: &str) -> Result<(Participant, String), AuthError> {
        let name = name.trim();
        validate_name(name)?;
        validate_secret(secret)?;

        let participant = self
            .engine
            .directory()
            .register(name, name_color(name), self.engine.now_ms(), |id| {
                self.credential(id, secret)
            })
            .await?;
        let token = self.issue_token(participant.id);
        Ok((participant, token))
    }

    pub fn login(&self, name: &str, secret: &str) -> Result<(Participant, String), AuthError> {
        let participant = self
            .engine
            .directory()
            .find_by_name(name.trim())
            .ok_or(AuthError::InvalidCredentials)?;

        if !digests_match(&participant.credential, &self.credential(participant.id, secret)) {
            return Err(AuthError::InvalidCredentials);
        }
        if participant.banned {
            return Err(AuthError::Banned);
        }

        let token = self.issue_token(participant.id);
        tracing::debug!(participant = %participant.id, "login");
        Ok((participant, token))
    }

    /// Current record behind a bearer token. A banned participant's token is revoked here.
    pub fn resolve(&self, token: &str) -> Result<Participant, AuthError> {
        let id = self
            .tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_token
            .get(token)
            .copied()
            .ok_or(AuthError::UnknownToken)?;
        let participant = self
            .engine
            .directory()
            .get(id)
            .ok_or(AuthError::UnknownToken)?;
        if participant.banned {
            self.tokens().revoke(id);
            return Err(AuthError::Banned);
        }
        Ok(participant)
    }

    /// Drop tokens held by banned or unknown participants. Returns how many went.
    pub fn prune_tokens(&self) -> usize {
        let directory = self.engine.directory();
        let mut tokens = self.tokens();
        let stale: Vec<ParticipantId> = tokens
            .by_participant
            .keys()
            .filter(|id| directory.get(**id).map_or(true, |p| p.banned))
            .copied()
            .collect();
        stale.into_iter().filter(|id| tokens.revoke(*id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ModerationConfig;
    use crate::delivery::{Broadcaster, SessionRegistry};
    use crate::models::Role;
    use crate::persistence::MemoryRepository;

    async fn service() -> AuthService {
        let engine = ModerationEngine::load(
            ModerationConfig::default(),
            Arc::new(ManualClock::new(0)),
            Arc::new(MemoryRepository::new()),
            Broadcaster::new(Arc::new(SessionRegistry::new(5, 16))),
        )
        .await
        .unwrap();
        AuthService::new(Arc::new(engine), "server-secret".to_string())
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("alice_01").is_ok());
        assert!(validate_name("たろう").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("sixteen_chars_xx").is_err());
        assert!(validate_name("<script>").is_err());
        assert!(validate_name("two words").is_err());
    }

    #[test]
    fn test_name_color_is_deterministic() {
        let color = name_color("alice");
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert_eq!(color, name_color("alice"));
    }

    #[tokio::test]
    async fn test_register_login_resolve() {
        let auth = service().await;
        let (owner, token) = auth.register("owner", "hunter22").await.unwrap();
        assert_eq!(owner.role, Role::Owner);
        assert_ne!(owner.credential, "hunter22");
        assert_eq!(auth.resolve(&token).unwrap().id, owner.id);

        let (again, second_token) = auth.login("owner", "hunter22").unwrap();
        assert_eq!(again.id, owner.id);
        assert_ne!(token, second_token);

        assert!(matches!(
            auth.login("owner", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("nobody", "hunter22"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(auth.resolve("nope"), Err(AuthError::UnknownToken)));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_short_secrets() {
        let auth = service().await;
        auth.register("alice", "secret").await.unwrap();
        assert!(matches!(
            auth.register("alice", "secret").await,
            Err(AuthError::Chat(ChatError::Conflict(_)))
        ));
        assert!(matches!(
            auth.register("bob", "abc").await,
            Err(AuthError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_banned_accounts_cannot_log_in() {
        let auth = service().await;
        auth.register("owner", "secret").await.unwrap();
        let (user, token) = auth.register("user", "secret").await.unwrap();
        auth.engine.directory().set_banned(user.id, true, |_| Ok(())).await.unwrap();
        assert!(matches!(auth.login("user", "secret"), Err(AuthError::Banned)));

        assert!(matches!(auth.resolve(&token), Err(AuthError::Banned)));
        assert!(matches!(auth.resolve(&token), Err(AuthError::UnknownToken)));
    }

    #[tokio::test]
    async fn test_login_replaces_previous_token() {
        let auth = service().await;
        let (owner, first) = auth.register("owner", "secret").await.unwrap();
        let last = (0..10)
            .map(|_| auth.login("owner", "secret").unwrap().1)
            .last()
            .unwrap();

        let tokens = auth.tokens.read().unwrap();
        assert_eq!(tokens.by_token.len(), 1);
        assert_eq!(tokens.by_participant.len(), 1);
        drop(tokens);
        assert!(matches!(auth.resolve(&first), Err(AuthError::UnknownToken)));
        assert_eq!(auth.resolve(&last).unwrap().id, owner.id);
    }

    #[tokio::test]
    async fn test_prune_drops_banned_tokens() {
        let auth = service().await;
        let (_, owner_token) = auth.register("owner", "secret").await.unwrap();
        let (user, _) = auth.register("user", "secret").await.unwrap();
        auth.engine.directory().set_banned(user.id, true, |_| Ok(())).await.unwrap();

        assert_eq!(auth.prune_tokens(), 1);
        assert_eq!(auth.prune_tokens(), 0);
        assert!(auth.resolve(&owner_token).is_ok());
    }
}
