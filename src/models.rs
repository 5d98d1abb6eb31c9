use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::moderation::commands::Command;

/// Message ids are epoch milliseconds, bumped past the previous id on collisions.
pub type MessageId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Privilege tiers, ordered from least to most privileged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User = 0,
    Moderator = 1,
    Admin = 2,
    Owner = 3,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::User => "USER",
            Role::Moderator => "MODERATOR",
            Role::Admin => "ADMIN",
            Role::Owner => "OWNER",
        };
        f.write_str(name)
    }
}

/// Authoritative participant record. Serialized as-is only for persistence; anything sent to
/// sessions goes through [`ParticipantView`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub credential: String,
    pub role: Role,
    pub banned: bool,
    pub shadow_banned: bool,
    /// Epoch ms; `None` = not muted, [`crate::clock::PERMANENT`] = muted indefinitely.
    pub mute_until: Option<i64>,
    pub color: String,
    pub created_at: i64,
}

impl Participant {
    pub fn is_muted(&self, now: i64) -> bool {
        matches!(self.mute_until, Some(until) if until > now)
    }

    /// The single place mute expiry is evaluated. A mute ending exactly at `now` has expired.
    pub fn is_postable(&self, now: i64) -> bool {
        !self.banned && !self.is_muted(now)
    }

    /// What every session may know about this participant.
    pub fn public_view(&self) -> ParticipantView {
        ParticipantView {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            color: self.color.clone(),
            banned: self.banned,
            mute_until: self.mute_until,
            shadow_banned: None,
        }
    }

    /// Full moderation state, delivered to MODERATOR+ sessions only.
    pub fn staff_view(&self) -> ParticipantView {
        ParticipantView {
            shadow_banned: Some(self.shadow_banned),
            ..self.public_view()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub color: String,
    pub banned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_banned: Option<bool>,
}

/// Frozen copy of a quoted message. Never re-read from the live record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub id: MessageId,
    pub author: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author_id: ParticipantId,
    pub author: String,
    pub body: String,
    pub role: Role,
    pub color: String,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
    pub created_at: i64,
}

/// Reply target as supplied by the client. Author and body are untrusted.
#[derive(Clone, Debug, Deserialize)]
pub struct ReplyRequest {
    pub id: MessageId,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub body: String,
}

/// Frames a session may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Submit {
        body: String,
        #[serde(default)]
        reply_to: Option<ReplyRequest>,
    },
    Edit {
        message_id: MessageId,
        body: String,
    },
    DeleteOwn {
        message_id: MessageId,
    },
    Command {
        command: Command,
    },
}

/// Frames the server pushes to sessions.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionReady {
        participant: Option<ParticipantView>,
    },
    LoadHistory {
        messages: Vec<Message>,
    },
    MessagePosted {
        message: Message,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        id: MessageId,
    },
    HistoryCleared,
    ParticipantUpdated {
        participant: ParticipantView,
    },
    /// `target: None` disconnects everyone.
    ForceDisconnect {
        target: Option<ParticipantId>,
    },
    OnlineCount {
        count: usize,
    },
    PrivateNotice {
        text: String,
    },
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub secret: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub name: String,
    pub secret: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub banned: bool,
    pub color: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::PERMANENT;
    use crate::moderation::commands::OwnerCommand;

    fn participant() -> Participant {
        Participant {
            id: ParticipantId::new(),
            name: "alice".to_string(),
            credential: "digest".to_string(),
            role: Role::User,
            banned: false,
            shadow_banned: true,
            mute_until: None,
            color: "#123456".to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn test_role_order() {
        assert!(Role::User < Role::Moderator);
        assert!(Role::Moderator < Role::Admin);
        assert!(Role::Admin < Role::Owner);
    }

    #[test]
    fn test_postable_mute_boundary() {
        let mut p = participant();
        assert!(p.is_postable(1_000));

        p.mute_until = Some(1_000);
        assert!(p.is_postable(1_000), "a mute ending now has expired");
        assert!(!p.is_postable(999));

        p.mute_until = Some(PERMANENT);
        assert!(!p.is_postable(i64::MAX - 1));

        p.mute_until = None;
        p.banned = true;
        assert!(!p.is_postable(1_000));
    }

    #[test]
    fn test_public_view_hides_shadow_ban() {
        let p = participant();
        let public = serde_json::to_value(p.public_view()).unwrap();
        assert!(public.get("shadow_banned").is_none());
        assert!(public.get("credential").is_none());

        let staff = serde_json::to_value(p.staff_view()).unwrap();
        assert_eq!(staff["shadow_banned"], true);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(ServerEvent::OnlineCount { count: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "online_count", "count": 3}));

        let cleared = serde_json::to_value(ServerEvent::HistoryCleared).unwrap();
        assert_eq!(cleared, serde_json::json!({"type": "history_cleared"}));
    }

    #[test]
    fn test_client_event_parsing() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"submit","body":"hi","reply_to":{"id":42,"author":"bob","body":"yo"}}"#,
        )
        .unwrap();
        match event {
            ClientEvent::Submit { body, reply_to } => {
                assert_eq!(body, "hi");
                assert_eq!(reply_to.map(|r| r.id), Some(42));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"command","command":{"kind":"clear_all"}}"#).unwrap();
        assert!(matches!(
            event,
            ClientEvent::Command {
                command: Command::Owner(OwnerCommand::ClearAll)
            }
        ));
    }
}
