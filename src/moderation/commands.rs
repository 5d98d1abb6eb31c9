use serde::{Deserialize, Serialize};

use crate::models::{MessageId, ParticipantId, Role};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteDuration {
    Minutes(u32),
    Permanent,
}

/// Commands available to moderators and admins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Remove any message. No hierarchy check against its author.
    Delete { message_id: MessageId },
    Ban { target: ParticipantId },
    Unban { target: ParticipantId },
    Mute { target: ParticipantId, duration: MuteDuration },
    Unmute { target: ParticipantId },
    #[serde(rename = "shadowban")]
    ShadowBan { target: ParticipantId },
    #[serde(rename = "unshadowban")]
    UnshadowBan { target: ParticipantId },
}

fn default_promotion() -> Role {
    Role::Admin
}

/// Commands reserved for the owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OwnerCommand {
    Promote {
        target: ParticipantId,
        #[serde(default = "default_promotion")]
        role: Role,
    },
    Demote { target: ParticipantId },
    ClearAll,
    KickAll,
}

/// Anything a session can send as `{"type": "command", "command": {...}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Admin(AdminCommand),
    Owner(OwnerCommand),
}

impl AdminCommand {
    pub fn required_role(&self) -> Role {
        match self {
            AdminCommand::Delete { .. } => Role::Admin,
            AdminCommand::Ban { .. } | AdminCommand::Unban { .. } => Role::Moderator,
            AdminCommand::Mute { .. } | AdminCommand::Unmute { .. } => Role::Moderator,
            AdminCommand::ShadowBan { .. } | AdminCommand::UnshadowBan { .. } => Role::Admin,
        }
    }

    /// Participant the command mutates; `None` for content-only commands.
    pub fn target(&self) -> Option<ParticipantId> {
        match self {
            AdminCommand::Delete { .. } => None,
            AdminCommand::Ban { target }
            | AdminCommand::Unban { target }
            | AdminCommand::Mute { target, .. }
            | AdminCommand::Unmute { target }
            | AdminCommand::ShadowBan { target }
            | AdminCommand::UnshadowBan { target } => Some(*target),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::Delete { .. } => "delete",
            AdminCommand::Ban { .. } => "ban",
            AdminCommand::Unban { .. } => "unban",
            AdminCommand::Mute { .. } => "mute",
            AdminCommand::Unmute { .. } => "unmute",
            AdminCommand::ShadowBan { .. } => "shadowban",
            AdminCommand::UnshadowBan { .. } => "unshadowban",
        }
    }
}

impl OwnerCommand {
    pub fn required_role(&self) -> Role {
        match self {
            OwnerCommand::Promote { .. }
            | OwnerCommand::Demote { .. }
            | OwnerCommand::ClearAll
            | OwnerCommand::KickAll => Role::Owner,
        }
    }

    pub fn target(&self) -> Option<ParticipantId> {
        match self {
            OwnerCommand::Promote { target, .. } | OwnerCommand::Demote { target } => Some(*target),
            OwnerCommand::ClearAll | OwnerCommand::KickAll => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OwnerCommand::Promote { .. } => "promote",
            OwnerCommand::Demote { .. } => "demote",
            OwnerCommand::ClearAll => "clear_all",
            OwnerCommand::KickAll => "kick_all",
        }
    }
}

impl Command {
    pub fn required_role(&self) -> Role {
        match self {
            Command::Admin(command) => command.required_role(),
            Command::Owner(command) => command.required_role(),
        }
    }

    pub fn target(&self) -> Option<ParticipantId> {
        match self {
            Command::Admin(command) => command.target(),
            Command::Owner(command) => command.target(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Admin(command) => command.name(),
            Command::Owner(command) => command.name(),
        }
    }
}
