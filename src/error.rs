use thiserror::Error;

/// Why a post was throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    /// Posted again before the per-post cooldown elapsed.
    CoolingDown { retry_after_ms: i64 },
    /// Spam threshold tripped; the sender is now muted until `until` (epoch ms).
    AutoMuted { until: i64 },
}

/// Every failure the moderation core can produce.
///
/// None of these are ever broadcast. The session that triggered the operation gets
/// [`ChatError::notice`] as a private notice and everyone else sees nothing.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Malformed or oversized input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Insufficient role, self-targeting, or an active ban/mute.
    #[error("unauthorized: {0}")]
    Authorization(String),

    #[error("rate limited: {0:?}")]
    RateLimited(RateLimitKind),

    /// Unknown message or participant id.
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate display name at registration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The durable write behind a critical mutation failed; nothing was applied.
    #[error("storage failure: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl ChatError {
    /// Text shown to the originating session only.
    pub fn notice(&self) -> String {
        match self {
            ChatError::Validation(reason) => reason.clone(),
            ChatError::Authorization(reason) => reason.clone(),
            ChatError::RateLimited(RateLimitKind::CoolingDown { retry_after_ms }) => {
                let seconds = (retry_after_ms + 999) / 1000;
                format!("You are posting too fast. Try again in {}s.", seconds.max(1))
            }
            ChatError::RateLimited(RateLimitKind::AutoMuted { until }) => format!(
                "Too many messages in a short time. You are muted until {}.",
                crate::clock::format_until(*until)
            ),
            ChatError::NotFound(what) => format!("{} not found", what),
            ChatError::Conflict(reason) => reason.clone(),
            ChatError::Persistence(_) => "Temporary storage problem, please retry.".to_string(),
        }
    }

    /// Stable label used for the rejection counter.
    pub fn reason_label(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Authorization(_) => "authorization",
            ChatError::RateLimited(RateLimitKind::CoolingDown { .. }) => "cooldown",
            ChatError::RateLimited(RateLimitKind::AutoMuted { .. }) => "auto_mute",
            ChatError::NotFound(_) => "not_found",
            ChatError::Conflict(_) => "conflict",
            ChatError::Persistence(_) => "persistence",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
