use std::env;
use std::str::FromStr;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const INSECURE_SECRET: &str = "change-this-secret-in-production";

/// History cap bounds; values outside are clamped.
pub const MIN_HISTORY_CAP: usize = 50;
pub const MAX_HISTORY_CAP: usize = 200;

/// Spam detection and cooldown options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Length of the counting window.
    pub spam_interval_ms: i64,
    /// Attempts allowed inside one window; the next one trips the auto-mute.
    pub spam_threshold: u32,
    pub auto_mute_minutes: i64,
    /// Minimum gap between two accepted attempts. 0 disables the cooldown.
    pub cooldown_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            spam_interval_ms: 3_000,
            spam_threshold: 5,
            auto_mute_minutes: 10,
            cooldown_ms: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModerationConfig {
    pub history_cap: usize,
    pub max_body_chars: usize,
    /// Visible length of a quoted body inside a reply snapshot.
    pub reply_snippet_chars: usize,
    pub rate: RateLimitConfig,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            history_cap: MAX_HISTORY_CAP,
            max_body_chars: 300,
            reply_snippet_chars: 100,
            rate: RateLimitConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Redis,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StorageBackend::Redis),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub redis_url: String,
    pub server_secret: String,
    pub storage: StorageBackend,
    /// Take the client address from `X-Forwarded-For` (only behind a trusted proxy).
    pub trust_forwarded_for: bool,
    pub max_connections_per_origin: usize,
    /// Outbound queue depth per session before it is dropped as too slow.
    pub session_buffer: usize,
    pub auth_requests_per_minute: u32,
    pub moderation: ModerationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            server_secret: INSECURE_SECRET.to_string(),
            storage: StorageBackend::Redis,
            trust_forwarded_for: false,
            max_connections_per_origin: 5,
            session_buffer: 256,
            auth_requests_per_minute: 30,
            moderation: ModerationConfig::default(),
        }
    }
}

impl Config {
    /// Read configuration from the process environment (call `dotenvy::dotenv()` first).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let rate_defaults = defaults.moderation.rate;

        let server_secret = lookup("SERVER_SECRET").unwrap_or_else(|| {
            tracing::warn!("SERVER_SECRET not set, using an insecure default");
            defaults.server_secret.clone()
        });

        let history_cap = parse_or(&lookup, "CHAT_HISTORY_CAP", defaults.moderation.history_cap)
            .clamp(MIN_HISTORY_CAP, MAX_HISTORY_CAP);

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            server_secret,
            storage: parse_or(&lookup, "CHAT_STORAGE", defaults.storage),
            trust_forwarded_for: parse_or(&lookup, "TRUST_FORWARDED_FOR", defaults.trust_forwarded_for),
            max_connections_per_origin: parse_or(
                &lookup,
                "CHAT_MAX_CONNECTIONS_PER_ORIGIN",
                defaults.max_connections_per_origin,
            )
            .max(1),
            session_buffer: parse_or(&lookup, "CHAT_SESSION_BUFFER", defaults.session_buffer).max(1),
            auth_requests_per_minute: parse_or(
                &lookup,
                "CHAT_AUTH_REQUESTS_PER_MINUTE",
                defaults.auth_requests_per_minute,
            )
            .max(1),
            moderation: ModerationConfig {
                history_cap,
                max_body_chars: parse_or(&lookup, "CHAT_MAX_BODY_CHARS", defaults.moderation.max_body_chars)
                    .max(1),
                reply_snippet_chars: parse_or(
                    &lookup,
                    "CHAT_REPLY_SNIPPET_CHARS",
                    defaults.moderation.reply_snippet_chars,
                ),
                rate: RateLimitConfig {
                    spam_interval_ms: parse_or(&lookup, "CHAT_SPAM_INTERVAL_MS", rate_defaults.spam_interval_ms),
                    spam_threshold: parse_or(&lookup, "CHAT_SPAM_THRESHOLD", rate_defaults.spam_threshold),
                    auto_mute_minutes: parse_or(
                        &lookup,
                        "CHAT_AUTO_MUTE_MINUTES",
                        rate_defaults.auto_mute_minutes,
                    ),
                    cooldown_ms: parse_or(&lookup, "CHAT_COOLDOWN_MS", rate_defaults.cooldown_ms),
                },
            },
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "invalid configuration value, using default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.storage, StorageBackend::Redis);
        assert_eq!(config.moderation.rate, RateLimitConfig::default());
        assert_eq!(config.moderation.history_cap, 200);
        assert_eq!(config.moderation.max_body_chars, 300);
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let config = config_from(&[
            ("CHAT_STORAGE", "Memory"),
            ("CHAT_SPAM_THRESHOLD", "8"),
            ("CHAT_COOLDOWN_MS", "2500"),
            ("CHAT_AUTO_MUTE_MINUTES", "soon"),
            ("CHAT_HISTORY_CAP", "10000"),
            ("TRUST_FORWARDED_FOR", "true"),
        ]);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.moderation.rate.spam_threshold, 8);
        assert_eq!(config.moderation.rate.cooldown_ms, 2_500);
        assert_eq!(config.moderation.rate.auto_mute_minutes, 10);
        assert_eq!(config.moderation.history_cap, MAX_HISTORY_CAP);
        assert!(config.trust_forwarded_for);
    }

    #[test]
    fn test_history_cap_lower_clamp() {
        let config = config_from(&[("CHAT_HISTORY_CAP", "3")]);
        assert_eq!(config.moderation.history_cap, MIN_HISTORY_CAP);
    }
}
