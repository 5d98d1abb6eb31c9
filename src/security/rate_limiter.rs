use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::config::RateLimitConfig;
use crate::models::ParticipantId;

/// Outcome of one post attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Below the spam threshold but too soon after the previous accepted attempt.
    CoolingDown { retry_after_ms: i64 },
    /// Spam threshold exceeded inside the window. The caller applies the auto-mute.
    Tripped,
}

#[derive(Debug, Clone, Copy)]
struct Tracker {
    window_start: i64,
    count: u32,
    last_allowed: Option<i64>,
}

/// Per-sender fixed window counter with an optional per-post cooldown.
pub struct RateLimiter {
    config: RateLimitConfig,
    trackers: Mutex<HashMap<ParticipantId, Tracker>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Record a post attempt at `now` and decide whether it may proceed.
    ///
    /// Every attempt counts toward the spam window, including ones rejected by the cooldown.
    pub fn check(&self, sender: ParticipantId, now: i64) -> RateDecision {
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        let tracker = trackers.entry(sender).or_insert(Tracker {
            window_start: now,
            count: 0,
            last_allowed: None,
        });

        if now - tracker.window_start > self.config.spam_interval_ms {
            tracker.window_start = now;
            tracker.count = 1;
        } else {
            tracker.count = tracker.count.saturating_add(1);
        }

        if tracker.count > self.config.spam_threshold {
            return RateDecision::Tripped;
        }

        if self.config.cooldown_ms > 0 {
            if let Some(last) = tracker.last_allowed {
                let elapsed = now - last;
                if elapsed < self.config.cooldown_ms {
                    return RateDecision::CoolingDown {
                        retry_after_ms: self.config.cooldown_ms - elapsed,
                    };
                }
            }
        }

        tracker.last_allowed = Some(now);
        RateDecision::Allowed
    }

    /// Mute deadline for a trip happening at `now`.
    pub fn auto_mute_until(&self, now: i64) -> i64 {
        now.saturating_add(self.config.auto_mute_minutes.saturating_mul(60_000))
    }

    /// Drop trackers whose window and cooldown have both lapsed.
    pub fn prune(&self, now: i64) -> usize {
        let horizon = self.config.spam_interval_ms.max(self.config.cooldown_ms);
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = trackers.len();
        trackers.retain(|_, tracker| {
            let last_seen = tracker.last_allowed.unwrap_or(tracker.window_start).max(tracker.window_start);
            now - last_seen <= horizon
        });
        before - trackers.len()
    }

    pub fn forget(&self, sender: ParticipantId) {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(cooldown_ms: i64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            spam_interval_ms: 3_000,
            spam_threshold: 5,
            auto_mute_minutes: 10,
            cooldown_ms,
        })
    }

    #[test]
    fn test_sixth_post_in_window_trips() {
        let limiter = limiter(0);
        let who = ParticipantId::new();
        for i in 0..5 {
            assert_eq!(limiter.check(who, 1_000 + i * 100), RateDecision::Allowed, "post {}", i + 1);
        }
        assert_eq!(limiter.check(who, 1_500), RateDecision::Tripped);
    }

    #[test]
    fn test_window_reset_after_interval() {
        let limiter = limiter(0);
        let who = ParticipantId::new();
        for i in 0..5 {
            assert_eq!(limiter.check(who, i * 100), RateDecision::Allowed);
        }
        // Strictly more than the interval after the window opened.
        assert_eq!(limiter.check(who, 3_001), RateDecision::Allowed);
        for i in 0..4 {
            assert_eq!(limiter.check(who, 3_100 + i), RateDecision::Allowed);
        }
        assert_eq!(limiter.check(who, 3_200), RateDecision::Tripped);
    }

    #[test]
    fn test_boundary_is_still_inside_window() {
        let limiter = limiter(0);
        let who = ParticipantId::new();
        for _ in 0..5 {
            limiter.check(who, 0);
        }
        assert_eq!(limiter.check(who, 3_000), RateDecision::Tripped);
    }

    #[test]
    fn test_senders_are_independent() {
        let limiter = limiter(0);
        let noisy = ParticipantId::new();
        let quiet = ParticipantId::new();
        for _ in 0..6 {
            limiter.check(noisy, 0);
        }
        assert_eq!(limiter.check(quiet, 0), RateDecision::Allowed);
    }

    #[test]
    fn test_cooldown() {
        let limiter = limiter(2_000);
        let who = ParticipantId::new();
        assert_eq!(limiter.check(who, 0), RateDecision::Allowed);
        assert_eq!(
            limiter.check(who, 500),
            RateDecision::CoolingDown { retry_after_ms: 1_500 }
        );
        // Rejected attempt does not restart the cooldown.
        assert_eq!(limiter.check(who, 2_000), RateDecision::Allowed);
    }

    #[test]
    fn test_cooldown_rejections_still_count_as_spam() {
        let limiter = limiter(2_000);
        let who = ParticipantId::new();
        let decisions: Vec<_> = (0..6).map(|i| limiter.check(who, i * 10)).collect();
        assert_eq!(decisions[0], RateDecision::Allowed);
        assert!(matches!(decisions[1], RateDecision::CoolingDown { .. }));
        assert_eq!(decisions[5], RateDecision::Tripped);
    }

    #[test]
    fn test_auto_mute_deadline() {
        let limiter = limiter(0);
        assert_eq!(limiter.auto_mute_until(1_000), 1_000 + 600_000);
    }

    #[test]
    fn test_prune() {
        let limiter = limiter(0);
        let stale = ParticipantId::new();
        let fresh = ParticipantId::new();
        limiter.check(stale, 0);
        limiter.check(fresh, 9_000);
        assert_eq!(limiter.prune(10_000), 1);
        limiter.forget(fresh);
        assert_eq!(limiter.prune(10_000), 0);
    }
}
