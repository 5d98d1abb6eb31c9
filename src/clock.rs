use chrono::{DateTime, Utc};
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};
#[cfg(test)]
use std::sync::Arc;

/// `mute_until` value meaning "muted until an owner or moderator says otherwise".
pub const PERMANENT: i64 = i64::MAX;

/// Wall-clock source in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Human readable rendering of a mute deadline for notices.
pub fn format_until(until_ms: i64) -> String {
    if until_ms == PERMANENT {
        return "further notice".to_string();
    }
    match DateTime::<Utc>::from_timestamp_millis(until_ms) {
        Some(at) => at.format("%H:%M:%S UTC").to_string(),
        None => "further notice".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
        let shared = clock.clone();
        shared.advance(50);
        assert_eq!(clock.now_ms(), 1_300);
    }

    #[test]
    fn test_format_until() {
        assert_eq!(format_until(PERMANENT), "further notice");
        // 1970-01-01T01:02:03Z
        assert_eq!(format_until(3_723_000), "01:02:03 UTC");
    }
}
