//! Shared cooldown clock between the threshold monitor, the orchestrator,
//! and the HTTP adapter.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Last-writer-wins cooldown state. A committed improvement cycle starts
/// the full cooldown; a failed cycle starts the shorter retry cooldown so
/// the system can try again sooner.
pub struct CooldownClock {
    /// Unix seconds of the last cycle commit; 0 = never
    last_cycle: AtomicI64,
    last_failed: AtomicBool,
    cooldown: Duration,
    retry_cooldown: Duration,
}

impl CooldownClock {
    pub fn new(cooldown: Duration, retry_cooldown: Duration) -> Self {
        Self {
            last_cycle: AtomicI64::new(0),
            last_failed: AtomicBool::new(false),
            cooldown,
            retry_cooldown,
        }
    }

    fn active_cooldown(&self) -> Duration {
        if self.last_failed.load(Ordering::Relaxed) {
            self.retry_cooldown
        } else {
            self.cooldown
        }
    }

    /// Whether a new cycle may be triggered.
    pub fn ready(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Time left until the next cycle may be triggered.
    pub fn remaining(&self) -> Duration {
        let last = self.last_cycle.load(Ordering::Relaxed);
        if last == 0 {
            return Duration::ZERO;
        }
        let elapsed = (Utc::now().timestamp() - last).max(0) as u64;
        let cooldown = self.active_cooldown().as_secs();
        Duration::from_secs(cooldown.saturating_sub(elapsed))
    }

    /// Record a cycle commit. `success` selects the full or retry cooldown
    /// for the next window.
    pub fn mark_cycle(&self, success: bool) {
        self.last_cycle.store(Utc::now().timestamp(), Ordering::Relaxed);
        self.last_failed.store(!success, Ordering::Relaxed);
    }

    /// Unix seconds of the last commit, 0 if none yet.
    pub fn last_cycle_at(&self) -> i64 {
        self.last_cycle.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_clock_is_ready() {
        let clock = CooldownClock::new(Duration::from_secs(3600), Duration::from_secs(300));
        assert!(clock.ready());
        assert_eq!(clock.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_commit_starts_cooldown() {
        let clock = CooldownClock::new(Duration::from_secs(3600), Duration::from_secs(300));
        clock.mark_cycle(true);
        assert!(!clock.ready());
        let remaining = clock.remaining();
        assert!(remaining > Duration::from_secs(3590));
        assert!(remaining <= Duration::from_secs(3600));
    }

    #[test]
    fn test_failed_cycle_uses_retry_cooldown() {
        let clock = CooldownClock::new(Duration::from_secs(3600), Duration::from_secs(300));
        clock.mark_cycle(false);
        let remaining = clock.remaining();
        assert!(remaining <= Duration::from_secs(300));
        assert!(remaining > Duration::from_secs(290));
    }

    #[test]
    fn test_zero_cooldown_is_always_ready() {
        let clock = CooldownClock::new(Duration::ZERO, Duration::ZERO);
        clock.mark_cycle(true);
        assert!(clock.ready());
    }
}
