//! Per-uid connection rate limiting.
//!
//! Fixed window per uid: each connection attempt counts against the window.
//! Exceeding `max_attempts` within one window bans the uid for `ban`.
//! Successful connections consume quota too, so valid attempts cannot be
//! interleaved with invalid ones to stay under the limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::{self, Clock};
use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy)]
struct RateLimitState {
    window_start: Instant,
    count: u32,
    banned_until: Option<Instant>,
    successes: u64,
}

pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    ban: Duration,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<u32, RateLimitState>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: config.max_attempts,
            window: config.window(),
            ban: config.ban(),
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one attempt for `uid` and reports whether it must be refused.
    pub fn is_rate_limited(&self, uid: u32) -> bool {
        let now = self.clock.now();
        let mut states = self.lock();
        let state = states.entry(uid).or_insert(RateLimitState {
            window_start: now,
            count: 0,
            banned_until: None,
            successes: 0,
        });

        if let Some(until) = state.banned_until {
            if now < until {
                return true;
            }
            state.banned_until = None;
        }

        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 1;
            return false;
        }

        state.count = state.count.saturating_add(1);
        if state.count > self.max_attempts {
            state.banned_until = Some(clock::deadline(now, self.ban));
            log::warn!(
                "ratelimit: uid {uid} exceeded {} attempts in {:?}, banned for {:?}",
                self.max_attempts,
                self.window,
                self.ban
            );
            return true;
        }
        false
    }

    /// Notes a successful admission. Does not refund the attempt.
    pub fn record_success(&self, uid: u32) {
        let mut states = self.lock();
        if let Some(state) = states.get_mut(&uid) {
            state.successes += 1;
            log::debug!(
                "ratelimit: uid {uid} admitted ({} total, {} of {} attempts used)",
                state.successes,
                state.count,
                self.max_attempts
            );
        }
    }

    /// Number of successful admissions recorded for `uid`.
    #[cfg(test)]
    pub fn successes(&self, uid: u32) -> u64 {
        self.lock().get(&uid).map_or(0, |s| s.successes)
    }

    /// Drops entries whose window and ban have both expired.
    pub fn prune(&self) {
        let now = self.clock.now();
        let window = self.window;
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, s| {
            let banned = s.banned_until.is_some_and(|until| now < until);
            banned || now.duration_since(s.window_start) < window
        });
        let removed = before - states.len();
        if removed > 0 {
            log::debug!("ratelimit: pruned {removed} idle entr(ies)");
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, RateLimitState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max: u32, window: u64, ban: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimitConfig {
            max_attempts: max,
            window_secs: window,
            ban_secs: ban,
        };
        (RateLimiter::new(&config, clock.clone()), clock)
    }

    #[test]
    fn second_attempt_over_limit_of_one_is_limited() {
        let (rl, _clock) = limiter(1, 60, 60);
        assert!(!rl.is_rate_limited(1234));
        assert!(rl.is_rate_limited(1234));
    }

    #[test]
    fn uids_are_tracked_independently() {
        let (rl, _clock) = limiter(1, 60, 60);
        assert!(!rl.is_rate_limited(1000));
        assert!(rl.is_rate_limited(1000));
        assert!(!rl.is_rate_limited(1001));
    }

    #[test]
    fn ban_holds_until_it_expires() {
        let (rl, clock) = limiter(2, 10, 60);
        assert!(!rl.is_rate_limited(7));
        assert!(!rl.is_rate_limited(7));
        assert!(rl.is_rate_limited(7));

        // Window elapsed but ban still active.
        clock.advance(Duration::from_secs(30));
        assert!(rl.is_rate_limited(7));

        clock.advance(Duration::from_secs(31));
        assert!(!rl.is_rate_limited(7));
    }

    #[test]
    fn window_rollover_resets_count() {
        let (rl, clock) = limiter(2, 10, 60);
        assert!(!rl.is_rate_limited(7));
        assert!(!rl.is_rate_limited(7));
        clock.advance(Duration::from_secs(10));
        assert!(!rl.is_rate_limited(7));
        assert!(!rl.is_rate_limited(7));
        assert!(rl.is_rate_limited(7));
    }

    #[test]
    fn success_does_not_refund_quota() {
        let (rl, _clock) = limiter(2, 60, 60);
        assert!(!rl.is_rate_limited(5));
        rl.record_success(5);
        assert!(!rl.is_rate_limited(5));
        rl.record_success(5);
        assert!(rl.is_rate_limited(5));
        assert_eq!(rl.successes(5), 2);
    }

    #[test]
    fn huge_ban_saturates_instead_of_panicking() {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimitConfig {
            max_attempts: 1,
            window_secs: 60,
            ban_secs: i64::MAX as u64,
        };
        let rl = RateLimiter::new(&config, clock.clone());
        assert!(!rl.is_rate_limited(1234));
        assert!(rl.is_rate_limited(1234));
        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert!(rl.is_rate_limited(1234));
    }

    #[test]
    fn prune_keeps_banned_and_active_entries() {
        let (rl, clock) = limiter(1, 10, 100);
        rl.is_rate_limited(1);
        rl.is_rate_limited(2);
        rl.is_rate_limited(2); // banned
        clock.advance(Duration::from_secs(20));
        rl.is_rate_limited(3);
        rl.prune();
        // uid 1 idle, uid 2 still banned, uid 3 fresh.
        assert_eq!(rl.tracked(), 2);
        assert!(rl.is_rate_limited(2));
    }
}
