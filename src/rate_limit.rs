//! Per-identity sliding-window rate limiting with a cooldown penalty.
//!
//! Each identity may make `rpm` requests in any `window` span. The request
//! that would exceed it starts a cooldown of `cooldown` during which every
//! request is refused. Entering a cooldown clears the identity's window, so
//! the first request after the cooldown has elapsed is admitted.
//!
//! ```text
//! now < cooldown_until ──▶ Cooldown (wait = ⌈cooldown_until − now⌉)
//!        │ no
//!        ▼
//! prune window ─▶ len < rpm ──▶ Ok, record now
//!                    │ no
//!                    ▼
//!        cooldown_until = max(cooldown_until, now + cooldown)
//!        RateLimited (wait = ⌈cooldown_until − now⌉)
//! ```
//!
//! State is per identity behind its own mutex; the identity map is only
//! write-locked the first time an identity is seen. Entries are never
//! evicted, so memory grows with the number of distinct identities.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Monotonic time source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateReason {
    Ok,
    Cooldown,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole seconds until a retry can succeed; 0 when allowed.
    pub wait_seconds: u64,
    pub reason: RateReason,
}

impl RateDecision {
    fn ok() -> Self {
        Self {
            allowed: true,
            wait_seconds: 0,
            reason: RateReason::Ok,
        }
    }

    fn blocked(reason: RateReason, wait: Duration) -> Self {
        Self {
            allowed: false,
            wait_seconds: ceil_secs(wait),
            reason,
        }
    }
}

#[derive(Debug, Default)]
struct IdentityWindow {
    admitted: VecDeque<Duration>,
    cooldown_until: Option<Duration>,
}

pub struct RateLimiter {
    rpm: usize,
    window: Duration,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    identities: RwLock<HashMap<String, Arc<Mutex<IdentityWindow>>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            rpm: config.rpm,
            window: Duration::from_secs(config.window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            clock,
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// Decide whether `identity` may make a request now, recording it if so.
    pub fn is_allowed(&self, identity: &str) -> RateDecision {
        let slot = self.slot(identity);
        let mut state = slot.lock().unwrap_or_else(|p| p.into_inner());
        // Read under the lock so `admitted` stays in time order.
        let now = self.clock.now();

        if let Some(until) = state.cooldown_until {
            if now < until {
                return RateDecision::blocked(RateReason::Cooldown, until - now);
            }
        }

        while let Some(&oldest) = state.admitted.front() {
            if now.saturating_sub(oldest) >= self.window {
                state.admitted.pop_front();
            } else {
                break;
            }
        }

        if state.admitted.len() < self.rpm {
            state.admitted.push_back(now);
            return RateDecision::ok();
        }

        let until = state
            .cooldown_until
            .map_or(now + self.cooldown, |prev| prev.max(now + self.cooldown));
        state.cooldown_until = Some(until);
        state.admitted.clear();
        debug!(identity, cooldown_secs = self.cooldown.as_secs(), "rate limit exceeded");
        RateDecision::blocked(RateReason::RateLimited, until - now)
    }

    /// Number of identities with tracked state.
    pub fn tracked_identities(&self) -> usize {
        self.identities
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    fn slot(&self, identity: &str) -> Arc<Mutex<IdentityWindow>> {
        if let Some(slot) = self
            .identities
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(identity)
        {
            return Arc::clone(slot);
        }
        let mut map = self.identities.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(map.entry(identity.to_string()).or_default())
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: usize, window: u64, cooldown: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimitConfig {
            rpm,
            window_secs: window,
            cooldown_secs: cooldown,
        };
        (RateLimiter::new(&config, clock.clone()), clock)
    }

    #[test]
    fn test_request_over_limit_is_rate_limited() {
        let (rl, clock) = limiter(10, 60, 15);
        for _ in 0..10 {
            assert!(rl.is_allowed("alice").allowed);
            clock.advance(Duration::from_millis(100));
        }
        let decision = rl.is_allowed("alice");
        assert!(!decision.allowed);
        assert_eq!(decision.reason, RateReason::RateLimited);
        assert_eq!(decision.wait_seconds, 15);
    }

    #[test]
    fn test_cooldown_then_ok() {
        let (rl, clock) = limiter(2, 60, 15);
        assert!(rl.is_allowed("bob").allowed);
        assert!(rl.is_allowed("bob").allowed);
        assert_eq!(rl.is_allowed("bob").reason, RateReason::RateLimited);

        clock.advance(Duration::from_millis(5500));
        let during = rl.is_allowed("bob");
        assert_eq!(during.reason, RateReason::Cooldown);
        assert_eq!(during.wait_seconds, 10);

        clock.advance(Duration::from_millis(9500));
        assert_eq!(rl.is_allowed("bob").reason, RateReason::Ok);
    }

    #[test]
    fn test_cooldown_checks_do_not_extend_cooldown() {
        let (rl, clock) = limiter(1, 60, 10);
        assert!(rl.is_allowed("c").allowed);
        assert!(!rl.is_allowed("c").allowed);
        for _ in 0..9 {
            clock.advance(Duration::from_secs(1));
            assert_eq!(rl.is_allowed("c").reason, RateReason::Cooldown);
        }
        clock.advance(Duration::from_secs(1));
        assert!(rl.is_allowed("c").allowed);
    }

    #[test]
    fn test_window_slides() {
        let (rl, clock) = limiter(2, 10, 30);
        assert!(rl.is_allowed("d").allowed);
        clock.advance(Duration::from_secs(6));
        assert!(rl.is_allowed("d").allowed);
        clock.advance(Duration::from_secs(4));
        // The first request is now 10s old and has left the window.
        assert!(rl.is_allowed("d").allowed);
    }

    #[test]
    fn test_identities_are_independent() {
        let (rl, _clock) = limiter(1, 60, 15);
        assert!(rl.is_allowed("a").allowed);
        assert!(!rl.is_allowed("a").allowed);
        assert!(rl.is_allowed("b").allowed);
        assert_eq!(rl.tracked_identities(), 2);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::from_millis(3001)), 4);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }

    /// Every reading is strictly later than the one before.
    #[derive(Default)]
    struct TickingClock(Mutex<Duration>);

    impl Clock for TickingClock {
        fn now(&self) -> Duration {
            let mut now = self.0.lock().unwrap();
            *now += Duration::from_micros(1);
            *now
        }
    }

    #[test]
    fn test_concurrent_admissions_stay_in_time_order() {
        let config = RateLimitConfig {
            rpm: 10_000,
            window_secs: 60,
            cooldown_secs: 15,
        };
        let rl = Arc::new(RateLimiter::new(&config, Arc::new(TickingClock::default())));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        assert!(rl.is_allowed("shared").allowed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let slot = rl.slot("shared");
        let state = slot.lock().unwrap();
        assert_eq!(state.admitted.len(), 1_600);
        assert!(state.admitted.iter().zip(state.admitted.iter().skip(1)).all(|(a, b)| a < b));
    }
}
