#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimitConfig {
    pub fn mvp_v1() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 120,
        }
    }
}

/// Admission check keyed by caller and endpoint.
pub trait RateLimiter: Send + Sync {
    fn check(&self, caller: &str, endpoint: &'static str, now: Instant) -> Result<(), CoreError>;
}

/// Per-instance fixed-window counters. Not shared across processes.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(String, &'static str), (Instant, u32)>>,
}

impl FixedWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check(&self, caller: &str, endpoint: &'static str, now: Instant) -> Result<(), CoreError> {
        let mut windows = self.windows.lock();
        let slot = windows
            .entry((caller.to_string(), endpoint))
            .or_insert((now, 0));
        if now.saturating_duration_since(slot.0) >= self.config.window {
            *slot = (now, 0);
        }
        if slot.1 >= self.config.max_requests {
            return Err(CoreError::RateLimited);
        }
        slot.1 += 1;
        Ok(())
    }
}

/// Admits everything; for tests and trusted in-process callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedRateLimiter;

impl RateLimiter for UnlimitedRateLimiter {
    fn check(&self, _caller: &str, _endpoint: &'static str, _now: Instant) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32) -> FixedWindowRateLimiter {
        FixedWindowRateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(10),
            max_requests,
        })
    }

    #[test]
    fn at_rate_01_blocks_after_quota_and_resets_next_window() {
        let l = limiter(2);
        let t0 = Instant::now();
        assert!(l.check("bot_a", "verify", t0).is_ok());
        assert!(l.check("bot_a", "verify", t0).is_ok());
        assert_eq!(l.check("bot_a", "verify", t0), Err(CoreError::RateLimited));
        assert!(l
            .check("bot_a", "verify", t0 + Duration::from_secs(10))
            .is_ok());
    }

    #[test]
    fn at_rate_02_keys_are_independent() {
        let l = limiter(1);
        let t0 = Instant::now();
        assert!(l.check("bot_a", "verify", t0).is_ok());
        assert!(l.check("bot_a", "tasks_next", t0).is_ok());
        assert!(l.check("bot_b", "verify", t0).is_ok());
        assert!(l.check("bot_a", "verify", t0).is_err());
    }
}
