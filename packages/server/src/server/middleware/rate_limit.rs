//! Per-key rate limiting: a fixed-window counter that retains the current
//! and previous windows, bounding each API key to N requests per window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Details carried on a 429 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimited {
    pub limit: u32,
    pub window_seconds: u64,
    pub retry_after_seconds: u64,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    /// key -> (window index -> request count), last two windows kept.
    counters: Mutex<HashMap<String, HashMap<u64, u32>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> Result<(), RateLimited> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.check_at(key, now)
    }

    fn check_at(&self, key: &str, now_seconds: u64) -> Result<(), RateLimited> {
        let window_seconds = self.window.as_secs().max(1);
        let current_window = now_seconds / window_seconds;

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let windows = counters.entry(key.to_string()).or_default();

        // Keep only the current and previous window.
        windows.retain(|&window, _| window + 1 >= current_window);

        let count = windows.entry(current_window).or_insert(0);
        *count += 1;

        if *count > self.max_requests {
            return Err(RateLimited {
                limit: self.max_requests,
                window_seconds,
                retry_after_seconds: window_seconds,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hundredth_request_passes_hundred_first_is_limited() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60));

        for _ in 0..100 {
            assert!(limiter.check_at("key", 1_000).is_ok());
        }
        let err = limiter.check_at("key", 1_000).unwrap_err();
        assert_eq!(err.limit, 100);
        assert_eq!(err.retry_after_seconds, 60);
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check_at("a", 0).is_ok());
        assert!(limiter.check_at("b", 0).is_ok());
        assert!(limiter.check_at("a", 0).is_err());
    }

    #[test]
    fn a_new_window_resets_the_count() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check_at("key", 0).is_ok());
        assert!(limiter.check_at("key", 30).is_ok());
        assert!(limiter.check_at("key", 59).is_err());
        // Next window.
        assert!(limiter.check_at("key", 60).is_ok());
    }

    #[test]
    fn stale_windows_are_dropped() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check_at("key", 0).is_ok());
        assert!(limiter.check_at("key", 300).is_ok());

        let counters = limiter.counters.lock().unwrap();
        assert_eq!(counters["key"].len(), 1);
    }
}
