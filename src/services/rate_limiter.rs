use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter keyed by caller. Built once at startup
/// and shared through `AppState`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `key`. Returns the time until the window
    /// resets when the limit is already used up.
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> Result<(), Duration> {
        self.check_at(key, limit, window, Instant::now())
    }

    fn check_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> Result<(), Duration> {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        if entry.count >= limit {
            return Err(window.saturating_sub(now.duration_since(entry.started)));
        }

        entry.count += 1;
        Ok(())
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) < window);
        before - windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_resets_after_window() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(limiter.check_at("instance:1", 3, window, start).is_ok());
        }
        let retry = limiter
            .check_at("instance:1", 3, window, start + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(retry, Duration::from_secs(40));

        // Other keys are counted separately.
        assert!(limiter.check_at("instance:2", 3, window, start).is_ok());

        assert!(limiter
            .check_at("instance:1", 3, window, start + Duration::from_secs(61))
            .is_ok());
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("k", 0, Duration::from_secs(1)).is_err());
    }
}
