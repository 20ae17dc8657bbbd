//! Per-client request pacing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Minimum spacing between two admitted requests of one client.
    pub min_interval: Duration,
    /// Entries at least this old are dropped by [`RateLimiter::sweep`].
    pub stale_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The client must wait `retry_after` before its next request is admitted.
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Tracks the last admitted request time of every client.
pub struct RateLimiter {
    cfg: RateLimitConfig,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Admit `client` at `now` unless its previous admitted request was less
    /// than `min_interval` ago. Rejections leave the state untouched.
    pub fn try_admit(&self, client: &str, now: Instant) -> Admission {
        let mut last_seen = self.last_seen();
        let admission = self.admission(&last_seen, client, now);
        if admission.is_admitted() {
            last_seen.insert(client.to_string(), now);
        }
        admission
    }

    /// What `try_admit` would answer at `now`, without recording anything.
    pub fn check(&self, client: &str, now: Instant) -> Admission {
        self.admission(&self.last_seen(), client, now)
    }

    fn admission(
        &self,
        last_seen: &HashMap<String, Instant>,
        client: &str,
        now: Instant,
    ) -> Admission {
        match last_seen.get(client) {
            Some(last) => {
                let elapsed = now.saturating_duration_since(*last);
                if elapsed < self.cfg.min_interval {
                    Admission::Rejected {
                        retry_after: self.cfg.min_interval - elapsed,
                    }
                } else {
                    Admission::Admitted
                }
            }
            None => Admission::Admitted,
        }
    }

    /// Drop every client whose last admitted request is `stale_after` or older.
    /// Returns the number of evicted entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut last_seen = self.last_seen();
        let before = last_seen.len();
        let stale_after = self.cfg.stale_after;
        last_seen.retain(|_, last| now.saturating_duration_since(*last) < stale_after);
        before - last_seen.len()
    }

    pub fn active_client_count(&self) -> usize {
        self.last_seen().len()
    }

    fn last_seen(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_request_within_interval_is_rejected() {
        let limiter = RateLimiter::default();
        let t = Instant::now();
        assert_eq!(limiter.try_admit("10.0.0.1", t), Admission::Admitted);

        match limiter.try_admit("10.0.0.1", t + Duration::from_millis(50)) {
            Admission::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(50));
            }
            Admission::Admitted => panic!("request inside min interval was admitted"),
        }

        assert!(limiter
            .try_admit("10.0.0.1", t + Duration::from_millis(200))
            .is_admitted());
    }

    #[test]
    fn rejection_does_not_refresh_timestamp() {
        let limiter = RateLimiter::default();
        let t = Instant::now();
        limiter.try_admit("a", t);
        assert!(!limiter
            .try_admit("a", t + Duration::from_millis(90))
            .is_admitted());
        // measured from the admitted request at t, not the rejected one
        assert!(limiter
            .try_admit("a", t + Duration::from_millis(100))
            .is_admitted());
    }

    #[test]
    fn check_reports_without_recording() {
        let limiter = RateLimiter::default();
        let t = Instant::now();
        assert!(limiter.check("a", t).is_admitted());
        assert_eq!(limiter.active_client_count(), 0);

        limiter.try_admit("a", t);
        assert_eq!(
            limiter.check("a", t + Duration::from_millis(30)),
            Admission::Rejected {
                retry_after: Duration::from_millis(70)
            }
        );
        // a passing check does not consume the slot
        let later = t + Duration::from_millis(150);
        assert!(limiter.check("a", later).is_admitted());
        assert!(limiter.try_admit("a", later).is_admitted());
    }

    #[test]
    fn clients_are_limited_independently() {
        let limiter = RateLimiter::default();
        let t = Instant::now();
        assert!(limiter.try_admit("a", t).is_admitted());
        assert!(limiter.try_admit("b", t).is_admitted());
        assert_eq!(limiter.active_client_count(), 2);
    }

    #[test]
    fn sweep_evicts_only_stale_entries() {
        let limiter = RateLimiter::default();
        let base = Instant::now();
        let now = base + Duration::from_secs(120);
        limiter.try_admit("ancient", base);
        limiter.try_admit("exactly-stale", base + Duration::from_secs(60));
        limiter.try_admit("almost-stale", base + Duration::from_millis(60_001));
        limiter.try_admit("fresh", base + Duration::from_secs(119));

        assert_eq!(limiter.sweep(now), 2);
        assert_eq!(limiter.active_client_count(), 2);
        // idempotent
        assert_eq!(limiter.sweep(now), 0);

        // swept clients start over
        assert!(limiter.try_admit("ancient", now).is_admitted());
        assert_eq!(limiter.active_client_count(), 3);
    }

    #[test]
    fn zero_interval_admits_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            min_interval: Duration::ZERO,
            ..RateLimitConfig::default()
        });
        let t = Instant::now();
        assert!(limiter.try_admit("a", t).is_admitted());
        assert!(limiter.try_admit("a", t).is_admitted());
    }
}
