use dashmap::DashMap;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::sleep;
use tracing::debug;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Scopes with no admission this recent are dropped by the sweep. Longer than
/// any window the proxy checks, so a swept scope held no live timestamps.
const IDLE_AFTER: Duration = Duration::from_secs(120);

/// Outcome of one `allow` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the oldest counted request leaves the window.
    pub reset_in_secs: u64,
}

/// Reported as `remaining` when rate limiting is switched off.
pub const UNLIMITED_REMAINING: u32 = 999;

/// Sliding-window request counter keyed by an arbitrary scope string
/// (`"api_key:<id>"` on the proxy path).
///
/// Each scope holds the timestamps of its admitted requests younger than the
/// window. Stale timestamps are evicted on the next check for that scope, and
/// scopes nobody has used for a while are swept by `start_cleanup_task`. The
/// DashMap shard lock held by `entry` serializes concurrent checks on the same
/// scope.
///
/// State is process-local and cleared on restart. It is flow control only,
/// never a billing source; a multi-replica deployment needs a shared store.
pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    enabled: bool,
}

impl SlidingWindowLimiter {
    pub fn new(enabled: bool) -> Self {
        Self {
            windows: DashMap::new(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn allow(&self, key: &str, max_requests: u32, window: Duration) -> RateDecision {
        self.allow_at(key, max_requests, window, Instant::now())
    }

    /// `allow` against an explicit clock reading.
    pub fn allow_at(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        if !self.enabled {
            return RateDecision {
                allowed: true,
                remaining: UNLIMITED_REMAINING,
                reset_in_secs: 0,
            };
        }

        let mut stamps = self.windows.entry(key.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= window)
        {
            stamps.pop_front();
        }

        let count = u32::try_from(stamps.len()).unwrap_or(u32::MAX);
        if count >= max_requests {
            let reset_in_secs = reset_after(&stamps, window, now);
            debug!(scope = key, count, max_requests, reset_in_secs, "rate window full");
            let empty = stamps.is_empty();
            // Release the shard lock before removing from the same map.
            drop(stamps);
            if empty {
                self.windows.remove_if(key, |_, stamps| stamps.is_empty());
            }
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_in_secs,
            };
        }

        stamps.push_back(now);
        RateDecision {
            allowed: true,
            remaining: max_requests - count - 1,
            reset_in_secs: reset_after(&stamps, window, now),
        }
    }
}

impl SlidingWindowLimiter {
    /// Number of scopes currently tracked.
    pub fn scopes(&self) -> usize {
        self.windows.len()
    }

    /// Drop every scope whose newest admission is at least `idle` old.
    /// Returns how many were removed.
    pub fn evict_idle_at(&self, idle: Duration, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < idle)
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(IDLE_AFTER, Instant::now())
    }

    /// Spawn the periodic idle-scope sweep.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(CLEANUP_INTERVAL).await;
                let evicted = limiter.evict_idle();
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.scopes(), "swept idle rate scopes");
                }
            }
        });
    }
}

fn reset_after(stamps: &VecDeque<Instant>, window: Duration, now: Instant) -> u64 {
    let Some(oldest) = stamps.front() else {
        return 0;
    };
    let left = window.saturating_sub(now.saturating_duration_since(*oldest));
    left.as_secs() + u64::from(left.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn fourth_call_in_window_is_rejected() {
        let limiter = SlidingWindowLimiter::new(true);
        let start = Instant::now();

        for i in 0..3u32 {
            let at = start + Duration::from_millis(100 * u64::from(i));
            let d = limiter.allow_at("api_key:1", 3, MINUTE, at);
            assert!(d.allowed);
            assert_eq!(d.remaining, 2 - i);
        }

        let d = limiter.allow_at("api_key:1", 3, MINUTE, start + Duration::from_millis(900));
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(d.reset_in_secs <= 60);
        assert!(d.reset_in_secs >= 59);
    }

    #[test]
    fn admits_again_once_window_passes() {
        let limiter = SlidingWindowLimiter::new(true);
        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.allow_at("k", 3, MINUTE, start).allowed);
        }
        assert!(!limiter.allow_at("k", 3, MINUTE, start + Duration::from_secs(30)).allowed);
        assert!(limiter.allow_at("k", 3, MINUTE, start + Duration::from_secs(61)).allowed);
    }

    #[test]
    fn scopes_are_independent() {
        let limiter = SlidingWindowLimiter::new(true);
        let now = Instant::now();
        assert!(limiter.allow_at("a", 1, MINUTE, now).allowed);
        assert!(!limiter.allow_at("a", 1, MINUTE, now).allowed);
        assert!(limiter.allow_at("b", 1, MINUTE, now).allowed);
    }

    #[test]
    fn rejected_calls_do_not_consume_slots() {
        let limiter = SlidingWindowLimiter::new(true);
        let start = Instant::now();
        assert!(limiter.allow_at("k", 1, MINUTE, start).allowed);
        for s in 1..10 {
            assert!(!limiter.allow_at("k", 1, MINUTE, start + Duration::from_secs(s)).allowed);
        }
        assert!(limiter.allow_at("k", 1, MINUTE, start + MINUTE).allowed);
    }

    #[test]
    fn idle_scopes_are_swept() {
        let limiter = SlidingWindowLimiter::new(true);
        let start = Instant::now();
        for id in 0..50 {
            assert!(limiter.allow_at(&format!("api_key:{id}"), 5, MINUTE, start).allowed);
        }
        assert!(limiter.allow_at("api_key:live", 5, MINUTE, start + Duration::from_secs(100)).allowed);
        assert_eq!(limiter.scopes(), 51);

        let evicted = limiter.evict_idle_at(IDLE_AFTER, start + Duration::from_secs(130));
        assert_eq!(evicted, 50);
        assert_eq!(limiter.scopes(), 1);

        // The surviving scope keeps its count.
        let d = limiter.allow_at("api_key:live", 5, MINUTE, start + Duration::from_secs(130));
        assert_eq!(d.remaining, 3);
    }

    #[test]
    fn zero_limit_leaves_no_empty_scope_behind() {
        let limiter = SlidingWindowLimiter::new(true);
        let now = Instant::now();
        for id in 0..10 {
            assert!(!limiter.allow_at(&format!("k{id}"), 0, MINUTE, now).allowed);
        }
        assert_eq!(limiter.scopes(), 0);
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = SlidingWindowLimiter::new(false);
        let now = Instant::now();
        for _ in 0..10 {
            let d = limiter.allow_at("k", 1, MINUTE, now);
            assert!(d.allowed);
            assert_eq!(d.remaining, UNLIMITED_REMAINING);
        }
    }

    #[test]
    fn concurrent_checks_never_overcount() {
        use std::sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        };

        let limiter = Arc::new(SlidingWindowLimiter::new(true));
        let admitted = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if limiter.allow("shared", 100, MINUTE).allowed {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::Relaxed), 100);
    }
}
