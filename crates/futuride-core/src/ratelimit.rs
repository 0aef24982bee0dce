//! Per-client request throttling

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Calls to `allow` between opportunistic sweeps of idle clients
const SWEEP_EVERY: u64 = 1024;

/// Admission control keyed by client identity.
///
/// Implementations must be safe to call from many tasks at once; a burst of
/// concurrent requests from one client admits at most the configured number.
pub trait RateLimiter: Send + Sync + Debug {
    /// Record a request and report whether it is admitted
    fn allow(&self, client_id: &str) -> bool;

    /// Drop clients with no requests inside the window
    fn sweep(&self);

    /// Number of clients currently tracked
    fn tracked_clients(&self) -> usize;

    /// Forget every client
    fn clear(&self);
}

#[derive(Debug, Default)]
struct Windows {
    clients: HashMap<String, VecDeque<Instant>>,
    calls: u64,
}

impl Windows {
    fn sweep(&mut self, now: Instant, window: Duration) {
        self.clients.retain(|_, stamps| {
            evict(stamps, now, window);
            !stamps.is_empty()
        });
    }
}

/// Sliding window over the last `window`, at most `max_requests` per client
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    state: Mutex<Windows>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(Windows::default()),
        }
    }

    /// [`RateLimiter::allow`] against an explicit clock
    pub fn allow_at(&self, client_id: &str, now: Instant) -> bool {
        let mut state = self.state.lock();

        state.calls = state.calls.wrapping_add(1);
        if state.calls % SWEEP_EVERY == 0 {
            state.sweep(now, self.window);
        }

        let stamps = state.clients.entry(client_id.to_owned()).or_default();
        evict(stamps, now, self.window);

        if stamps.len() >= self.max_requests {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// [`RateLimiter::sweep`] against an explicit clock
    pub fn sweep_at(&self, now: Instant) {
        let mut state = self.state.lock();
        let before = state.clients.len();
        state.sweep(now, self.window);
        let evicted = before - state.clients.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = state.clients.len(), "swept idle clients");
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn allow(&self, client_id: &str) -> bool {
        self.allow_at(client_id, Instant::now())
    }

    fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn tracked_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    fn clear(&self) {
        self.state.lock().clients.clear();
    }
}

/// Admits everything; used when rate limiting is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedLimiter;

impl RateLimiter for UnlimitedLimiter {
    fn allow(&self, _client_id: &str) -> bool {
        true
    }

    fn sweep(&self) {}

    fn tracked_clients(&self) -> usize {
        0
    }

    fn clear(&self) {}
}

/// Pop timestamps at or before `now - window`
fn evict(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = stamps.front() {
        if now.saturating_duration_since(oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn admits_up_to_the_limit() {
        let limiter = SlidingWindowLimiter::new(3, HOUR);
        let now = Instant::now();

        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn rejected_requests_do_not_extend_the_window() {
        let limiter = SlidingWindowLimiter::new(1, HOUR);
        let start = Instant::now();

        assert!(limiter.allow_at("a", start));
        assert!(!limiter.allow_at("a", start + Duration::from_secs(1800)));
        assert!(limiter.allow_at("a", start + HOUR));
    }

    #[test]
    fn window_slides() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.allow_at("a", start));
        assert!(limiter.allow_at("a", start + Duration::from_secs(5)));
        assert!(!limiter.allow_at("a", start + Duration::from_secs(9)));
        // first stamp expires, second is still live
        assert!(limiter.allow_at("a", start + Duration::from_secs(10)));
        assert!(!limiter.allow_at("a", start + Duration::from_secs(11)));
    }

    #[test]
    fn sweep_drops_idle_clients() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(10));
        let start = Instant::now();

        limiter.allow_at("idle", start);
        limiter.allow_at("busy", start + Duration::from_secs(8));
        assert_eq!(limiter.tracked_clients(), 2);

        limiter.sweep_at(start + Duration::from_secs(12));
        assert_eq!(limiter.tracked_clients(), 1);

        limiter.clear();
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn concurrent_burst_admits_exactly_the_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::new(50, HOUR));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter(|_| limiter.allow("burst")).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn unlimited_admits_everything() {
        let limiter = UnlimitedLimiter;
        assert!((0..10_000).all(|_| limiter.allow("a")));
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
