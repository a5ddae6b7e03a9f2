//! Fixed-window rate limiting keyed by (endpoint, principal).
//!
//! Each key owns an independent window of `interval` seconds admitting at
//! most `max` requests; the first request past the budget is rejected with
//! the seconds until the window resets.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use ductile_core::Principal;
use ductile_config::RateLimitConfig;

struct Window {
    start: Instant,
    count: u64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Rejected; seconds until the current window resets.
    Limited { retry_after: u64 },
}

#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one request for `key` under a `max`-per-`interval`
    /// budget. O(1), non-suspending.
    pub fn check(&self, key: &str, max: u64, interval: Duration) -> RateDecision {
        if max == 0 {
            return RateDecision::Limited {
                retry_after: interval.as_secs(),
            };
        }
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window { start: now, count: 0 });
        let window = entry.value_mut();

        let elapsed = now.duration_since(window.start);
        if elapsed >= interval {
            window.start = now;
            window.count = 0;
        }

        if window.count < max {
            window.count += 1;
            RateDecision::Allowed
        } else {
            let remaining = interval.saturating_sub(now.duration_since(window.start));
            RateDecision::Limited {
                retry_after: remaining.as_secs().max(1),
            }
        }
    }

    /// Drop windows idle past their interval. Called opportunistically by
    /// the heartbeat so the map does not grow with one-off principals.
    pub fn evict_idle(&self, interval: Duration) {
        let now = Instant::now();
        self.windows
            .retain(|_, window| now.duration_since(window.start) < interval * 2);
    }
}

/// The admission budget for a principal: the per-user override when one is
/// configured, otherwise the endpoint default.
pub fn effective_max(config: &RateLimitConfig, principal: Option<&Principal>) -> u64 {
    principal
        .and_then(|p| config.overrides.get(&p.id))
        .copied()
        .unwrap_or(config.max)
}

/// Rate-limit accounting key: endpoint plus authenticated id, or the
/// client address for anonymous callers.
pub fn principal_key(endpoint: &str, principal: Option<&Principal>, client_addr: &str) -> String {
    match principal {
        Some(p) => format!("{endpoint}\u{1}{}", p.id),
        None => format!("{endpoint}\u{1}{client_addr}"),
    }
}
