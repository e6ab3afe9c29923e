//! Per-origin rate limiting for relay operations.
//!
//! Fixed-window counters keyed by network origin. Callers that exceed the
//! limit are not told so: the relay simply drops the operation.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Operations allowed for one origin inside the current window
#[derive(Debug)]
struct OriginRecord {
    count: u32,
    window_start: Instant,
}

/// Thread-safe fixed-window rate limiter keyed by origin address
#[derive(Debug)]
pub struct OriginRateLimiter {
    max_per_window: u32,
    window: Duration,
    /// Upper bound on tracked origins, so a flood of distinct addresses
    /// cannot grow the table without limit
    max_tracked: usize,
    records: Mutex<HashMap<IpAddr, OriginRecord>>,
}

impl OriginRateLimiter {
    pub fn new(max_per_window: u32, window: Duration, max_tracked: usize) -> Self {
        Self {
            max_per_window,
            window,
            max_tracked,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record one operation from `origin`.
    ///
    /// Returns `true` if it is allowed, `false` if the origin is over its limit.
    pub fn check_and_record(&self, origin: IpAddr) -> bool {
        self.check_and_record_at(origin, Instant::now())
    }

    fn check_and_record_at(&self, origin: IpAddr, now: Instant) -> bool {
        let mut records = self.records.lock();

        if !records.contains_key(&origin) && records.len() >= self.max_tracked {
            let window = self.window;
            records.retain(|_, record| now.duration_since(record.window_start) < window);
            if records.len() >= self.max_tracked {
                return false;
            }
        }

        let record = records.entry(origin).or_insert(OriginRecord {
            count: 0,
            window_start: now,
        });

        if now.duration_since(record.window_start) >= self.window {
            record.count = 0;
            record.window_start = now;
        }

        if record.count >= self.max_per_window {
            return false;
        }

        record.count += 1;
        true
    }

    /// Number of origins currently tracked
    pub fn tracked_origins(&self) -> usize {
        self.records.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = OriginRateLimiter::new(5, Duration::from_secs(1), 100);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_and_record_at(ip(1), now));
        }
        assert!(!limiter.check_and_record_at(ip(1), now));
    }

    #[test]
    fn test_origins_are_independent() {
        let limiter = OriginRateLimiter::new(1, Duration::from_secs(1), 100);
        let now = Instant::now();

        assert!(limiter.check_and_record_at(ip(1), now));
        assert!(!limiter.check_and_record_at(ip(1), now));
        assert!(limiter.check_and_record_at(ip(2), now));
    }

    #[test]
    fn test_window_resets() {
        let limiter = OriginRateLimiter::new(1, Duration::from_secs(1), 100);
        let now = Instant::now();

        assert!(limiter.check_and_record_at(ip(1), now));
        assert!(!limiter.check_and_record_at(ip(1), now + Duration::from_millis(500)));
        assert!(limiter.check_and_record_at(ip(1), now + Duration::from_secs(1)));
    }

    #[test]
    fn test_tracked_origin_cap() {
        let limiter = OriginRateLimiter::new(10, Duration::from_secs(1), 2);
        let now = Instant::now();

        assert!(limiter.check_and_record_at(ip(1), now));
        assert!(limiter.check_and_record_at(ip(2), now));
        assert!(!limiter.check_and_record_at(ip(3), now));
        assert_eq!(limiter.tracked_origins(), 2);

        // Expired records make room for new origins
        assert!(limiter.check_and_record_at(ip(3), now + Duration::from_secs(2)));
    }
}
