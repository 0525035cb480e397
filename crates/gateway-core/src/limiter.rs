//! Rate Limiters (component I): global and per-key sliding-window limiters.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const WINDOW_SECONDS: i64 = 60;
const MAX_STORED_TIMESTAMPS: usize = 10_000;

struct Bucket {
    timestamps: VecDeque<i64>,
}

impl Bucket {
    fn new() -> Self {
        Bucket { timestamps: VecDeque::new() }
    }
}

/// A sliding-window limiter keyed by an optional bucket (`None` for the
/// single global bucket, `Some(label)` for per-key buckets).
pub struct SlidingWindowLimiter {
    max_rps: i64,
    max_rpm: i64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_rps: i64, max_rpm: i64) -> Self {
        SlidingWindowLimiter {
            max_rps,
            max_rpm,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Decides whether to admit one unit at wall-clock time `now` for the
    /// given bucket key.
    pub fn allow(&self, bucket_key: &str, now: i64) -> bool {
        if self.max_rps <= 0 && self.max_rpm <= 0 {
            return true;
        }
        let mut buckets = self.buckets.lock().expect("limiter mutex poisoned");
        let bucket = buckets.entry(bucket_key.to_string()).or_insert_with(Bucket::new);

        while let Some(&front) = bucket.timestamps.front() {
            if now - front >= WINDOW_SECONDS {
                bucket.timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.max_rpm > 0 && bucket.timestamps.len() as i64 >= self.max_rpm {
            return false;
        }

        if self.max_rps > 0 {
            let recent = bucket.timestamps.iter().filter(|&&t| now - t < 1).count() as i64;
            if recent >= self.max_rps {
                return false;
            }
        }

        bucket.timestamps.push_back(now);
        if bucket.timestamps.len() > MAX_STORED_TIMESTAMPS {
            bucket.timestamps.pop_front();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_limiter_always_allows() {
        let limiter = SlidingWindowLimiter::new(0, 0);
        for i in 0..100 {
            assert!(limiter.allow("global", i));
        }
    }

    #[test]
    fn rpm_cap_rejects_after_threshold() {
        let limiter = SlidingWindowLimiter::new(0, 3);
        assert!(limiter.allow("k", 0));
        assert!(limiter.allow("k", 0));
        assert!(limiter.allow("k", 0));
        assert!(!limiter.allow("k", 0));
    }

    #[test]
    fn rps_cap_rejects_within_one_second() {
        let limiter = SlidingWindowLimiter::new(2, 0);
        assert!(limiter.allow("k", 100));
        assert!(limiter.allow("k", 100));
        assert!(!limiter.allow("k", 100));
        assert!(limiter.allow("k", 102));
    }

    #[test]
    fn old_timestamps_expire_out_of_window() {
        let limiter = SlidingWindowLimiter::new(0, 1);
        assert!(limiter.allow("k", 0));
        assert!(!limiter.allow("k", 10));
        assert!(limiter.allow("k", 61));
    }

    #[test]
    fn buckets_are_independent() {
        let limiter = SlidingWindowLimiter::new(0, 1);
        assert!(limiter.allow("a", 0));
        assert!(limiter.allow("b", 0));
    }
}
