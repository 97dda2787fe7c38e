//! Per-cluster upload rate limiting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Stale entries are swept once the table grows past this many keys.
const GC_THRESHOLD: usize = 4096;

/// Admits at most one batch per cluster per interval. The check and the
/// timestamp update are one atomic step under the table lock, so two
/// concurrent uploads for the same cluster can never both be admitted.
pub struct RateLimiter {
    interval: Duration,
    last_accepted: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        RateLimiter {
            interval,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    /// On rejection returns how long the caller has to wait.
    pub fn admit(&self, key: &str) -> Result<(), Duration> {
        self.admit_at(key, Instant::now())
    }

    fn admit_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let mut table = self.last_accepted.lock();

        if table.len() > GC_THRESHOLD {
            let interval = self.interval;
            table.retain(|_, last| now.saturating_duration_since(*last) < interval);
        }

        if let Some(last) = table.get(key) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.interval {
                return Err(self.interval - elapsed);
            }
        }
        table.insert(key.to_string(), now);
        Ok(())
    }
}
