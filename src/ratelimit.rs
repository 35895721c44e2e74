use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Continuously-refilled token bucket: capacity `rpm`, refill `rpm / 60` per
/// second, one token per admission.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(max_per_minute);
        Self {
            tokens: capacity,
            capacity,
            rate: capacity / 60.0,
            last_refill: now,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens += elapsed * self.rate;
        if self.tokens > self.capacity {
            self.tokens = self.capacity;
        }

        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

/// Per-key rate limiter. Buckets serialize behind their own mutex; the
/// top-level map sits behind a read-heavy lock with double-checked insertion.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, key: &str, max_per_minute: u32) -> bool {
        self.allow_at(key, max_per_minute, Instant::now())
    }

    pub fn allow_at(&self, key: &str, max_per_minute: u32, now: Instant) -> bool {
        let bucket = {
            let buckets = read_lock(&self.buckets);
            buckets.get(key).cloned()
        };

        let bucket = match bucket {
            Some(bucket) => bucket,
            None => {
                let mut buckets = write_lock(&self.buckets);
                buckets
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(max_per_minute, now))))
                    .clone()
            }
        };

        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.allow(now)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
