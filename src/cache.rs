use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::task::BackgroundTask;
use crate::types::{Message, Tool};

/// Deterministic JSON with sorted object keys (serde_json's default map is
/// ordered), so semantically identical payloads fingerprint identically.
pub fn canonical_json<T: Serialize>(value: &T) -> String {
    let normalized = serde_json::to_value(value).unwrap_or(Value::Null);
    serde_json::to_string(&normalized).unwrap_or_default()
}

/// Cache key over the request fields that change the completion. The `stream`
/// flag is deliberately excluded.
pub fn fingerprint(
    model: &str,
    messages: &[Message],
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    tools: Option<&[Tool]>,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(model.as_bytes());
    hasher.update([0u8]);

    hasher.update(canonical_json(&messages).as_bytes());
    hasher.update([0u8]);

    match temperature {
        Some(temperature) => hasher.update(format!("{temperature:.4}").as_bytes()),
        None => hasher.update(b"default"),
    }
    hasher.update([0u8]);

    match max_tokens {
        Some(max_tokens) => hasher.update(max_tokens.to_string().as_bytes()),
        None => hasher.update(b"default"),
    }
    hasher.update([0u8]);

    if let Some(tools) = tools {
        hasher.update(canonical_json(&tools).as_bytes());
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(30 * 60),
            enabled: true,
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    response: Bytes,
    model: String,
    input_tokens: u32,
    output_tokens: u32,
    cost_usd: f64,
    created_at: Instant,
    expires_at: Instant,
    hit_count: u64,
    last_accessed_at: Instant,
}

/// What a cache hit hands back to the pipeline.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub response: Bytes,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub created_at: Instant,
    pub hit_count: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
    pub saved_cost: f64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct StatsInner {
    hits: u64,
    misses: u64,
    evictions: u64,
    saved_cost: f64,
}

/// In-memory semantic response cache: fingerprint -> response bytes, LRU-ish
/// eviction by last access, TTL expiry, and a once-a-minute sweeper.
#[derive(Debug)]
pub struct Cache {
    entries: RwLock<HashMap<String, Entry>>,
    stats: Mutex<StatsInner>,
    config: CacheConfig,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(config.max_entries.min(1024))),
            stats: Mutex::new(StatsInner::default()),
            config,
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<CachedResponse> {
        if !self.config.enabled {
            self.record_miss();
            return None;
        }

        let expired = {
            let entries = read_lock(&self.entries);
            match entries.get(key) {
                None => {
                    drop(entries);
                    self.record_miss();
                    return None;
                }
                Some(entry) => now > entry.expires_at,
            }
        };

        if expired {
            let mut entries = write_lock(&self.entries);
            if entries.remove(key).is_some() {
                let mut stats = lock(&self.stats);
                stats.evictions += 1;
            }
            drop(entries);
            self.record_miss();
            return None;
        }

        let mut entries = write_lock(&self.entries);
        let Some(entry) = entries.get_mut(key) else {
            drop(entries);
            self.record_miss();
            return None;
        };
        entry.hit_count += 1;
        entry.last_accessed_at = now;
        let hit = CachedResponse {
            response: entry.response.clone(),
            model: entry.model.clone(),
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            cost_usd: entry.cost_usd,
            created_at: entry.created_at,
            hit_count: entry.hit_count,
        };
        drop(entries);

        let mut stats = lock(&self.stats);
        stats.hits += 1;
        stats.saved_cost += hit.cost_usd;
        Some(hit)
    }

    pub fn set(
        &self,
        key: String,
        response: Bytes,
        model: String,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: f64,
    ) {
        self.set_at(
            key,
            response,
            model,
            input_tokens,
            output_tokens,
            cost_usd,
            Instant::now(),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_at(
        &self,
        key: String,
        response: Bytes,
        model: String,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: f64,
        now: Instant,
    ) {
        if !self.config.enabled {
            return;
        }

        let mut entries = write_lock(&self.entries);
        if entries.len() >= self.config.max_entries {
            let evicted = evict_lru(&mut entries);
            if evicted > 0 {
                let mut stats = lock(&self.stats);
                stats.evictions += evicted;
            }
        }

        entries.insert(
            key,
            Entry {
                response,
                model,
                input_tokens,
                output_tokens,
                cost_usd,
                created_at: now,
                expires_at: now + self.config.ttl,
                hit_count: 0,
                last_accessed_at: now,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        let mut entries = write_lock(&self.entries);
        entries.remove(key);
    }

    pub fn clear(&self) {
        let mut entries = write_lock(&self.entries);
        entries.clear();
    }

    /// Drops expired entries; the sweeper calls this once per minute.
    pub fn sweep_expired(&self) {
        self.sweep_expired_at(Instant::now());
    }

    pub fn sweep_expired_at(&self, now: Instant) {
        let mut entries = write_lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        let evicted = (before - entries.len()) as u64;
        drop(entries);
        if evicted > 0 {
            let mut stats = lock(&self.stats);
            stats.evictions += evicted;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = read_lock(&self.entries).len() as u64;
        let stats = lock(&self.stats);
        let total = stats.hits + stats.misses;
        let hit_rate = if total > 0 {
            stats.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            entries,
            saved_cost: stats.saved_cost,
            hit_rate,
        }
    }

    fn record_miss(&self) {
        let mut stats = lock(&self.stats);
        stats.misses += 1;
    }
}

/// Removes the oldest 10% of entries by last access (at least one).
/// Caller holds the write lock.
fn evict_lru(entries: &mut HashMap<String, Entry>) -> u64 {
    if entries.is_empty() {
        return 0;
    }
    let mut by_access: Vec<(String, Instant)> = entries
        .iter()
        .map(|(key, entry)| (key.clone(), entry.last_accessed_at))
        .collect();
    by_access.sort_by_key(|(_, accessed)| *accessed);

    let remove_count = (by_access.len() / 10).max(1);
    for (key, _) in by_access.into_iter().take(remove_count) {
        entries.remove(&key);
    }
    remove_count as u64
}

/// Once-a-minute expired-entry sweep, cancellable at shutdown.
pub fn spawn_sweeper(cache: Arc<Cache>) -> BackgroundTask {
    BackgroundTask::spawn(Duration::from_secs(60), move || {
        let cache = Arc::clone(&cache);
        async move {
            cache.sweep_expired();
        }
    })
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
