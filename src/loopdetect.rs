use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Flags agentic loops by counting identical prompt hashes inside a sliding
/// window, scoped to `(environment, route)`.
#[derive(Debug, Default)]
pub struct LoopDetector {
    history: RwLock<HashMap<String, Arc<Mutex<ScopeHistory>>>>,
}

type ScopeHistory = HashMap<String, Vec<Instant>>;

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this prompt hash has now been seen more than
    /// `max_identical` times inside the window. `max_identical == 0` or an
    /// empty hash disables detection.
    pub fn check_prompt(
        &self,
        env_id: &str,
        route_id: &str,
        prompt_hash: &str,
        max_identical: u32,
        window_seconds: u32,
    ) -> bool {
        self.check_prompt_at(
            env_id,
            route_id,
            prompt_hash,
            max_identical,
            window_seconds,
            Instant::now(),
        )
    }

    pub fn check_prompt_at(
        &self,
        env_id: &str,
        route_id: &str,
        prompt_hash: &str,
        max_identical: u32,
        window_seconds: u32,
        now: Instant,
    ) -> bool {
        if max_identical == 0 || prompt_hash.is_empty() {
            return false;
        }

        let scope_key = format!("{env_id}:{route_id}");
        let scope = {
            let history = read_lock(&self.history);
            history.get(&scope_key).cloned()
        };
        let scope = match scope {
            Some(scope) => scope,
            None => {
                let mut history = write_lock(&self.history);
                history
                    .entry(scope_key)
                    .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
                    .clone()
            }
        };

        let cutoff = now.checked_sub(Duration::from_secs(u64::from(window_seconds)));
        let mut scope = scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let timestamps = scope.entry(prompt_hash.to_string()).or_default();
        if let Some(cutoff) = cutoff {
            timestamps.retain(|seen| *seen > cutoff);
        }
        timestamps.push(now);

        timestamps.len() as u32 > max_identical
    }

    /// Returns true when the request carries more tool calls than allowed.
    /// `max == 0` disables the check.
    pub fn check_tool_calls(&self, count: u32, max: u32) -> bool {
        if max == 0 {
            return false;
        }
        count > max
    }

    /// Off-hot-path janitor: drops timestamps older than `max_age` and prunes
    /// empty scopes.
    pub fn cleanup(&self, max_age: Duration) {
        self.cleanup_at(max_age, Instant::now());
    }

    pub fn cleanup_at(&self, max_age: Duration, now: Instant) {
        let Some(cutoff) = now.checked_sub(max_age) else {
            return;
        };
        let mut history = write_lock(&self.history);
        history.retain(|_, scope| {
            let mut scope = scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            scope.retain(|_, timestamps| {
                timestamps.retain(|seen| *seen > cutoff);
                !timestamps.is_empty()
            });
            !scope.is_empty()
        });
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
