use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::persistence::Persistence;
use crate::Result;

#[derive(Clone, Copy, Debug)]
struct CostSample {
    at: Instant,
    cost_usd: f64,
}

/// Cost accumulated over a sliding time window.
#[derive(Debug)]
struct SlidingWindow {
    samples: VecDeque<CostSample>,
    duration: Duration,
}

impl SlidingWindow {
    fn new(duration: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(100),
            duration,
        }
    }

    fn add(&mut self, sample: CostSample, now: Instant) {
        self.evict(now);
        self.samples.push_back(sample);
    }

    fn total(&mut self, now: Instant) -> f64 {
        self.evict(now);
        self.samples.iter().map(|sample| sample.cost_usd).sum()
    }

    fn evict(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.duration) else {
            return;
        };
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.at < cutoff)
        {
            self.samples.pop_front();
        }
    }
}

/// Watches per-environment spend and flags windows that blow past
/// `baseline * multiplier`. Without a configured baseline it only observes.
#[derive(Debug, Default)]
pub struct AnomalyDetector {
    windows: RwLock<HashMap<String, Arc<Mutex<SlidingWindow>>>>,
    baselines: RwLock<HashMap<String, f64>>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expected cost per window for an environment.
    pub fn set_baseline(&self, env_id: &str, baseline_cost_usd: f64) {
        let mut baselines = write_lock(&self.baselines);
        baselines.insert(env_id.to_string(), baseline_cost_usd);
    }

    pub fn baseline(&self, env_id: &str) -> Option<f64> {
        let baselines = read_lock(&self.baselines);
        baselines.get(env_id).copied()
    }

    /// Records a cost sample; returns `(anomaly_detected, window_total)`.
    pub fn observe(
        &self,
        env_id: &str,
        cost_usd: f64,
        multiplier: f64,
        window: Duration,
    ) -> (bool, f64) {
        self.observe_at(env_id, cost_usd, multiplier, window, Instant::now())
    }

    pub fn observe_at(
        &self,
        env_id: &str,
        cost_usd: f64,
        multiplier: f64,
        window_duration: Duration,
        now: Instant,
    ) -> (bool, f64) {
        let window = {
            let windows = read_lock(&self.windows);
            windows.get(env_id).cloned()
        };
        let window = match window {
            Some(window) => window,
            None => {
                let mut windows = write_lock(&self.windows);
                windows
                    .entry(env_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(SlidingWindow::new(window_duration))))
                    .clone()
            }
        };

        let mut window = window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        window.add(CostSample { at: now, cost_usd }, now);
        let window_total = window.total(now);

        let baseline = {
            let baselines = read_lock(&self.baselines);
            baselines.get(env_id).copied()
        };
        let Some(baseline) = baseline else {
            // First window observes only; baselines are installed explicitly.
            return (false, window_total);
        };

        if baseline > 0.0 && window_total > baseline * multiplier {
            return (true, window_total);
        }
        (false, window_total)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Latches an environment shut. Activation persists the flag and an incident
/// in one transaction; the orchestrator checks the flag before any upstream
/// call.
pub struct KillSwitch {
    store: Arc<dyn Persistence>,
}

impl KillSwitch {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    pub async fn activate(
        &self,
        env_id: &str,
        reason: &str,
        window_total: f64,
        baseline_hint: f64,
        multiplier: f64,
    ) -> Result<()> {
        let trigger_data = json!({
            "window_total_usd": window_total,
            "baseline_usd": baseline_hint,
            "multiplier": multiplier,
        });
        self.store
            .activate_killswitch(env_id, reason, trigger_data)
            .await
    }

    pub async fn deactivate(&self, env_id: &str) -> Result<()> {
        self.store.deactivate_killswitch(env_id).await
    }
}
