use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ApiKey, Environment, Incident, ModelInfo, ProviderInfo, RequestRecord, Route,
};
use crate::{GatewayError, Result};

/// The relational store behind the gateway, kept opaque so the pipeline can
/// run against anything that honors these contracts. Implementations must
/// make `add_budget_used` an atomic increment and `activate_killswitch` a
/// single transaction covering the environment update and the incident row.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn find_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>>;
    async fn find_key_by_previous_hash(&self, hash: &str) -> Result<Option<ApiKey>>;
    async fn load_environment(&self, env_id: &str) -> Result<Environment>;
    async fn load_route(&self, env_id: &str, slug: &str) -> Result<Route>;
    async fn load_models(&self, organization_id: &str) -> Result<Vec<ModelInfo>>;
    async fn load_provider(&self, provider_id: &str) -> Result<ProviderInfo>;
    async fn touch_key(&self, key_id: &str) -> Result<()>;
    async fn add_budget_used(&self, env_id: &str, cost_usd: f64) -> Result<()>;
    async fn activate_killswitch(
        &self,
        env_id: &str,
        reason: &str,
        trigger_data: Value,
    ) -> Result<()>;
    async fn deactivate_killswitch(&self, env_id: &str) -> Result<()>;
    async fn insert_request(&self, record: &RequestRecord) -> Result<()>;
}

/// Seed data for [`MemoryStore`]; also the on-disk format the binary accepts
/// for local runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SeedState {
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub providers: Vec<ProviderInfo>,
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
}

/// In-memory [`Persistence`] used by tests and the binary's local mode.
/// A single mutex over the whole state makes every operation atomic,
/// including the kill-switch transaction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    environments: HashMap<String, Environment>,
    routes: Vec<Route>,
    models: Vec<ModelInfo>,
    providers: HashMap<String, ProviderInfo>,
    api_keys: Vec<ApiKey>,
    requests: Vec<RequestRecord>,
    incidents: Vec<Incident>,
}

impl MemoryStore {
    pub fn new(seed: SeedState) -> Self {
        let state = MemoryState {
            environments: seed
                .environments
                .into_iter()
                .map(|env| (env.id.clone(), env))
                .collect(),
            routes: seed.routes,
            models: seed.models,
            providers: seed
                .providers
                .into_iter()
                .map(|provider| (provider.id.clone(), provider))
                .collect(),
            api_keys: seed.api_keys,
            requests: Vec::new(),
            incidents: Vec::new(),
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // Lock poisoning only happens if a holder panicked; the data is plain
        // state so continuing with it is safe.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of all metered requests, for assertions.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.lock().requests.clone()
    }

    /// Snapshot of all incidents, for assertions.
    pub fn incidents(&self) -> Vec<Incident> {
        self.lock().incidents.clone()
    }

    pub fn environment(&self, env_id: &str) -> Option<Environment> {
        self.lock().environments.get(env_id).cloned()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn find_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>> {
        let state = self.lock();
        Ok(state
            .api_keys
            .iter()
            .find(|key| key.key_hash == hash)
            .cloned())
    }

    async fn find_key_by_previous_hash(&self, hash: &str) -> Result<Option<ApiKey>> {
        let state = self.lock();
        Ok(state
            .api_keys
            .iter()
            .find(|key| key.previous_key_hash.as_deref() == Some(hash))
            .cloned())
    }

    async fn load_environment(&self, env_id: &str) -> Result<Environment> {
        self.lock()
            .environments
            .get(env_id)
            .cloned()
            .ok_or_else(|| GatewayError::Persistence(format!("environment not found: {env_id}")))
    }

    async fn load_route(&self, env_id: &str, slug: &str) -> Result<Route> {
        self.lock()
            .routes
            .iter()
            .find(|route| route.environment_id == env_id && route.slug == slug && route.is_active)
            .cloned()
            .ok_or_else(|| GatewayError::Persistence(format!("route not found: {slug}")))
    }

    async fn load_models(&self, _organization_id: &str) -> Result<Vec<ModelInfo>> {
        let state = self.lock();
        Ok(state
            .models
            .iter()
            .filter(|model| model.is_active)
            .cloned()
            .collect())
    }

    async fn load_provider(&self, provider_id: &str) -> Result<ProviderInfo> {
        self.lock()
            .providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| GatewayError::Persistence(format!("provider not found: {provider_id}")))
    }

    async fn touch_key(&self, key_id: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(key) = state.api_keys.iter_mut().find(|key| key.id == key_id) {
            key.last_used_at = Some(SystemTime::now());
        }
        Ok(())
    }

    async fn add_budget_used(&self, env_id: &str, cost_usd: f64) -> Result<()> {
        let mut state = self.lock();
        let env = state
            .environments
            .get_mut(env_id)
            .ok_or_else(|| GatewayError::Persistence(format!("environment not found: {env_id}")))?;
        env.budget_used_usd += cost_usd;
        Ok(())
    }

    async fn activate_killswitch(
        &self,
        env_id: &str,
        reason: &str,
        trigger_data: Value,
    ) -> Result<()> {
        let mut state = self.lock();
        let env = state
            .environments
            .get_mut(env_id)
            .ok_or_else(|| GatewayError::Persistence(format!("environment not found: {env_id}")))?;
        env.killswitch_active = true;
        env.killswitch_reason = Some(reason.to_string());
        env.killswitch_at = Some(SystemTime::now());
        state.incidents.push(Incident {
            environment_id: env_id.to_string(),
            severity: "critical".to_string(),
            status: "open".to_string(),
            incident_type: "killswitch_activated".to_string(),
            title: format!("Kill switch activated: {reason}"),
            description: reason.to_string(),
            trigger_data,
            killswitch_activated: true,
        });
        Ok(())
    }

    async fn deactivate_killswitch(&self, env_id: &str) -> Result<()> {
        let mut state = self.lock();
        let env = state
            .environments
            .get_mut(env_id)
            .ok_or_else(|| GatewayError::Persistence(format!("environment not found: {env_id}")))?;
        env.killswitch_active = false;
        env.killswitch_reason = None;
        env.killswitch_at = None;
        Ok(())
    }

    async fn insert_request(&self, record: &RequestRecord) -> Result<()> {
        self.lock().requests.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BudgetMode;
    use std::sync::Arc;
    use std::time::Duration;

    fn env(id: &str) -> Environment {
        Environment {
            id: id.to_string(),
            project_id: "p1".to_string(),
            organization_id: "org1".to_string(),
            tier: "pro".to_string(),
            budget_mode: BudgetMode::Hard,
            budget_limit_usd: Some(100.0),
            budget_used_usd: 0.0,
            killswitch_active: false,
            killswitch_reason: None,
            killswitch_at: None,
            anomaly_multiplier: 3.0,
            anomaly_window: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn budget_increments_are_atomic_and_sum() -> Result<()> {
        let store = Arc::new(MemoryStore::new(SeedState {
            environments: vec![env("e1")],
            ..SeedState::default()
        }));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.add_budget_used("e1", 0.01).await
            }));
        }
        for handle in handles {
            handle.await.expect("join")?;
        }

        let used = store.environment("e1").expect("env").budget_used_usd;
        assert!((used - 0.5).abs() < 1e-9, "used = {used}");
        Ok(())
    }

    #[tokio::test]
    async fn killswitch_activation_writes_incident_atomically() -> Result<()> {
        let store = MemoryStore::new(SeedState {
            environments: vec![env("e1")],
            ..SeedState::default()
        });

        store
            .activate_killswitch("e1", "cost anomaly", serde_json::json!({"window_total": 3.6}))
            .await?;

        let env = store.environment("e1").expect("env");
        assert!(env.killswitch_active);
        assert_eq!(env.killswitch_reason.as_deref(), Some("cost anomaly"));
        assert!(env.killswitch_at.is_some());

        let incidents = store.incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].severity, "critical");
        assert_eq!(incidents[0].status, "open");
        assert_eq!(incidents[0].incident_type, "killswitch_activated");
        assert!(incidents[0].killswitch_activated);

        store.deactivate_killswitch("e1").await?;
        let env = store.environment("e1").expect("env");
        assert!(!env.killswitch_active);
        assert!(env.killswitch_reason.is_none());
        assert!(env.killswitch_at.is_none());
        Ok(())
    }

    #[test]
    fn seed_files_round_trip_through_json() {
        let seed_json = serde_json::json!({
            "environments": [{
                "id": "e1",
                "project_id": "p1",
                "organization_id": "org1",
                "budget_mode": "hard",
                "budget_limit_usd": 100.0,
                "anomaly_multiplier": 3.0,
                "anomaly_window": {"secs": 300, "nanos": 0}
            }],
            "api_keys": [{
                "id": "k1",
                "environment_id": "e1",
                "key_hash": "ab".repeat(32),
                "is_active": true
            }]
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seed.json");
        std::fs::write(&path, seed_json.to_string()).expect("write seed");

        let raw = std::fs::read_to_string(&path).expect("read seed");
        let seed: SeedState = serde_json::from_str(&raw).expect("parse seed");
        assert_eq!(seed.environments.len(), 1);
        assert_eq!(seed.environments[0].budget_mode, BudgetMode::Hard);
        assert_eq!(
            seed.environments[0].anomaly_window,
            Duration::from_secs(300)
        );
        assert!(seed.api_keys[0].is_active);
        assert!(seed.routes.is_empty());
    }

    #[tokio::test]
    async fn inactive_routes_are_not_served() {
        let mut route = Route {
            id: "r1".to_string(),
            environment_id: "e1".to_string(),
            slug: "chat".to_string(),
            name: "Chat".to_string(),
            is_active: false,
            allowed_models: Vec::new(),
            preferred_model: None,
            fallback_chain: Vec::new(),
            constraints: Default::default(),
            weight_cost: 1.0,
            weight_latency: 0.0,
            weight_reliability: 0.0,
            output_schema: None,
            schema_strict: false,
            max_tokens_per_request: None,
            max_requests_per_min: None,
            guardrail_settings: Default::default(),
            budget_limit_usd: None,
        };
        let store = MemoryStore::new(SeedState {
            routes: vec![route.clone()],
            ..SeedState::default()
        });
        assert!(store.load_route("e1", "chat").await.is_err());

        route.is_active = true;
        let store = MemoryStore::new(SeedState {
            routes: vec![route],
            ..SeedState::default()
        });
        assert!(store.load_route("e1", "chat").await.is_ok());
    }
}
