#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use openfive_gateway::cache::{Cache, CacheConfig};
use openfive_gateway::crypto;
use openfive_gateway::meter::MeterWriter;
use openfive_gateway::persistence::{MemoryStore, Persistence, SeedState};
use openfive_gateway::pipeline::{Pipeline, RequestMeta};
use openfive_gateway::providers::{ChunkStream, Provider, ProviderConfig, Registry};
use openfive_gateway::types::{
    ApiKey, BudgetMode, ChatCompletionRequest, ChatCompletionResponse, Choice, Environment,
    Message, ModelInfo, ProviderInfo, Route, Usage,
};
use openfive_gateway::{GatewayError, Result};

pub const MASTER_KEY: &str = "0123456789abcdef0123456789abcdef";
pub const UPSTREAM_KEY: &str = "sk-upstream-secret";

pub enum MockReply {
    Ok(ChatCompletionResponse),
    Status(u16),
    Stream(String),
}

/// Scripted provider: replies are popped in order; an empty script answers
/// with a canned completion.
pub struct MockProvider {
    script: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<String>>,
    api_keys_seen: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            api_keys_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: MockReply) {
        self.script.lock().expect("lock").push_back(reply);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }

    pub fn api_keys_seen(&self) -> Vec<String> {
        self.api_keys_seen.lock().expect("lock").clone()
    }

    fn observe(&self, req: &ChatCompletionRequest, cfg: &ProviderConfig) {
        self.calls.lock().expect("lock").push(req.model.clone());
        self.api_keys_seen
            .lock()
            .expect("lock")
            .push(cfg.api_key.clone());
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send(
        &self,
        req: &ChatCompletionRequest,
        cfg: &ProviderConfig,
    ) -> Result<ChatCompletionResponse> {
        self.observe(req, cfg);
        match self.script.lock().expect("lock").pop_front() {
            Some(MockReply::Ok(response)) => Ok(response),
            Some(MockReply::Status(status)) => Err(GatewayError::ProviderHttp {
                status,
                body: "mock upstream failure".to_string(),
            }),
            Some(MockReply::Stream(_)) => Err(GatewayError::Internal(
                "stream scripted for a unary call".to_string(),
            )),
            None => Ok(response_with("ok", 200, 50)),
        }
    }

    async fn send_stream(
        &self,
        req: &ChatCompletionRequest,
        cfg: &ProviderConfig,
    ) -> Result<ChunkStream> {
        self.observe(req, cfg);
        match self.script.lock().expect("lock").pop_front() {
            Some(MockReply::Stream(sse)) => {
                Ok(ChunkStream::from_reader(Cursor::new(sse.into_bytes())))
            }
            Some(MockReply::Status(status)) => Err(GatewayError::ProviderHttp {
                status,
                body: "mock upstream failure".to_string(),
            }),
            Some(MockReply::Ok(_)) => Err(GatewayError::Internal(
                "unary reply scripted for a stream call".to_string(),
            )),
            None => Ok(ChunkStream::from_reader(Cursor::new(
                default_sse().into_bytes(),
            ))),
        }
    }
}

pub fn default_sse() -> String {
    concat!(
        "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"hel\"}}]}\n\n",
        "data: {\"id\":\"c2\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"lo\"}}]}\n\n",
        "data: {\"id\":\"c3\",\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":200,\"completion_tokens\":50,\"total_tokens\":250}}\n\n",
        "data: [DONE]\n\n",
    )
    .to_string()
}

pub fn response_with(
    content: &str,
    prompt_tokens: u32,
    completion_tokens: u32,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: "chatcmpl-mock".to_string(),
        object: "chat.completion".to_string(),
        created: 1_700_000_000,
        model: "mock-upstream".to_string(),
        choices: vec![Choice {
            index: 0,
            message: Some(Message {
                role: "assistant".to_string(),
                content: serde_json::Value::String(content.to_string()),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }),
            delta: None,
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }),
    }
}

pub fn environment(mode: BudgetMode, limit: Option<f64>, used: f64) -> Environment {
    Environment {
        id: "env-1".to_string(),
        project_id: "proj-1".to_string(),
        organization_id: "org-1".to_string(),
        tier: "pro".to_string(),
        budget_mode: mode,
        budget_limit_usd: limit,
        budget_used_usd: used,
        killswitch_active: false,
        killswitch_reason: None,
        killswitch_at: None,
        anomaly_multiplier: 3.0,
        anomaly_window: Duration::from_secs(300),
    }
}

pub fn route() -> Route {
    Route {
        id: "route-1".to_string(),
        environment_id: "env-1".to_string(),
        slug: "chat".to_string(),
        name: "Chat".to_string(),
        is_active: true,
        allowed_models: Vec::new(),
        preferred_model: None,
        fallback_chain: Vec::new(),
        constraints: Default::default(),
        weight_cost: 1.0,
        weight_latency: 1.0,
        weight_reliability: 1.0,
        output_schema: None,
        schema_strict: false,
        max_tokens_per_request: None,
        max_requests_per_min: None,
        guardrail_settings: Default::default(),
        budget_limit_usd: None,
    }
}

pub fn model(id: &str, input_price: f64, output_price: f64) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        provider_id: "prov-1".to_string(),
        model_id: format!("mock/{id}"),
        display_name: id.to_string(),
        context_window: 128_000,
        max_output_tokens: None,
        input_price_per_m: input_price,
        output_price_per_m: output_price,
        supports_streaming: true,
        supports_tools: true,
        supports_vision: false,
        supports_json_mode: true,
        avg_latency_ms: Some(400),
        p99_latency_ms: Some(1200),
        reliability_pct: 99.9,
        is_active: true,
    }
}

pub fn provider_row() -> ProviderInfo {
    ProviderInfo {
        id: "prov-1".to_string(),
        name: "Mock Upstream".to_string(),
        provider_type: "mock".to_string(),
        base_url: "http://mock.invalid/v1".to_string(),
        api_key_enc: Some(crypto::seal(UPSTREAM_KEY, MASTER_KEY).expect("seal")),
        status: "active".to_string(),
    }
}

pub fn api_key(token: &str) -> ApiKey {
    ApiKey {
        id: "key-1".to_string(),
        environment_id: "env-1".to_string(),
        route_id: None,
        key_hash: openfive_gateway::auth::hash_key(token),
        previous_key_hash: None,
        rotated_at: None,
        grace_period: None,
        scopes: vec!["chat".to_string()],
        rate_limit_rpm: None,
        is_active: true,
        last_used_at: None,
    }
}

/// A seed with one environment, one route, one model, one provider, and the
/// `sk-ok` key; scenarios adjust from here.
pub fn base_seed() -> SeedState {
    SeedState {
        environments: vec![environment(BudgetMode::Hard, Some(100.0), 50.0)],
        routes: vec![route()],
        models: vec![model("m1", 10.0, 20.0)],
        providers: vec![provider_row()],
        api_keys: vec![api_key("sk-ok")],
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub pipeline: Arc<Pipeline>,
    pub meter: Arc<MeterWriter>,
    pub cache: Arc<Cache>,
    pub provider: Arc<MockProvider>,
}

impl Harness {
    pub fn new(seed: SeedState) -> Self {
        let store = Arc::new(MemoryStore::new(seed));
        let provider = MockProvider::new();
        let mut registry = Registry::new();
        registry.register(provider.clone() as Arc<dyn Provider>);

        let cache = Arc::new(Cache::new(CacheConfig::default()));
        let meter = Arc::new(MeterWriter::new(
            store.clone() as Arc<dyn Persistence>,
            1,
            50,
        ));
        let pipeline = Arc::new(Pipeline::new(
            store.clone() as Arc<dyn Persistence>,
            Arc::new(registry),
            Arc::clone(&cache),
            Arc::clone(&meter),
            MASTER_KEY.to_string(),
        ));

        Self {
            store,
            pipeline,
            meter,
            cache,
            provider,
        }
    }

    pub fn meta(&self) -> RequestMeta {
        RequestMeta {
            authorization: Some("Bearer sk-ok".to_string()),
            route_id: Some("chat".to_string()),
            request_id: "req-test".to_string(),
        }
    }

    /// Flushes metering and returns everything recorded so far.
    pub async fn records(&self) -> Vec<openfive_gateway::types::RequestRecord> {
        self.meter.close().await;
        self.store.requests()
    }
}

pub fn chat_request(content: &str, max_tokens: Option<u32>) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: "gpt-4o-mini".to_string(),
        messages: vec![Message::user(content)],
        stream: false,
        temperature: None,
        max_tokens,
        tools: None,
        tool_choice: None,
        response_format: None,
        stop: None,
        top_p: None,
        n: None,
        user: None,
    }
}
