use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt as _;

use crate::anomaly::{AnomalyDetector, KillSwitch};
use crate::auth::Authenticator;
use crate::budget::{Action, Enforcer};
use crate::cache::{fingerprint, Cache};
use crate::crypto;
use crate::estimator::{count_tokens, Estimator};
use crate::loopdetect::LoopDetector;
use crate::meter::MeterWriter;
use crate::persistence::Persistence;
use crate::providers::{ChunkStream, ProviderConfig, Registry};
use crate::ratelimit::RateLimiter;
use crate::router::RouterEngine;
use crate::schema::{Repairer, Validator};
use crate::types::{
    ApiKey, ChatCompletionRequest, ChatCompletionResponse, Environment, ModelInfo, ProviderInfo,
    RequestRecord, Route, Usage,
};
use crate::{GatewayError, Result};

/// Request-scoped metadata pulled off the HTTP surface.
#[derive(Clone, Debug)]
pub struct RequestMeta {
    pub authorization: Option<String>,
    pub route_id: Option<String>,
    pub request_id: String,
}

/// What the pipeline hands back to the HTTP layer.
pub enum PipelineReply {
    Unary { body: Bytes, cached: bool },
    Stream { events: BoxStream<'static, std::io::Result<Bytes>> },
}

impl std::fmt::Debug for PipelineReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineReply::Unary { body, cached } => f
                .debug_struct("Unary")
                .field("body", body)
                .field("cached", cached)
                .finish(),
            PipelineReply::Stream { .. } => f.debug_struct("Stream").finish_non_exhaustive(),
        }
    }
}

/// Per-request workbench: everything resolved so far, plus the fields the
/// metering record needs.
struct RequestContext {
    env: Environment,
    route: Route,
    api_key: ApiKey,
    request_id: String,
    started_at: SystemTime,
    started: Instant,
    prompt_hash: String,
    tool_call_count: u32,
    est_input_tokens: u32,
    est_output_tokens: u32,
    est_cost_usd: f64,
}

impl RequestContext {
    fn base_record(&self, is_streaming: bool) -> RequestRecord {
        RequestRecord {
            environment_id: self.env.id.clone(),
            route_id: Some(self.route.id.clone()),
            api_key_id: self.api_key.id.clone(),
            request_id: self.request_id.clone(),
            started_at: self.started_at,
            completed_at: None,
            duration_ms: None,
            status: String::new(),
            model_id: None,
            provider_id: None,
            model_identifier: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            estimated_tokens: true,
            input_cost_usd: 0.0,
            output_cost_usd: 0.0,
            total_cost_usd: 0.0,
            prompt_hash: Some(self.prompt_hash.clone()),
            is_streaming,
            tool_call_count: self.tool_call_count,
            attempt_number: 0,
            fallback_reason: None,
            schema_valid: None,
            schema_repair_attempts: 0,
            error_code: None,
            error_message: None,
            action_taken: String::new(),
        }
    }

    fn rejection_record(&self, action: &str, err: &GatewayError, is_streaming: bool) -> RequestRecord {
        let mut record = self.base_record(is_streaming);
        record.completed_at = Some(SystemTime::now());
        record.duration_ms = Some(self.started.elapsed().as_millis() as u64);
        record.status = "rejected".to_string();
        record.input_tokens = self.est_input_tokens;
        record.output_tokens = 0;
        record.error_code = err.code();
        record.error_message = Some(err.to_string());
        record.action_taken = action.to_string();
        record
    }
}

/// Composes the whole request path: auth, limits, cache, budget, loop and
/// anomaly detection, routing, provider fallback, schema repair, metering.
pub struct Pipeline {
    store: Arc<dyn Persistence>,
    registry: Arc<Registry>,
    cache: Arc<Cache>,
    meter: Arc<MeterWriter>,
    auth: Authenticator,
    limiter: RateLimiter,
    loops: Arc<LoopDetector>,
    anomaly: AnomalyDetector,
    killswitch: KillSwitch,
    enforcer: Enforcer,
    estimator: Estimator,
    router: RouterEngine,
    validator: Validator,
    repairer: Repairer,
    master_key: String,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Persistence>,
        registry: Arc<Registry>,
        cache: Arc<Cache>,
        meter: Arc<MeterWriter>,
        master_key: String,
    ) -> Self {
        Self {
            auth: Authenticator::new(Arc::clone(&store)),
            killswitch: KillSwitch::new(Arc::clone(&store)),
            repairer: Repairer::new(Arc::clone(&registry)),
            store,
            registry,
            cache,
            meter,
            limiter: RateLimiter::new(),
            loops: Arc::new(LoopDetector::new()),
            anomaly: AnomalyDetector::new(),
            enforcer: Enforcer::new(),
            estimator: Estimator::new(),
            router: RouterEngine::new(),
            validator: Validator::new(),
            master_key,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn loop_detector(&self) -> Arc<LoopDetector> {
        Arc::clone(&self.loops)
    }

    pub fn anomaly(&self) -> &AnomalyDetector {
        &self.anomaly
    }

    /// Catalog listing for `GET /v1/models`, scoped to the caller's org.
    pub async fn list_models(&self, meta: &RequestMeta) -> Result<serde_json::Value> {
        let api_key = self.auth.authenticate(meta.authorization.as_deref()).await?;
        let env = self.store.load_environment(&api_key.environment_id).await?;
        let models = self.store.load_models(&env.organization_id).await?;

        let data: Vec<serde_json::Value> = models
            .iter()
            .map(|model| {
                serde_json::json!({
                    "id": model.model_id,
                    "object": "model",
                    "created": 0,
                    "owned_by": model.provider_id,
                })
            })
            .collect();
        Ok(serde_json::json!({ "object": "list", "data": data }))
    }

    pub async fn chat_completions(
        self: &Arc<Self>,
        meta: RequestMeta,
        req: ChatCompletionRequest,
    ) -> Result<PipelineReply> {
        let started_at = SystemTime::now();
        let started = Instant::now();

        let route_slug = meta
            .route_id
            .clone()
            .filter(|slug| !slug.is_empty())
            .ok_or_else(|| {
                GatewayError::InvalidRequest("missing X-Route-Id or X-Feature header".to_string())
            })?;

        let api_key = self.auth.authenticate(meta.authorization.as_deref()).await?;
        if let Err(err) = self.store.touch_key(&api_key.id).await {
            tracing::debug!(key_id = %api_key.id, error = %err, "last_used_at update failed");
        }

        let env = self.store.load_environment(&api_key.environment_id).await?;
        let route = self.store.load_route(&env.id, &route_slug).await?;

        if let Some(cap) = route.max_tokens_per_request {
            if req.max_tokens.is_some_and(|max_tokens| max_tokens > cap) {
                return Err(GatewayError::InvalidRequest(format!(
                    "max_tokens exceeds route cap of {cap}"
                )));
            }
        }

        let prompt_hash = fingerprint(
            &req.model,
            &req.messages,
            req.temperature,
            req.max_tokens,
            req.tools.as_deref(),
        );

        let est_input_tokens = self.estimator.estimate_input(&req.messages);
        let mut ctx = RequestContext {
            env,
            route,
            api_key,
            request_id: meta.request_id.clone(),
            started_at,
            started,
            prompt_hash,
            tool_call_count: req.tool_call_count(),
            est_input_tokens,
            est_output_tokens: self.estimator.estimate_output(&req, None, est_input_tokens),
            est_cost_usd: 0.0,
        };

        // Latched environments never reach an upstream.
        if ctx.env.killswitch_active {
            let reason = ctx
                .env
                .killswitch_reason
                .clone()
                .unwrap_or_else(|| "kill switch active".to_string());
            let err = GatewayError::Killswitch { reason };
            self.meter
                .record(ctx.rejection_record("killswitch", &err, req.stream));
            return Err(err);
        }

        let rpm = ctx.api_key.rate_limit_rpm.or(ctx.route.max_requests_per_min);
        if let Some(rpm) = rpm {
            let bucket = format!("{}:{}", ctx.api_key.id, ctx.route.id);
            if !self.limiter.allow(&bucket, rpm) {
                let err = GatewayError::RateLimited { scope: bucket };
                self.meter
                    .record(ctx.rejection_record("throttled", &err, req.stream));
                return Err(err);
            }
        }

        // Duplicate prompts answer from the cache without touching budgets.
        if !req.stream {
            if let Some(hit) = self.cache.get(&ctx.prompt_hash) {
                let mut record = ctx.base_record(false);
                record.completed_at = Some(SystemTime::now());
                record.duration_ms = Some(ctx.started.elapsed().as_millis() as u64);
                record.status = "completed".to_string();
                record.model_identifier = hit.model.clone();
                record.input_tokens = hit.input_tokens;
                record.output_tokens = hit.output_tokens;
                record.estimated_tokens = false;
                record.attempt_number = 0;
                record.action_taken = "cached".to_string();
                self.meter.record(record);
                return Ok(PipelineReply::Unary {
                    body: hit.response,
                    cached: true,
                });
            }
        }

        let loop_tripped = self.loops.check_prompt(
            &ctx.env.id,
            &ctx.route.id,
            &ctx.prompt_hash,
            ctx.route.max_identical_prompts(),
            ctx.route.loop_window_seconds(),
        );
        if loop_tripped {
            let err = GatewayError::LoopDetected {
                reason: "identical prompt repeated too often".to_string(),
            };
            self.meter
                .record(ctx.rejection_record("blocked", &err, req.stream));
            return Err(err);
        }
        if self
            .loops
            .check_tool_calls(ctx.tool_call_count, ctx.route.max_tool_calls())
        {
            let err = GatewayError::LoopDetected {
                reason: "tool call count exceeds route limit".to_string(),
            };
            self.meter
                .record(ctx.rejection_record("blocked", &err, req.stream));
            return Err(err);
        }

        let candidates = self.store.load_models(&ctx.env.organization_id).await?;

        // Conservative pre-flight estimate: price the request against the
        // most expensive candidate before one is chosen.
        ctx.est_cost_usd = candidates
            .iter()
            .map(|model| {
                let output = self
                    .estimator
                    .estimate_output(&req, model.max_output_tokens, ctx.est_input_tokens);
                self.estimator.estimate_cost(
                    ctx.est_input_tokens,
                    output,
                    model.input_price_per_m,
                    model.output_price_per_m,
                )
            })
            .fold(0.0, f64::max);

        let decision = self
            .enforcer
            .evaluate(&ctx.env, Some(&ctx.route), ctx.est_cost_usd);
        let mut downgraded = false;
        match decision.action {
            Action::Allow => {}
            Action::Downgrade => downgraded = true,
            Action::Block => {
                let err = GatewayError::BudgetBlocked {
                    reason: decision.reason.clone(),
                };
                self.meter
                    .record(ctx.rejection_record("blocked", &err, req.stream));
                return Err(err);
            }
            Action::Throttle => {
                let err = GatewayError::BudgetThrottled {
                    reason: decision.reason.clone(),
                };
                self.meter
                    .record(ctx.rejection_record("throttled", &err, req.stream));
                return Err(err);
            }
        }

        tracing::debug!(
            request_id = %ctx.request_id,
            est_input_tokens = ctx.est_input_tokens,
            est_output_tokens = ctx.est_output_tokens,
            est_cost_usd = ctx.est_cost_usd,
            action = decision.action.as_str(),
            "budget decision"
        );

        let candidates = if downgraded {
            self.router.without_most_expensive(&candidates)
        } else {
            candidates
        };
        let try_list = self.router.select(&req, &ctx.route, &candidates)?;

        self.run_attempts(ctx, req, try_list, downgraded).await
    }

    /// Fallback loop: try each candidate in order, advancing on transient
    /// provider failures only.
    async fn run_attempts(
        self: &Arc<Self>,
        ctx: RequestContext,
        req: ChatCompletionRequest,
        try_list: Vec<ModelInfo>,
        downgraded: bool,
    ) -> Result<PipelineReply> {
        let mut fallback_reason: Option<&'static str> = None;

        for (index, model) in try_list.iter().enumerate() {
            let attempt = (index + 1) as u32;
            let is_last = index + 1 == try_list.len();

            let provider_info = self.store.load_provider(&model.provider_id).await?;
            let provider = self
                .registry
                .get(&provider_info.provider_type)
                .ok_or_else(|| {
                    GatewayError::Internal(format!(
                        "provider type {:?} not registered",
                        provider_info.provider_type
                    ))
                })?;
            let cfg = self.provider_config(&provider_info, model)?;

            let mut upstream_req = req.clone();
            upstream_req.model = model.model_id.clone();

            let action = if downgraded {
                "downgraded"
            } else if attempt > 1 {
                "fallback"
            } else {
                "allowed"
            };

            if req.stream {
                match provider.send_stream(&upstream_req, &cfg).await {
                    Ok(stream) => {
                        return Ok(self.relay_stream(
                            ctx, model.clone(), provider_info, stream, attempt,
                            fallback_reason, action,
                        ));
                    }
                    Err(err) if err.is_transient() && !is_last => {
                        fallback_reason = err.fallback_reason();
                        tracing::warn!(
                            model = %model.id,
                            attempt,
                            error = %err,
                            "streaming attempt failed, falling back"
                        );
                        continue;
                    }
                    Err(err) => {
                        return Err(self.fail_attempts(&ctx, err, attempt, req.stream));
                    }
                }
            }

            match provider.send(&upstream_req, &cfg).await {
                Ok(response) => {
                    return self
                        .finish_unary(
                            &ctx, model, &provider_info, &cfg, response, attempt,
                            fallback_reason, action,
                        )
                        .await;
                }
                Err(err) if err.is_transient() && !is_last => {
                    fallback_reason = err.fallback_reason();
                    tracing::warn!(
                        model = %model.id,
                        attempt,
                        error = %err,
                        "attempt failed, falling back"
                    );
                    continue;
                }
                Err(err) => {
                    return Err(self.fail_attempts(&ctx, err, attempt, req.stream));
                }
            }
        }

        Err(self.fail_attempts(&ctx, GatewayError::ChainExhausted, try_list.len() as u32, req.stream))
    }

    fn fail_attempts(
        &self,
        ctx: &RequestContext,
        err: GatewayError,
        attempt: u32,
        is_streaming: bool,
    ) -> GatewayError {
        let err = if err.is_transient() {
            // The last candidate failed transiently: the chain is spent.
            GatewayError::ChainExhausted
        } else {
            err
        };
        let action = if attempt > 1 { "fallback" } else { "allowed" };
        let mut record = ctx.rejection_record(action, &err, is_streaming);
        record.status = "failed".to_string();
        record.attempt_number = attempt;
        if matches!(err, GatewayError::ChainExhausted) {
            record.fallback_reason = Some("chain_exhausted".to_string());
        }
        self.meter.record(record);
        err
    }

    fn provider_config(
        &self,
        provider_info: &ProviderInfo,
        model: &ModelInfo,
    ) -> Result<ProviderConfig> {
        let api_key = match provider_info.api_key_enc.as_deref() {
            Some(sealed) => crypto::unseal(sealed, &self.master_key)?,
            None => String::new(),
        };
        Ok(ProviderConfig {
            base_url: provider_info.base_url.clone(),
            api_key,
            model_id: model.model_id.clone(),
            headers: BTreeMap::new(),
            timeout_ms: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_unary(
        self: &Arc<Self>,
        ctx: &RequestContext,
        model: &ModelInfo,
        provider_info: &ProviderInfo,
        cfg: &ProviderConfig,
        mut response: ChatCompletionResponse,
        attempt: u32,
        fallback_reason: Option<&'static str>,
        action: &str,
    ) -> Result<PipelineReply> {
        let mut action = action.to_string();
        let mut schema_valid: Option<bool> = None;
        let mut repair_attempts = 0u32;

        if let Some(schema) = ctx.route.output_schema.clone() {
            let content = response.first_content().unwrap_or_default().to_string();
            let result = self.validator.validate(&content, Some(&schema));
            if result.valid {
                schema_valid = Some(true);
            } else if !ctx.route.schema_strict {
                schema_valid = Some(false);
            } else {
                repair_attempts = 1;
                let repaired = match self
                    .repairer
                    .repair(
                        &content,
                        &result.errors,
                        &schema,
                        model,
                        &provider_info.provider_type,
                        cfg,
                    )
                    .await
                {
                    Ok(repaired) => repaired,
                    Err(err) => {
                        let mut record = ctx.rejection_record("blocked", &err, false);
                        record.status = "failed".to_string();
                        record.attempt_number = attempt;
                        record.schema_valid = Some(false);
                        record.schema_repair_attempts = repair_attempts;
                        self.meter.record(record);
                        return Err(err);
                    }
                };

                let recheck = self.validator.validate(&repaired, Some(&schema));
                if recheck.valid {
                    set_first_content(&mut response, repaired);
                    schema_valid = Some(true);
                    action = "repaired".to_string();
                } else {
                    let err = GatewayError::SchemaInvalid {
                        errors: recheck.errors,
                    };
                    let mut record = ctx.rejection_record("blocked", &err, false);
                    record.status = "failed".to_string();
                    record.attempt_number = attempt;
                    record.schema_valid = Some(false);
                    record.schema_repair_attempts = repair_attempts;
                    self.meter.record(record);
                    return Err(err);
                }
            }
        }

        let (input_tokens, output_tokens, estimated) = match response.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens, false),
            None => {
                let content_tokens =
                    count_tokens(response.first_content().unwrap_or_default()).max(1);
                (ctx.est_input_tokens, content_tokens, true)
            }
        };
        let input_cost = self
            .estimator
            .estimate_cost(input_tokens, 0, model.input_price_per_m, 0.0);
        let output_cost =
            self.estimator
                .estimate_cost(0, output_tokens, 0.0, model.output_price_per_m);
        let total_cost = input_cost + output_cost;

        let body = Bytes::from(serde_json::to_vec(&response)?);
        self.cache.set(
            ctx.prompt_hash.clone(),
            body.clone(),
            model.model_id.clone(),
            input_tokens,
            output_tokens,
            total_cost,
        );

        self.settle(&ctx.env, total_cost).await;

        let mut record = ctx.base_record(false);
        record.completed_at = Some(SystemTime::now());
        record.duration_ms = Some(ctx.started.elapsed().as_millis() as u64);
        record.status = "completed".to_string();
        record.model_id = Some(model.id.clone());
        record.provider_id = Some(provider_info.id.clone());
        record.model_identifier = model.model_id.clone();
        record.input_tokens = input_tokens;
        record.output_tokens = output_tokens;
        record.estimated_tokens = estimated;
        record.input_cost_usd = input_cost;
        record.output_cost_usd = output_cost;
        record.total_cost_usd = total_cost;
        record.attempt_number = attempt;
        record.fallback_reason = fallback_reason.map(str::to_string);
        record.schema_valid = schema_valid;
        record.schema_repair_attempts = repair_attempts;
        record.action_taken = action;
        self.meter.record(record);

        Ok(PipelineReply::Unary {
            body,
            cached: false,
        })
    }

    /// Post-flight accounting shared by unary and streaming paths:
    /// budget increment, anomaly observation, kill-switch trip. Best-effort.
    async fn settle(self: &Arc<Self>, env: &Environment, total_cost: f64) {
        if let Err(err) = self.store.add_budget_used(&env.id, total_cost).await {
            tracing::warn!(env_id = %env.id, error = %err, "budget increment failed");
        }

        let (tripped, window_total) = self.anomaly.observe(
            &env.id,
            total_cost,
            env.anomaly_multiplier,
            env.anomaly_window,
        );
        if tripped {
            let baseline = self.anomaly.baseline(&env.id).unwrap_or(0.0);
            tracing::error!(
                env_id = %env.id,
                window_total,
                baseline,
                "cost anomaly detected, activating kill switch"
            );
            if let Err(err) = self
                .killswitch
                .activate(
                    &env.id,
                    "cost anomaly detected",
                    window_total,
                    baseline,
                    env.anomaly_multiplier,
                )
                .await
            {
                tracing::error!(env_id = %env.id, error = %err, "kill switch activation failed");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn relay_stream(
        self: &Arc<Self>,
        ctx: RequestContext,
        model: ModelInfo,
        provider_info: ProviderInfo,
        upstream: ChunkStream,
        attempt: u32,
        fallback_reason: Option<&'static str>,
        action: &str,
    ) -> PipelineReply {
        let mut record = ctx.base_record(true);
        record.model_id = Some(model.id.clone());
        record.provider_id = Some(provider_info.id.clone());
        record.model_identifier = model.model_id.clone();
        record.attempt_number = attempt;
        record.fallback_reason = fallback_reason.map(str::to_string);
        record.action_taken = action.to_string();

        let finalizer = StreamFinalizer {
            pipeline: Arc::clone(self),
            record,
            env: ctx.env.clone(),
            model,
            est_input_tokens: ctx.est_input_tokens,
            started: ctx.started,
        };

        let state = RelayState {
            upstream,
            finalizer: Some(finalizer),
            usage: None,
            content_len: 0,
            done: false,
        };

        let events = futures_util::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            match state.upstream.next().await {
                Ok(Some(chunk)) => {
                    if let Some(usage) = chunk.usage {
                        state.usage = Some(usage);
                    }
                    for choice in &chunk.choices {
                        if let Some(delta) = &choice.delta {
                            if let Some(text) = delta.content.as_str() {
                                state.content_len += text.len();
                            }
                        }
                    }
                    let payload = match serde_json::to_string(&chunk) {
                        Ok(payload) => payload,
                        Err(err) => {
                            if let Some(finalizer) = state.finalizer.take() {
                                finalizer
                                    .finalize("error", state.usage, state.content_len, Some(err.to_string()))
                                    .await;
                            }
                            state.done = true;
                            return Some((Err(std::io::Error::other(err)), state));
                        }
                    };
                    let event = Bytes::from(format!("data: {payload}\n\n"));
                    Some((Ok(event), state))
                }
                Ok(None) => {
                    if let Some(finalizer) = state.finalizer.take() {
                        finalizer
                            .finalize("completed", state.usage, state.content_len, None)
                            .await;
                    }
                    state.done = true;
                    Some((Ok(Bytes::from_static(b"data: [DONE]\n\n")), state))
                }
                Err(err) => {
                    if let Some(finalizer) = state.finalizer.take() {
                        finalizer
                            .finalize("error", state.usage, state.content_len, Some(err.to_string()))
                            .await;
                    }
                    state.done = true;
                    Some((Err(std::io::Error::other(err.to_string())), state))
                }
            }
        });

        PipelineReply::Stream {
            events: events.boxed(),
        }
    }
}

/// Writes the streaming request's record once the relay ends, whichever way
/// it ends. Dropped without completing means the client went away.
struct StreamFinalizer {
    pipeline: Arc<Pipeline>,
    record: RequestRecord,
    env: Environment,
    model: ModelInfo,
    est_input_tokens: u32,
    started: Instant,
}

impl StreamFinalizer {
    async fn finalize(
        mut self,
        status: &str,
        usage: Option<Usage>,
        content_len: usize,
        error: Option<String>,
    ) {
        let (input_tokens, output_tokens, estimated) = match usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens, false),
            None => (self.est_input_tokens, (content_len / 4) as u32, true),
        };
        let estimator = Estimator::new();
        let input_cost = estimator.estimate_cost(input_tokens, 0, self.model.input_price_per_m, 0.0);
        let output_cost =
            estimator.estimate_cost(0, output_tokens, 0.0, self.model.output_price_per_m);
        let total_cost = input_cost + output_cost;

        self.pipeline.settle(&self.env, total_cost).await;

        self.record.completed_at = Some(SystemTime::now());
        self.record.duration_ms = Some(self.started.elapsed().as_millis() as u64);
        self.record.status = status.to_string();
        self.record.input_tokens = input_tokens;
        self.record.output_tokens = output_tokens;
        self.record.estimated_tokens = estimated;
        self.record.input_cost_usd = input_cost;
        self.record.output_cost_usd = output_cost;
        self.record.total_cost_usd = total_cost;
        self.record.error_message = error;
        self.pipeline.meter.record(self.record);
    }
}

struct RelayState {
    upstream: ChunkStream,
    finalizer: Option<StreamFinalizer>,
    usage: Option<Usage>,
    content_len: usize,
    done: bool,
}

impl Drop for RelayState {
    fn drop(&mut self) {
        // Client disconnect: the stream was dropped before the terminal
        // chunk. Account for what was relayed.
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let usage = self.usage;
        let content_len = self.content_len;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                finalizer
                    .finalize("client_closed", usage, content_len, None)
                    .await;
            });
        }
    }
}

fn set_first_content(response: &mut ChatCompletionResponse, content: String) {
    if let Some(message) = response
        .choices
        .first_mut()
        .and_then(|choice| choice.message.as_mut())
    {
        message.content = serde_json::Value::String(content);
    }
}
