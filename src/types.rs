use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- OpenAI-compatible wire types ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ChatCompletionRequest {
    pub fn wants_tools(&self) -> bool {
        self.tools.as_deref().is_some_and(|tools| !tools.is_empty())
    }

    pub fn wants_json_mode(&self) -> bool {
        self.response_format
            .as_ref()
            .is_some_and(|format| format.format_type == "json_object")
    }

    pub fn tool_call_count(&self) -> u32 {
        self.messages
            .iter()
            .map(|message| {
                message
                    .tool_calls
                    .as_deref()
                    .map(|calls| calls.len() as u32)
                    .unwrap_or(0)
            })
            .sum()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    // Streaming deltas omit the role after the first chunk.
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Value::String(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Flattens content into text for token counting; non-string content is
    /// counted over its JSON form.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub call_type: String,
    #[serde(default)]
    pub function: FunctionCall,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionResponse {
    /// Text content of the first choice, when present.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.message.as_ref())
            .and_then(|message| message.content.as_str())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// SSE streaming chunk; same shape as the unary response with deltas.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

// --- Domain types ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub tier: String,
    pub budget_mode: BudgetMode,
    #[serde(default)]
    pub budget_limit_usd: Option<f64>,
    #[serde(default)]
    pub budget_used_usd: f64,
    #[serde(default)]
    pub killswitch_active: bool,
    #[serde(default)]
    pub killswitch_reason: Option<String>,
    #[serde(default)]
    pub killswitch_at: Option<SystemTime>,
    pub anomaly_multiplier: f64,
    pub anomaly_window: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    Hard,
    Soft,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub environment_id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub preferred_model: Option<String>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub constraints: BTreeMap<String, Value>,
    #[serde(default)]
    pub weight_cost: f64,
    #[serde(default)]
    pub weight_latency: f64,
    #[serde(default)]
    pub weight_reliability: f64,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub schema_strict: bool,
    #[serde(default)]
    pub max_tokens_per_request: Option<u32>,
    #[serde(default)]
    pub max_requests_per_min: Option<u32>,
    #[serde(default)]
    pub guardrail_settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub budget_limit_usd: Option<f64>,
}

impl Route {
    fn guardrail_u32(&self, key: &str) -> Option<u32> {
        self.guardrail_settings
            .get(key)
            .and_then(Value::as_u64)
            .map(|value| value as u32)
    }

    pub fn max_identical_prompts(&self) -> u32 {
        self.guardrail_u32("max_identical_prompts").unwrap_or(0)
    }

    pub fn loop_window_seconds(&self) -> u32 {
        self.guardrail_u32("loop_window_seconds").unwrap_or(60)
    }

    pub fn max_tool_calls(&self) -> u32 {
        self.guardrail_u32("max_tool_calls").unwrap_or(0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub model_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub context_window: u32,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    pub input_price_per_m: f64,
    pub output_price_per_m: f64,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_json_mode: bool,
    #[serde(default)]
    pub avg_latency_ms: Option<u32>,
    #[serde(default)]
    pub p99_latency_ms: Option<u32>,
    #[serde(default)]
    pub reliability_pct: f64,
    #[serde(default)]
    pub is_active: bool,
}

impl ModelInfo {
    /// Combined per-million price used for cost ranking and downgrades.
    pub fn combined_price_per_m(&self) -> f64 {
        self.input_price_per_m + self.output_price_per_m
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub provider_type: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key_enc: Option<String>,
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub environment_id: String,
    #[serde(default)]
    pub route_id: Option<String>,
    pub key_hash: String,
    #[serde(default)]
    pub previous_key_hash: Option<String>,
    #[serde(default)]
    pub rotated_at: Option<SystemTime>,
    #[serde(default)]
    pub grace_period: Option<Duration>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub last_used_at: Option<SystemTime>,
}

/// Post-flight metering row; one per accepted request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestRecord {
    pub environment_id: String,
    pub route_id: Option<String>,
    pub api_key_id: String,
    pub request_id: String,
    pub started_at: SystemTime,
    pub completed_at: Option<SystemTime>,
    pub duration_ms: Option<u64>,
    pub status: String,
    pub model_id: Option<String>,
    pub provider_id: Option<String>,
    pub model_identifier: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub estimated_tokens: bool,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub total_cost_usd: f64,
    pub prompt_hash: Option<String>,
    pub is_streaming: bool,
    pub tool_call_count: u32,
    pub attempt_number: u32,
    pub fallback_reason: Option<String>,
    pub schema_valid: Option<bool>,
    pub schema_repair_attempts: u32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub action_taken: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub environment_id: String,
    pub severity: String,
    pub status: String,
    pub incident_type: String,
    pub title: String,
    pub description: String,
    pub trigger_data: Value,
    pub killswitch_activated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_chat_request() {
        let raw = r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(req.model, "gpt-4o-mini");
        assert!(!req.stream);
        assert!(!req.wants_tools());
        assert!(!req.wants_json_mode());
        assert_eq!(req.messages[0].content_text(), "hi");
    }

    #[test]
    fn json_mode_detection_requires_json_object_type() {
        let raw = r#"{
            "model": "m",
            "messages": [],
            "response_format": {"type": "json_object"}
        }"#;
        let req: ChatCompletionRequest = serde_json::from_str(raw).expect("parse");
        assert!(req.wants_json_mode());

        let raw = r#"{"model":"m","messages":[],"response_format":{"type":"text"}}"#;
        let req: ChatCompletionRequest = serde_json::from_str(raw).expect("parse");
        assert!(!req.wants_json_mode());
    }

    #[test]
    fn tool_call_count_sums_across_messages() {
        let raw = r#"{
            "model": "m",
            "messages": [
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "a", "type": "function", "function": {"name": "f", "arguments": "{}"}},
                    {"id": "b", "type": "function", "function": {"name": "g", "arguments": "{}"}}
                ]},
                {"role": "tool", "content": "ok", "tool_call_id": "a"}
            ]
        }"#;
        let req: ChatCompletionRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(req.tool_call_count(), 2);
    }

    #[test]
    fn budget_mode_round_trips_lowercase() {
        assert_eq!(
            serde_json::to_string(&BudgetMode::Hard).expect("ser"),
            "\"hard\""
        );
        let mode: BudgetMode = serde_json::from_str("\"soft\"").expect("de");
        assert_eq!(mode, BudgetMode::Soft);
    }

    #[test]
    fn route_guardrails_fall_back_to_defaults() {
        let mut settings = BTreeMap::new();
        settings.insert(
            "max_identical_prompts".to_string(),
            serde_json::json!(5u32),
        );
        let route = Route {
            id: "r1".to_string(),
            environment_id: "e1".to_string(),
            slug: "chat".to_string(),
            name: "Chat".to_string(),
            is_active: true,
            allowed_models: Vec::new(),
            preferred_model: None,
            fallback_chain: Vec::new(),
            constraints: BTreeMap::new(),
            weight_cost: 1.0,
            weight_latency: 0.0,
            weight_reliability: 0.0,
            output_schema: None,
            schema_strict: false,
            max_tokens_per_request: None,
            max_requests_per_min: None,
            guardrail_settings: settings,
            budget_limit_usd: None,
        };
        assert_eq!(route.max_identical_prompts(), 5);
        assert_eq!(route.loop_window_seconds(), 60);
        assert_eq!(route.max_tool_calls(), 0);
    }
}
