use std::sync::Arc;

use serde_json::Value;

use crate::providers::{ProviderConfig, Registry};
use crate::types::{ChatCompletionRequest, Message, ModelInfo};
use crate::{GatewayError, Result};

/// Result of validating model output against a route's schema.
#[derive(Clone, Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }
}

/// Structural subset of JSON Schema: type checks, required fields, and
/// recursion into declared object properties. Enough to keep structured
/// outputs honest without a full validator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, output: &str, schema: Option<&Value>) -> ValidationResult {
        let Some(schema) = schema else {
            return ValidationResult::ok();
        };

        let parsed: Value = match serde_json::from_str(output) {
            Ok(parsed) => parsed,
            Err(err) => {
                return ValidationResult {
                    valid: false,
                    errors: vec![format!("output is not valid JSON: {err}")],
                }
            }
        };

        let Some(schema_map) = schema.as_object() else {
            return ValidationResult::ok();
        };

        let errors = validate_value(&parsed, schema_map);
        ValidationResult {
            valid: errors.is_empty(),
            errors,
        }
    }
}

fn validate_value(data: &Value, schema: &serde_json::Map<String, Value>) -> Vec<String> {
    let mut errors = Vec::new();
    let expected_type = schema.get("type").and_then(Value::as_str).unwrap_or("");

    match expected_type {
        "object" => {
            let Some(obj) = data.as_object() else {
                errors.push("expected object type".to_string());
                return errors;
            };
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for field in required.iter().filter_map(Value::as_str) {
                    if !obj.contains_key(field) {
                        errors.push(format!("missing required field: {field}"));
                    }
                }
            }
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (key, prop_schema) in properties {
                    let (Some(value), Some(prop_schema)) = (obj.get(key), prop_schema.as_object())
                    else {
                        continue;
                    };
                    errors.extend(validate_value(value, prop_schema));
                }
            }
        }
        "array" => {
            if !data.is_array() {
                errors.push("expected array type".to_string());
            }
        }
        "string" => {
            if !data.is_string() {
                errors.push("expected string type".to_string());
            }
        }
        "number" | "integer" => {
            if !data.is_number() {
                errors.push("expected number type".to_string());
            }
        }
        "boolean" => {
            if !data.is_boolean() {
                errors.push("expected boolean type".to_string());
            }
        }
        _ => {}
    }

    errors
}

/// Asks the model to fix schema-invalid output. One follow-up call, no
/// markdown, trimmed content back.
pub struct Repairer {
    registry: Arc<Registry>,
}

impl Repairer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub async fn repair(
        &self,
        original_output: &str,
        validation_errors: &[String],
        output_schema: &Value,
        repair_model: &ModelInfo,
        provider_type: &str,
        cfg: &ProviderConfig,
    ) -> Result<String> {
        let provider = self.registry.get(provider_type).ok_or_else(|| {
            GatewayError::Internal(format!("repair provider type {provider_type:?} not found"))
        })?;

        let schema_json =
            serde_json::to_string_pretty(output_schema).unwrap_or_else(|_| "{}".to_string());
        let errors = validation_errors.join("\n- ");

        let prompt = format!(
            "The following JSON output does not match the required schema.\n\n\
             Output:\n{original_output}\n\n\
             Validation errors:\n- {errors}\n\n\
             Required schema:\n{schema_json}\n\n\
             Return ONLY the corrected JSON. No explanations, no markdown, just valid JSON."
        );

        let req = ChatCompletionRequest {
            model: repair_model.model_id.clone(),
            messages: vec![Message::user(prompt)],
            stream: false,
            temperature: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stop: None,
            top_p: None,
            n: None,
            user: None,
        };

        let response = provider.send(&req, cfg).await?;
        let content = response.first_content().ok_or_else(|| {
            GatewayError::InvalidResponse("repair response has no content".to_string())
        })?;
        Ok(content.trim().to_string())
    }
}
