use crate::types::{ChatCompletionRequest, Message};

/// Pre-flight token estimation. A character heuristic (1 token ~ 4 chars) is
/// enough for budget checks; exact counts arrive with the provider's usage.
#[derive(Clone, Copy, Debug, Default)]
pub struct Estimator;

impl Estimator {
    pub fn new() -> Self {
        Self
    }

    /// Estimated input tokens for a message array.
    pub fn estimate_input(&self, messages: &[Message]) -> u32 {
        let mut total = 0u32;
        for message in messages {
            total += 4; // role + separators overhead
            total += count_tokens(&message.content_text());
            if let Some(calls) = message.tool_calls.as_deref() {
                for call in calls {
                    total += count_tokens(&call.function.name);
                    total += count_tokens(&call.function.arguments);
                }
            }
        }
        total + 2 // assistant reply priming
    }

    /// Estimated output tokens: `max_tokens` when the caller set it, else a
    /// quarter of the input clamped to `[100, model max output]`.
    pub fn estimate_output(
        &self,
        req: &ChatCompletionRequest,
        model_max_output: Option<u32>,
        input_tokens: u32,
    ) -> u32 {
        if let Some(max_tokens) = req.max_tokens {
            return max_tokens;
        }
        let mut estimate = input_tokens / 4;
        if let Some(cap) = model_max_output {
            if estimate > cap {
                estimate = cap;
            }
        }
        estimate.max(100)
    }

    pub fn estimate_cost(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        input_price_per_m: f64,
        output_price_per_m: f64,
    ) -> f64 {
        let input_cost = f64::from(input_tokens) / 1_000_000.0 * input_price_per_m;
        let output_cost = f64::from(output_tokens) / 1_000_000.0 * output_price_per_m;
        input_cost + output_cost
    }
}

pub fn count_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}
