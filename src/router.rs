use std::collections::HashMap;

use crate::types::{ChatCompletionRequest, ModelInfo, Route};
use crate::{GatewayError, Result};

/// Caps the try-list when scoring picks the order. Explicit fallback chains
/// are returned uncapped.
const MAX_CANDIDATES: usize = 3;

/// Selects the ordered list of models to try (primary + fallbacks) for a
/// request under a route's policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct RouterEngine;

impl RouterEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn select(
        &self,
        req: &ChatCompletionRequest,
        route: &Route,
        candidates: &[ModelInfo],
    ) -> Result<Vec<ModelInfo>> {
        let filtered = filter_by_capabilities(candidates, req);
        if filtered.is_empty() {
            return Err(GatewayError::NoCapableModel);
        }

        let filtered = if route.allowed_models.is_empty() {
            filtered
        } else {
            let allowed = filter_by_allowed(filtered, &route.allowed_models);
            if allowed.is_empty() {
                return Err(GatewayError::NoAllowedModel);
            }
            allowed
        };

        // An explicit chain replaces scoring entirely.
        if !route.fallback_chain.is_empty() {
            return Ok(resolve_chain(&route.fallback_chain, filtered));
        }

        let mut scored = score(filtered, route);

        if let Some(preferred) = route.preferred_model.as_deref() {
            apply_preference(&mut scored, preferred);
        }

        scored.truncate(MAX_CANDIDATES);
        Ok(scored)
    }

    /// Downgrade support: the enforcer's Downgrade decision re-runs selection
    /// without the most expensive candidate.
    pub fn without_most_expensive(&self, candidates: &[ModelInfo]) -> Vec<ModelInfo> {
        let Some(most_expensive) = candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.combined_price_per_m()
                    .partial_cmp(&b.combined_price_per_m())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx)
        else {
            return Vec::new();
        };
        candidates
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != most_expensive)
            .map(|(_, model)| model.clone())
            .collect()
    }
}

fn filter_by_capabilities(models: &[ModelInfo], req: &ChatCompletionRequest) -> Vec<ModelInfo> {
    models
        .iter()
        .filter(|model| {
            if req.stream && !model.supports_streaming {
                return false;
            }
            if req.wants_tools() && !model.supports_tools {
                return false;
            }
            if req.wants_json_mode() && !model.supports_json_mode {
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

fn filter_by_allowed(models: Vec<ModelInfo>, allowed: &[String]) -> Vec<ModelInfo> {
    models
        .into_iter()
        .filter(|model| allowed.iter().any(|id| *id == model.id))
        .collect()
}

fn resolve_chain(chain: &[String], available: Vec<ModelInfo>) -> Vec<ModelInfo> {
    let mut by_id: HashMap<&str, &ModelInfo> = HashMap::with_capacity(available.len());
    for model in &available {
        by_id.insert(model.id.as_str(), model);
    }
    chain
        .iter()
        .filter_map(|id| by_id.get(id.as_str()).map(|model| (*model).clone()))
        .collect()
}

fn score(models: Vec<ModelInfo>, route: &Route) -> Vec<ModelInfo> {
    if models.is_empty() {
        return models;
    }

    let costs: Vec<f64> = models
        .iter()
        .map(|model| model.combined_price_per_m())
        .collect();
    let latencies: Vec<f64> = models
        .iter()
        .map(|model| model.avg_latency_ms.map(f64::from).unwrap_or(0.0))
        .collect();

    let (min_cost, max_cost) = min_max(&costs);
    let (min_lat, max_lat) = min_max(&latencies);

    let mut scored: Vec<(ModelInfo, f64)> = models
        .into_iter()
        .zip(costs)
        .zip(latencies)
        .map(|((model, cost), latency)| {
            let cost_norm = normalize_inverted(cost, min_cost, max_cost);
            let lat_norm = normalize_inverted(latency, min_lat, max_lat);
            let rel_norm = model.reliability_pct / 100.0;
            let score = route.weight_cost * cost_norm
                + route.weight_latency * lat_norm
                + route.weight_reliability * rel_norm;
            (model, score)
        })
        .collect();

    // Stable sort: ties keep catalog order.
    scored.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(model, _)| model).collect()
}

fn min_max(values: &[f64]) -> (f64, f64) {
    let mut min = values[0];
    let mut max = values[0];
    for value in values.iter().copied() {
        if value < min {
            min = value;
        }
        if value > max {
            max = value;
        }
    }
    (min, max)
}

/// Lower raw values score higher; degenerate ranges score 1.0 across the board.
fn normalize_inverted(value: f64, min: f64, max: f64) -> f64 {
    if max > min {
        1.0 - (value - min) / (max - min)
    } else {
        1.0
    }
}

fn apply_preference(models: &mut Vec<ModelInfo>, preferred_id: &str) {
    if let Some(idx) = models.iter().position(|model| model.id == preferred_id) {
        let preferred = models.remove(idx);
        models.insert(0, preferred);
    }
}
