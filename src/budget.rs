use crate::types::{BudgetMode, Environment, Route};

/// What the budget enforcer decided for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Allow,
    Downgrade,
    Throttle,
    Block,
}

impl Action {
    /// Label used in metering records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allowed",
            Action::Downgrade => "downgraded",
            Action::Throttle => "throttled",
            Action::Block => "blocked",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub remaining_usd: f64,
    pub used_usd: f64,
    pub limit_usd: f64,
}

impl Decision {
    fn allow() -> Self {
        Self {
            action: Action::Allow,
            reason: String::new(),
            remaining_usd: 0.0,
            used_usd: 0.0,
            limit_usd: 0.0,
        }
    }
}

/// Pure budget decisioning over environment and route. Downgrade does not
/// pick a cheaper model itself; the router drops the most expensive tier.
#[derive(Clone, Copy, Debug, Default)]
pub struct Enforcer;

impl Enforcer {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        env: &Environment,
        route: Option<&Route>,
        estimated_cost_usd: f64,
    ) -> Decision {
        let Some(limit) = env.budget_limit_usd else {
            return Decision::allow();
        };

        let used = env.budget_used_usd;
        let remaining = limit - used;

        if env.budget_mode == BudgetMode::Hard {
            if remaining <= 0.0 {
                return Decision {
                    action: Action::Block,
                    reason: "environment hard budget exceeded".to_string(),
                    remaining_usd: remaining,
                    used_usd: used,
                    limit_usd: limit,
                };
            }
            if remaining < estimated_cost_usd {
                return Decision {
                    action: Action::Block,
                    reason: "estimated cost exceeds remaining budget".to_string(),
                    remaining_usd: remaining,
                    used_usd: used,
                    limit_usd: limit,
                };
            }
        }

        if env.budget_mode == BudgetMode::Soft {
            if remaining <= 0.0 {
                return Decision {
                    action: Action::Throttle,
                    reason: "environment soft budget exceeded, throttling".to_string(),
                    remaining_usd: remaining,
                    used_usd: used,
                    limit_usd: limit,
                };
            }
            if remaining / limit < 0.1 {
                return Decision {
                    action: Action::Downgrade,
                    reason: "less than 10% budget remaining, downgrading model".to_string(),
                    remaining_usd: remaining,
                    used_usd: used,
                    limit_usd: limit,
                };
            }
        }

        // Route-level budget is observed only; it does not veto.
        let reason = match route.and_then(|route| route.budget_limit_usd) {
            Some(route_limit) => format!("route budget limit ${route_limit:.2} observed"),
            None => String::new(),
        };

        Decision {
            action: Action::Allow,
            reason,
            remaining_usd: remaining,
            used_usd: used,
            limit_usd: limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn env(mode: BudgetMode, limit: Option<f64>, used: f64) -> Environment {
        Environment {
            id: "e1".to_string(),
            project_id: "p1".to_string(),
            organization_id: "org1".to_string(),
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

    #[test]
    fn no_limit_always_allows() {
        let decision = Enforcer::new().evaluate(&env(BudgetMode::Hard, None, 1e9), None, 1e9);
        assert_eq!(decision.action, Action::Allow);
    }

    #[test]
    fn hard_budget_blocks_when_exhausted() {
        let decision =
            Enforcer::new().evaluate(&env(BudgetMode::Hard, Some(100.0), 100.0), None, 0.01);
        assert_eq!(decision.action, Action::Block);
        assert_eq!(decision.remaining_usd, 0.0);
        assert_eq!(decision.limit_usd, 100.0);
    }

    #[test]
    fn hard_budget_blocks_when_estimate_exceeds_remaining() {
        let decision =
            Enforcer::new().evaluate(&env(BudgetMode::Hard, Some(100.0), 99.5), None, 1.0);
        assert_eq!(decision.action, Action::Block);
        assert!(decision.reason.contains("estimated cost"));
    }

    #[test]
    fn hard_budget_allows_within_remaining() {
        let decision =
            Enforcer::new().evaluate(&env(BudgetMode::Hard, Some(100.0), 50.0), None, 0.003);
        assert_eq!(decision.action, Action::Allow);
        assert_eq!(decision.used_usd, 50.0);
    }

    #[test]
    fn soft_budget_throttles_when_exhausted() {
        let decision =
            Enforcer::new().evaluate(&env(BudgetMode::Soft, Some(100.0), 101.0), None, 0.01);
        assert_eq!(decision.action, Action::Throttle);
    }

    #[test]
    fn soft_budget_downgrades_under_ten_percent() {
        let decision =
            Enforcer::new().evaluate(&env(BudgetMode::Soft, Some(100.0), 95.0), None, 0.01);
        assert_eq!(decision.action, Action::Downgrade);

        // Exactly 10% remaining is not a downgrade.
        let decision =
            Enforcer::new().evaluate(&env(BudgetMode::Soft, Some(100.0), 90.0), None, 0.01);
        assert_eq!(decision.action, Action::Allow);
    }

    #[test]
    fn route_budget_only_annotates() {
        let route = Route {
            id: "r1".to_string(),
            environment_id: "e1".to_string(),
            slug: "chat".to_string(),
            name: "Chat".to_string(),
            is_active: true,
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
            budget_limit_usd: Some(5.0),
        };
        let decision = Enforcer::new().evaluate(
            &env(BudgetMode::Hard, Some(100.0), 50.0),
            Some(&route),
            0.01,
        );
        assert_eq!(decision.action, Action::Allow);
        assert!(decision.reason.contains("route budget"));
    }
}
