//! Intent Contract Engine
//!
//! Composable pre/post condition tree (And/Or/Not composite pattern).
//! Evaluated against the request context, the current manifest data, and
//! the circuit breaker only through the narrow `StrictnessProvider`
//! capability, breaking the cyclic reference that existed in the original
//! codebase between breaker, contracts, and kernel.

use crate::error::DecisionReason;
use crate::manifest::DomainConfig;
use crate::types::{ExecutionContext, PostConditionResult, ValidationResult};
use serde_json::Value as JsonValue;

/// Narrow capability a contract needs from the circuit breaker: just the
/// current strictness, nothing else.
pub trait StrictnessProvider {
    fn current_strictness(&self) -> f64;
}

/// Everything a `checkPre` call can see.
pub struct PreConditionInput<'a> {
    pub context: &'a ExecutionContext,
    pub domain_config: Option<&'a DomainConfig>,
    pub strictness: &'a dyn StrictnessProvider,
}

/// Every contract node exposes `check_pre` (required) and `check_post`
/// (optional; defaults to always-satisfied).
pub trait Contract: Send + Sync {
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult;

    fn check_post(
        &self,
        _context: &ExecutionContext,
        _output: &JsonValue,
    ) -> PostConditionResult {
        PostConditionResult::ok()
    }
}

pub struct AlwaysAllow;

impl Contract for AlwaysAllow {
    fn check_pre(&self, _input: &PreConditionInput) -> ValidationResult {
        ValidationResult::approve("AlwaysAllow")
    }
}

pub struct AlwaysDeny {
    pub message: String,
}

impl Contract for AlwaysDeny {
    fn check_pre(&self, _input: &PreConditionInput) -> ValidationResult {
        ValidationResult::deny("AlwaysDeny", DecisionReason::PermissionDenied, self.message.clone())
    }
}

/// Requires the agent to carry a named permission in its context parameters
/// (`permissions` array). Permission-granting itself is an external concern;
/// this contract only checks the context carries it.
pub struct RequirePermission {
    pub permission: String,
}

impl Contract for RequirePermission {
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult {
        let has_permission = input
            .context
            .parameters
            .get("permissions")
            .and_then(|v| v.as_array())
            .map(|perms| {
                perms
                    .iter()
                    .any(|p| p.as_str() == Some(self.permission.as_str()))
            })
            .unwrap_or(false);

        if has_permission {
            ValidationResult::approve("RequirePermission")
        } else {
            ValidationResult::deny(
                "RequirePermission",
                DecisionReason::PermissionDenied,
                format!("agent lacks required permission '{}'", self.permission),
            )
        }
    }
}

pub struct RequireDomainEnabled;

impl Contract for RequireDomainEnabled {
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult {
        match input.domain_config {
            Some(cfg) if cfg.enabled => ValidationResult::approve("RequireDomainEnabled"),
            Some(_) => ValidationResult::deny(
                "RequireDomainEnabled",
                DecisionReason::DomainDisabled,
                "domain is disabled",
            ),
            None => ValidationResult::deny(
                "RequireDomainEnabled",
                DecisionReason::DomainNotFound,
                "domain not found",
            ),
        }
    }
}

pub struct MaxOperationSize {
    pub cap_bytes: usize,
}

impl Contract for MaxOperationSize {
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult {
        let serialized = serde_json::to_string(&input.context.parameters).unwrap_or_default();
        if serialized.len() > self.cap_bytes {
            ValidationResult::deny(
                "MaxOperationSize",
                DecisionReason::ResourceLimit,
                format!("payload exceeds cap of {} bytes", self.cap_bytes),
            )
        } else {
            ValidationResult::approve("MaxOperationSize")
        }
    }
}

const PROTECTED_PATH_PREFIXES: &[&str] = &[
    "/etc/", "/sys/", "/proc/", "/root/", "/boot/", "/dev/", "~/.ssh", ".env",
];

pub struct ProtectedPathCheck {
    pub path_param: String,
}

impl Contract for ProtectedPathCheck {
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult {
        if let Some(JsonValue::String(path)) = input.context.parameters.get(&self.path_param) {
            if PROTECTED_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
                return ValidationResult::deny(
                    "ProtectedPathCheck",
                    DecisionReason::InvariantViolated,
                    format!("path '{}' is protected", path),
                );
            }
        }
        ValidationResult::approve("ProtectedPathCheck")
    }
}

/// Defers to whatever the manifest declares for this operation; a thin
/// adapter so manifest-declared contracts can sit in the same tree as
/// code-level ones.
pub struct RequireManifestContract {
    pub risk_level: f64,
    pub effective_threshold: f64,
}

impl Contract for RequireManifestContract {
    fn check_pre(&self, _input: &PreConditionInput) -> ValidationResult {
        if self.risk_level <= self.effective_threshold {
            ValidationResult::approve("RequireManifestContract")
        } else {
            ValidationResult::deny(
                "RequireManifestContract",
                DecisionReason::RiskTooHigh,
                format!(
                    "risk level {:.2} exceeds effective threshold {:.2}",
                    self.risk_level, self.effective_threshold
                ),
            )
        }
    }
}

/// Wraps an arbitrary closure as a contract node, for ad-hoc per-operation
/// predicates that don't warrant their own type.
pub struct CustomInvariant<F>
where
    F: Fn(&PreConditionInput) -> bool + Send + Sync,
{
    pub name: String,
    pub predicate: F,
}

impl<F> Contract for CustomInvariant<F>
where
    F: Fn(&PreConditionInput) -> bool + Send + Sync,
{
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult {
        if (self.predicate)(input) {
            ValidationResult::approve(self.name.clone())
        } else {
            ValidationResult::deny(
                self.name.clone(),
                DecisionReason::PreConditionFailed,
                format!("custom invariant '{}' failed", self.name),
            )
        }
    }
}

/// Approves only if all children approve; returns the first denial with
/// its reason preserved.
pub struct And {
    pub children: Vec<Box<dyn Contract>>,
}

impl Contract for And {
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult {
        for child in &self.children {
            let result = child.check_pre(input);
            if !result.approved {
                return result;
            }
        }
        ValidationResult::approve("And")
    }

    fn check_post(&self, context: &ExecutionContext, output: &JsonValue) -> PostConditionResult {
        for child in &self.children {
            let result = child.check_post(context, output);
            if !result.satisfied {
                return result;
            }
        }
        PostConditionResult::ok()
    }
}

/// Approves if any child approves; otherwise returns the denial of the
/// highest-severity child.
pub struct Or {
    pub children: Vec<Box<dyn Contract>>,
}

impl Contract for Or {
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult {
        let mut worst: Option<ValidationResult> = None;
        for child in &self.children {
            let result = child.check_pre(input);
            if result.approved {
                return result;
            }
            worst = match worst {
                Some(w) if w.severity >= result.severity => Some(w),
                _ => Some(result),
            };
        }
        worst.unwrap_or_else(|| ValidationResult::approve("Or"))
    }
}

/// Inverts approval. Inverting a denial produces a generic "negative
/// contract satisfied" approval rather than echoing the child's message.
pub struct Not {
    pub child: Box<dyn Contract>,
}

impl Contract for Not {
    fn check_pre(&self, input: &PreConditionInput) -> ValidationResult {
        let result = self.child.check_pre(input);
        if result.approved {
            ValidationResult::deny(
                "Not",
                DecisionReason::PreConditionFailed,
                "negated contract's child was satisfied",
            )
        } else {
            ValidationResult::approve("Not").with_detail(
                "negative_contract",
                JsonValue::String("satisfied".to_string()),
            )
        }
    }
}

/// Domain-specific post-condition contracts for trading operations,
/// showing how a domain plugs its own post-conditions into the generic
/// engine. Not exhaustive risk management — just the shapes described for
/// this kind of system.
pub mod trading {
    use super::*;

    fn decimal_param(output: &JsonValue, key: &str) -> Option<f64> {
        output.get(key).and_then(|v| v.as_f64())
    }

    /// Requires the portfolio's Sharpe ratio (present in the operation's
    /// raw output under `sharpe_ratio`) to be at least `min_ratio`.
    pub struct SharpeRatio {
        pub min_ratio: f64,
    }

    impl Contract for SharpeRatio {
        fn check_pre(&self, _input: &PreConditionInput) -> ValidationResult {
            ValidationResult::approve("SharpeRatio")
        }

        fn check_post(&self, _context: &ExecutionContext, output: &JsonValue) -> PostConditionResult {
            match decimal_param(output, "sharpe_ratio") {
                Some(ratio) if ratio >= self.min_ratio => PostConditionResult::ok(),
                Some(ratio) => PostConditionResult::fail(format!(
                    "sharpe ratio {:.2} below minimum {:.2}",
                    ratio, self.min_ratio
                )),
                None => PostConditionResult::fail("output missing 'sharpe_ratio'"),
            }
        }
    }

    /// Requires the emitted position count (`positions`, an array) to stay
    /// within `max_positions`.
    pub struct PositionLimit {
        pub max_positions: usize,
    }

    impl Contract for PositionLimit {
        fn check_pre(&self, _input: &PreConditionInput) -> ValidationResult {
            ValidationResult::approve("PositionLimit")
        }

        fn check_post(&self, _context: &ExecutionContext, output: &JsonValue) -> PostConditionResult {
            let count = output
                .get("positions")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            if count <= self.max_positions {
                PostConditionResult::ok()
            } else {
                PostConditionResult::fail(format!(
                    "{} positions exceeds limit of {}",
                    count, self.max_positions
                ))
            }
        }
    }

    /// Requires the reported drawdown (`drawdown`, a fraction) to stay at
    /// or below `max_drawdown`.
    pub struct DrawdownLimit {
        pub max_drawdown: f64,
    }

    impl Contract for DrawdownLimit {
        fn check_pre(&self, _input: &PreConditionInput) -> ValidationResult {
            ValidationResult::approve("DrawdownLimit")
        }

        fn check_post(&self, _context: &ExecutionContext, output: &JsonValue) -> PostConditionResult {
            match decimal_param(output, "drawdown") {
                Some(dd) if dd <= self.max_drawdown => PostConditionResult::ok(),
                Some(dd) => PostConditionResult::fail(format!(
                    "drawdown {:.2} exceeds limit {:.2}",
                    dd, self.max_drawdown
                )),
                None => PostConditionResult::fail("output missing 'drawdown'"),
            }
        }
    }

    /// Flags a simple order-clustering manipulation pattern: many orders
    /// for the same instrument within the emitted batch, above
    /// `max_same_instrument`.
    pub struct MarketManipulationCheck {
        pub max_same_instrument: usize,
    }

    impl Contract for MarketManipulationCheck {
        fn check_pre(&self, _input: &PreConditionInput) -> ValidationResult {
            ValidationResult::approve("MarketManipulationCheck")
        }

        fn check_post(&self, _context: &ExecutionContext, output: &JsonValue) -> PostConditionResult {
            let orders = match output.get("orders").and_then(|v| v.as_array()) {
                Some(orders) => orders,
                None => return PostConditionResult::ok(),
            };
            use std::collections::HashMap;
            let mut by_instrument: HashMap<String, usize> = HashMap::new();
            for order in orders {
                if let Some(instrument) = order.get("instrument").and_then(|v| v.as_str()) {
                    *by_instrument.entry(instrument.to_string()).or_insert(0) += 1;
                }
            }
            if let Some((instrument, count)) = by_instrument
                .into_iter()
                .find(|(_, count)| *count > self.max_same_instrument)
            {
                PostConditionResult::fail(format!(
                    "{} orders for '{}' exceeds clustering threshold {}",
                    count, instrument, self.max_same_instrument
                ))
            } else {
                PostConditionResult::ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedStrictness(f64);
    impl StrictnessProvider for FixedStrictness {
        fn current_strictness(&self) -> f64 {
            self.0
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("agent-1", "transfer_funds", HashMap::new())
    }

    #[test]
    fn and_short_circuits_on_first_denial() {
        let strictness = FixedStrictness(0.5);
        let context = ctx();
        let input = PreConditionInput {
            context: &context,
            domain_config: None,
            strictness: &strictness,
        };
        let contract = And {
            children: vec![
                Box::new(AlwaysAllow),
                Box::new(AlwaysDeny {
                    message: "nope".to_string(),
                }),
                Box::new(AlwaysAllow),
            ],
        };
        let result = contract.check_pre(&input);
        assert!(!result.approved);
        assert_eq!(result.message, "nope");
    }

    #[test]
    fn or_approves_if_any_child_approves() {
        let strictness = FixedStrictness(0.5);
        let context = ctx();
        let input = PreConditionInput {
            context: &context,
            domain_config: None,
            strictness: &strictness,
        };
        let contract = Or {
            children: vec![
                Box::new(AlwaysDeny {
                    message: "no".to_string(),
                }),
                Box::new(AlwaysAllow),
            ],
        };
        assert!(contract.check_pre(&input).approved);
    }

    #[test]
    fn not_inverts_denial_to_generic_approval() {
        let strictness = FixedStrictness(0.5);
        let context = ctx();
        let input = PreConditionInput {
            context: &context,
            domain_config: None,
            strictness: &strictness,
        };
        let contract = Not {
            child: Box::new(AlwaysDeny {
                message: "specific reason".to_string(),
            }),
        };
        let result = contract.check_pre(&input);
        assert!(result.approved);
    }

    #[test]
    fn not_denies_when_child_approves() {
        let strictness = FixedStrictness(0.5);
        let context = ctx();
        let input = PreConditionInput {
            context: &context,
            domain_config: None,
            strictness: &strictness,
        };
        let contract = Not {
            child: Box::new(AlwaysAllow),
        };
        assert!(!contract.check_pre(&input).approved);
    }

    #[test]
    fn sharpe_ratio_post_condition() {
        let contract = trading::SharpeRatio { min_ratio: 1.5 };
        let context = ctx();
        let good = serde_json::json!({"sharpe_ratio": 2.0});
        let bad = serde_json::json!({"sharpe_ratio": 0.5});
        assert!(contract.check_post(&context, &good).satisfied);
        assert!(!contract.check_post(&context, &bad).satisfied);
    }

    #[test]
    fn market_manipulation_flags_clustering() {
        let contract = trading::MarketManipulationCheck {
            max_same_instrument: 2,
        };
        let context = ctx();
        let output = serde_json::json!({"orders": [
            {"instrument": "AAPL"}, {"instrument": "AAPL"}, {"instrument": "AAPL"}
        ]});
        assert!(!contract.check_post(&context, &output).satisfied);
    }
}
