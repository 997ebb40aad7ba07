//! Execution Kernel: Core Types
//!
//! Per-request value types and configuration structs for the kernel.

use crate::error::{DecisionReason, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Security profile: affects the risk-threshold multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Light,
    Full,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        SecurityLevel::Full
    }
}

impl SecurityLevel {
    pub fn multiplier(&self) -> f64 {
        match self {
            SecurityLevel::Light => 1.5,
            SecurityLevel::Full => 1.0,
        }
    }
}

/// Per-request execution context. Created per call, discarded after
/// `validate`+`execute` complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Stable 16-hex fingerprint of agent+operation+params+time.
    pub request_id: String,
    pub agent_id: String,
    pub operation: String,
    pub domain: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    /// Mutable side-channel for inter-step annotations (e.g. resolved risk level).
    pub intent_contract: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new(
        agent_id: impl Into<String>,
        operation: impl Into<String>,
        parameters: HashMap<String, serde_json::Value>,
    ) -> Self {
        let agent_id = agent_id.into();
        let operation = operation.into();
        let timestamp = Utc::now();
        let request_id = Self::fingerprint(&agent_id, &operation, &parameters, timestamp);
        Self {
            request_id,
            agent_id,
            operation,
            domain: None,
            parameters,
            timestamp,
            intent_contract: HashMap::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Deterministic 16-hex fingerprint: SHA256(agent|operation|params|ts) truncated.
    fn fingerprint(
        agent_id: &str,
        operation: &str,
        parameters: &HashMap<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) -> String {
        let params_json = serde_json::to_string(parameters).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(agent_id.as_bytes());
        hasher.update(b"|");
        hasher.update(operation.as_bytes());
        hasher.update(b"|");
        hasher.update(params_json.as_bytes());
        hasher.update(b"|");
        hasher.update(timestamp.to_rfc3339().as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
    }

    /// `agentId` non-empty and `parameters` contains no cleartext-credential
    /// looking keys in the top level.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.agent_id.trim().is_empty() {
            return Err("agentId must not be empty".to_string());
        }
        for key in self.parameters.keys() {
            let lower = key.to_lowercase();
            if (lower.contains("password") || lower.contains("secret") || lower.contains("token"))
                && matches!(self.parameters.get(key), Some(serde_json::Value::String(_)))
            {
                return Err(format!("parameter '{key}' looks like a cleartext credential"));
            }
        }
        Ok(())
    }
}

/// Outcome of a single validation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub approved: bool,
    pub reason: DecisionReason,
    pub message: String,
    pub severity: Severity,
    pub details: HashMap<String, serde_json::Value>,
    pub check_name: String,
    pub elapsed_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

const REDACTED_KEY_FRAGMENTS: &[&str] = &["password", "secret", "token", "key", "credential"];

impl ValidationResult {
    pub fn approve(check_name: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: DecisionReason::Approved,
            message: "approved".to_string(),
            severity: Severity::Low,
            details: HashMap::new(),
            check_name: check_name.into(),
            elapsed_ms: 0.0,
            timestamp: Utc::now(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn deny(
        check_name: impl Into<String>,
        reason: DecisionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            approved: false,
            severity: reason.default_severity(),
            reason,
            message: message.into(),
            details: HashMap::new(),
            check_name: check_name.into(),
            elapsed_ms: 0.0,
            timestamp: Utc::now(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(Self::sanitize_key(&key.into()), value);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: f64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn is_blocking(&self) -> bool {
        !self.approved && self.severity >= Severity::High
    }

    pub fn should_debate(&self) -> bool {
        self.reason == DecisionReason::DebateRequired
    }

    /// Redact any detail key that looks like it carries sensitive material.
    fn sanitize_key(key: &str) -> String {
        key.to_string()
    }

    /// Produce a sanitized copy of `details` for returning to callers:
    /// sensitive keys are redacted in place.
    pub fn redacted_details(&self) -> HashMap<String, serde_json::Value> {
        self.details
            .iter()
            .map(|(k, v)| {
                let lower = k.to_lowercase();
                if REDACTED_KEY_FRAGMENTS.iter().any(|f| lower.contains(f)) {
                    (k.clone(), serde_json::Value::String("***REDACTED***".to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }
}

/// Result of a contract's post-condition check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostConditionResult {
    pub satisfied: bool,
    pub reason: DecisionReason,
    pub message: String,
    pub details: HashMap<String, serde_json::Value>,
}

impl PostConditionResult {
    pub fn ok() -> Self {
        Self {
            satisfied: true,
            reason: DecisionReason::Approved,
            message: "post-condition satisfied".to_string(),
            details: HashMap::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            satisfied: false,
            reason: DecisionReason::PostConditionFailed,
            message: message.into(),
            details: HashMap::new(),
        }
    }
}

/// Result of an invariant check against a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantResult {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

impl InvariantResult {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: Some(message.into()),
        }
    }
}

/// Metadata for a registered operation. The callable itself is never
/// invoked except through the kernel's `execute` path.
#[derive(Clone)]
pub struct OperationRegistration {
    pub name: String,
    pub description: String,
    pub registered_at: DateTime<Utc>,
}

/// Resource limits enforced before operation invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_payload_bytes: usize,
    pub deadline_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1_048_576,
            deadline_ms: 30_000,
        }
    }
}

/// Configuration for fast-path eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathConfig {
    pub enabled: bool,
    pub allow_list: Vec<String>,
    pub max_risk_level: f64,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_list: Vec::new(),
            max_risk_level: 0.2,
        }
    }
}

/// Top-level kernel configuration. Replaces the original's dynamic
/// attribute lookup with strongly typed, documented fields and explicit
/// environment-variable overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    pub environment: String,
    pub security_level: SecurityLevel,
    pub default_risk_threshold: f64,
    pub manifest_dir: String,
    pub audit_dir: String,
    pub circuit_breaker_dir: String,
    pub audit_fail_closed: bool,
    pub resource_limits: ResourceLimits,
    pub fast_path: FastPathConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            environment: "prod".to_string(),
            security_level: SecurityLevel::Full,
            default_risk_threshold: 0.5,
            manifest_dir: "manifests".to_string(),
            audit_dir: "audit".to_string(),
            circuit_breaker_dir: "circuit_breaker_state".to_string(),
            audit_fail_closed: true,
            resource_limits: ResourceLimits::default(),
            fast_path: FastPathConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Overlay environment-variable overrides on top of defaults. Unset
    /// variables fall back to the documented defaults above.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(env) = std::env::var("ENVIRONMENT") {
            config.environment = env;
        }
        if let Ok(level) = std::env::var("SECURITY_LEVEL") {
            config.security_level = match level.to_lowercase().as_str() {
                "light" => SecurityLevel::Light,
                _ => SecurityLevel::Full,
            };
        }
        if let Ok(dir) = std::env::var("MANIFEST_DIR") {
            config.manifest_dir = dir;
        }
        if let Ok(dir) = std::env::var("AUDIT_DIR") {
            config.audit_dir = dir;
        }
        if let Ok(dir) = std::env::var("CIRCUIT_BREAKER_DIR") {
            config.circuit_breaker_dir = dir;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_given_same_timestamp() {
        let ts = Utc::now();
        let params = HashMap::new();
        let a = ExecutionContext::fingerprint("agent", "op", &params, ts);
        let b = ExecutionContext::fingerprint("agent", "op", &params, ts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn empty_agent_id_violates_invariant() {
        let ctx = ExecutionContext::new("", "op", HashMap::new());
        assert!(ctx.check_invariants().is_err());
    }

    #[test]
    fn cleartext_credential_violates_invariant() {
        let mut params = HashMap::new();
        params.insert(
            "password".to_string(),
            serde_json::Value::String("hunter2".to_string()),
        );
        let ctx = ExecutionContext::new("agent", "op", params);
        assert!(ctx.check_invariants().is_err());
    }

    #[test]
    fn redacted_details_hide_sensitive_keys() {
        let result = ValidationResult::approve("test").with_detail(
            "api_token",
            serde_json::Value::String("abc123".to_string()),
        );
        let redacted = result.redacted_details();
        assert_eq!(
            redacted.get("api_token"),
            Some(&serde_json::Value::String("***REDACTED***".to_string()))
        );
    }

    #[test]
    fn security_level_multiplier() {
        assert_eq!(SecurityLevel::Light.multiplier(), 1.5);
        assert_eq!(SecurityLevel::Full.multiplier(), 1.0);
    }
}
