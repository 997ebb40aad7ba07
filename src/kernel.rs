//! Execution Kernel
//!
//! The orchestrator: the only entry point through which a registered
//! operation can actually run. `validate` runs the fail-fast check chain
//! and returns a decision without touching the operation; `execute` calls
//! `validate`, then (independently, matching `execution_kernel.py`'s own
//! double-check) enforces whitelist membership and re-runs the
//! registered contract's pre-condition before invoking the callable, and
//! its post-condition plus every invariant again afterward.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use crate::audit::{AuditEventType, AuditSink};
use crate::circuit_breaker::{AutonomyLevel, CircuitBreakerConfig, DynamicCircuitBreaker};
use crate::contract::{Contract, PreConditionInput};
use crate::dsl::{self, EvalContext};
use crate::error::{DecisionReason, KernelError, Result, Severity};
use crate::invariants::InvariantRegistry;
use crate::manifest::ManifestStore;
use crate::metrics::{KernelMetrics, KernelStatsSnapshot};
use crate::types::{ExecutionContext, KernelConfig, OperationRegistration, ValidationResult};

/// Process-wide default kernel. No other piece of this crate touches
/// global mutable state; this is the single sanctioned exception (design
/// notes call it out explicitly), and it stays unset unless a caller
/// opts in via `install_default_kernel`.
static DEFAULT_KERNEL: once_cell::sync::OnceCell<Arc<ExecutionKernel>> = once_cell::sync::OnceCell::new();

/// Installs the process-wide default kernel. Returns the kernel back as
/// an error if one was already installed — this is deliberately
/// set-once, not overwrite-on-call, so admin code can't silently swap
/// the trusted boundary out from under in-flight callers.
pub fn install_default_kernel(kernel: ExecutionKernel) -> std::result::Result<(), ExecutionKernel> {
    DEFAULT_KERNEL
        .set(Arc::new(kernel))
        .map_err(|arc| Arc::try_unwrap(arc).unwrap_or_else(|_| unreachable!("just constructed, uniquely owned")))
}

/// The process-wide default kernel, if one has been installed.
pub fn default_kernel() -> Option<Arc<ExecutionKernel>> {
    DEFAULT_KERNEL.get().cloned()
}

/// Raw output of an operation callable: either a JSON payload or an
/// opaque error string surfaced as `OperationFailed`.
pub type OperationOutcome = std::result::Result<JsonValue, String>;
pub type OperationFuture = Pin<Box<dyn Future<Output = OperationOutcome> + Send>>;

/// An opaque, registered operation. The kernel never inspects what this
/// does; it only ever calls it after the whole validation chain passes,
/// which is the whitelist-only execution invariant.
pub type OperationCallable = Box<dyn Fn(HashMap<String, JsonValue>) -> OperationFuture + Send + Sync>;

struct RegisteredOperation {
    registration: OperationRegistration,
    callable: OperationCallable,
}

/// The execution kernel: the single trusted boundary every operation
/// passes through. Holds the manifest store, circuit breaker, invariant
/// registry, audit sink and the whitelist of registered operations.
pub struct ExecutionKernel {
    config: KernelConfig,
    manifest: ManifestStore,
    circuit_breaker: Arc<DynamicCircuitBreaker>,
    invariants: InvariantRegistry,
    audit_sink: Arc<dyn AuditSink>,
    operations: RwLock<HashMap<String, RegisteredOperation>>,
    contracts: RwLock<HashMap<String, Arc<dyn Contract>>>,
    metrics: KernelMetrics,
}

impl ExecutionKernel {
    pub fn new(config: KernelConfig, audit_sink: Arc<dyn AuditSink>) -> Self {
        let manifest = ManifestStore::with_manifest_dir(&config.manifest_dir, config.environment.clone());
        let invariants = InvariantRegistry::with_builtins(config.resource_limits.max_payload_bytes);
        let circuit_breaker = Arc::new(DynamicCircuitBreaker::new(CircuitBreakerConfig::default()));
        if let Some(state_file) = Self::circuit_state_path(&config) {
            if state_file.exists() {
                match circuit_breaker.load_state(&state_file) {
                    Ok(()) => tracing::info!(path = %state_file.display(), "restored circuit breaker state"),
                    Err(e) => tracing::warn!(path = %state_file.display(), error = %e, "failed to restore circuit breaker state, starting GREEN"),
                }
            }
        }
        Self {
            config,
            manifest,
            circuit_breaker,
            invariants,
            audit_sink,
            operations: RwLock::new(HashMap::new()),
            contracts: RwLock::new(HashMap::new()),
            metrics: KernelMetrics::new(),
        }
    }

    fn circuit_state_path(config: &KernelConfig) -> Option<std::path::PathBuf> {
        if config.circuit_breaker_dir.is_empty() {
            return None;
        }
        Some(std::path::Path::new(&config.circuit_breaker_dir).join("state.json"))
    }

    /// Persists the circuit breaker's current snapshot to
    /// `circuit_breaker_dir/state.json`, creating the directory if
    /// needed. A no-op if `circuit_breaker_dir` is empty.
    pub fn persist_circuit_state(&self) -> Result<()> {
        let Some(path) = Self::circuit_state_path(&self.config) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KernelError::Internal(format!("failed to create circuit breaker state dir: {e}"))
            })?;
        }
        self.circuit_breaker.save_state(&path)
    }

    pub fn circuit_breaker(&self) -> Arc<DynamicCircuitBreaker> {
        self.circuit_breaker.clone()
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Adds `name` to the whitelist. Fails if already registered: the
    /// whitelist is additive-only through this API, never silently
    /// overwritten.
    pub fn register_operation(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        callable: OperationCallable,
    ) -> Result<()> {
        let name = name.into();
        let mut operations = self.operations.write();
        if operations.contains_key(&name) {
            return Err(KernelError::DuplicateOperation(name));
        }
        operations.insert(
            name.clone(),
            RegisteredOperation {
                registration: OperationRegistration {
                    name: name.clone(),
                    description: description.into(),
                    registered_at: Utc::now(),
                },
                callable,
            },
        );
        tracing::info!(operation = %name, "operation registered");
        Ok(())
    }

    pub fn unregister_operation(&self, name: &str) -> Result<()> {
        let mut operations = self.operations.write();
        if operations.remove(name).is_none() {
            return Err(KernelError::UnknownOperation(name.to_string()));
        }
        self.contracts.write().remove(name);
        tracing::info!(operation = %name, "operation unregistered");
        Ok(())
    }

    pub fn register_contract(&self, operation: impl Into<String>, contract: Arc<dyn Contract>) {
        self.contracts.write().insert(operation.into(), contract);
    }

    pub fn add_invariant(&self, name: impl Into<String>, check: crate::invariants::Predicate) {
        self.invariants.add(name, check);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.operations.read().contains_key(name)
    }

    pub fn registered_operations(&self) -> Vec<OperationRegistration> {
        self.operations.read().values().map(|op| op.registration.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Fast path
    // ------------------------------------------------------------------

    /// Eligible only when fast path is enabled, the operation is on the
    /// allow list, the circuit breaker is not RED/BLACK, and the
    /// manifest-resolved risk level is at or under the configured cap.
    /// Invariants are never skipped regardless of fast-path status.
    fn is_fast_path_eligible(&self, ctx: &ExecutionContext) -> bool {
        let fp = &self.config.fast_path;
        if !fp.enabled {
            return false;
        }
        if !fp.allow_list.iter().any(|op| op == &ctx.operation) {
            return false;
        }
        if matches!(
            self.circuit_breaker.autonomy_level(),
            AutonomyLevel::Red | AutonomyLevel::Black
        ) {
            return false;
        }
        self.manifest.get_risk_level(&ctx.operation, 1.0) <= fp.max_risk_level
    }

    /// `effectiveThreshold = defaultRiskThreshold x levelMultiplier x securityMultiplier`,
    /// clamped to 1.0, matching `_check_risk_threshold`.
    fn effective_risk_threshold(&self) -> f64 {
        let security_multiplier = self.config.security_level.multiplier();
        let level_multiplier = match self.circuit_breaker.autonomy_level() {
            AutonomyLevel::Green => 1.0,
            AutonomyLevel::Amber => 0.7,
            AutonomyLevel::Red => 0.3,
            AutonomyLevel::Black => 0.0,
        };
        (self.config.default_risk_threshold * security_multiplier * level_multiplier).min(1.0)
    }

    // ------------------------------------------------------------------
    // Validation chain
    // ------------------------------------------------------------------

    /// Runs the fail-fast validation chain and returns a terminal
    /// decision. Never invokes the operation itself.
    pub async fn validate(&self, ctx: &ExecutionContext) -> ValidationResult {
        self.metrics.record_total();

        if let Err(message) = ctx.check_invariants() {
            let result = ValidationResult::deny("execution_context", DecisionReason::InvariantViolated, message);
            self.metrics.record_outcome(false, result.reason);
            return result;
        }

        if self.is_fast_path_eligible(ctx) {
            self.metrics.record_fast_path_hit();
            let result = ValidationResult::approve("fast_path")
                .with_detail("fast_path", JsonValue::Bool(true))
                .with_warning("manifest, contract, circuit, resource and audit checks bypassed");
            self.metrics.record_outcome(true, result.reason);
            return result;
        }

        let result = self.validate_full_chain(ctx).await;
        self.metrics.record_outcome(result.approved, result.reason);
        result
    }

    async fn validate_full_chain(&self, ctx: &ExecutionContext) -> ValidationResult {
        let domain = ctx.domain.clone().unwrap_or_else(|| "system".to_string());
        let domain_config = self.manifest.get_domain_contract(&domain);

        if !domain_config.enabled {
            return ValidationResult::deny(
                "domain_check",
                DecisionReason::DomainDisabled,
                format!("domain '{domain}' is currently disabled"),
            );
        }

        let op_contract = self.manifest.get_operation_contract(&ctx.operation);

        if let Some(required) = op_contract.as_ref().and_then(|c| c.required_permission.clone()) {
            let has_permission = ctx
                .parameters
                .get("permissions")
                .and_then(|v| v.as_array())
                .map(|perms| perms.iter().any(|p| p.as_str() == Some(required.as_str())))
                .unwrap_or(false);
            if !has_permission {
                return ValidationResult::deny(
                    "rbac_check",
                    DecisionReason::PermissionDenied,
                    format!("permission '{required}' required"),
                );
            }
        }

        let risk_level = self.manifest.get_risk_level(&ctx.operation, self.config.default_risk_threshold);
        let threshold = self.effective_risk_threshold();
        if risk_level > threshold {
            return ValidationResult::deny(
                "risk_check",
                DecisionReason::RiskTooHigh,
                format!("risk level {risk_level:.2} exceeds threshold {threshold:.2}"),
            );
        }

        if let Some(result) = self.check_pre_conditions(ctx, &domain_config, op_contract.as_ref()) {
            if !result.approved {
                return result;
            }
        }

        if !self.circuit_breaker.permits_at_current_level(&ctx.operation) {
            return ValidationResult::deny(
                "circuit_breaker",
                DecisionReason::CircuitOpen,
                format!("autonomy level {:?} forbids this operation", self.circuit_breaker.autonomy_level()),
            );
        }
        if matches!(self.circuit_breaker.autonomy_level(), AutonomyLevel::Amber)
            && op_contract.as_ref().map(|c| c.requires_approval).unwrap_or(false)
        {
            return ValidationResult::deny(
                "circuit_breaker",
                DecisionReason::ApprovalRequired,
                "operation requires approval while autonomy level is AMBER",
            );
        }
        if !self.circuit_breaker.is_allowed(&ctx.operation, &ctx.agent_id) {
            return ValidationResult::deny(
                "circuit_breaker",
                DecisionReason::CircuitOpen,
                "operation risk exceeds the agent's current reputation-weighted threshold",
            );
        }

        let payload_bytes = serde_json::to_string(&ctx.parameters).unwrap_or_default().len();
        if payload_bytes > self.config.resource_limits.max_payload_bytes {
            return ValidationResult::deny(
                "resource_check",
                DecisionReason::ResourceLimit,
                format!(
                    "payload is {} bytes, exceeds cap of {}",
                    payload_bytes, self.config.resource_limits.max_payload_bytes
                ),
            );
        }

        if let Some(deadline_ms) = ctx.parameters.get("_time_estimate_ms").and_then(|v| v.as_u64()) {
            if deadline_ms > self.config.resource_limits.deadline_ms {
                return ValidationResult::deny(
                    "resource_check",
                    DecisionReason::ResourceLimit,
                    format!(
                        "estimated execution time {}ms exceeds deadline {}ms",
                        deadline_ms, self.config.resource_limits.deadline_ms
                    ),
                );
            }
        }

        let audit_event = self.audit_sink.next_event(
            AuditEventType::RequestApproved,
            &ctx.agent_id,
            Some(domain.clone()),
            serde_json::json!({
                "request_id": ctx.request_id,
                "operation": ctx.operation,
            }),
        );
        if let Err(e) = self.audit_sink.emit(audit_event).await {
            if self.config.audit_fail_closed {
                return ValidationResult::deny(
                    "audit_log",
                    DecisionReason::AuditFailed,
                    format!("audit logging failed, blocking fail-closed: {e}"),
                );
            }
            tracing::warn!(error = %e, "audit emission failed but audit_fail_closed is false");
        }

        ValidationResult::approve("approved").with_detail("risk_level", JsonValue::from(risk_level))
    }

    /// Finds the first manifest-declared pre-condition (evaluated through
    /// the DSL) that fails, if any.
    fn failing_manifest_pre_condition(
        ctx: &ExecutionContext,
        op_contract: &crate::manifest::OperationConfig,
    ) -> Option<String> {
        let eval_ctx = EvalContext {
            action: ctx.operation.clone(),
            agent_id: ctx.agent_id.clone(),
            context: ctx.parameters.clone(),
        };
        op_contract
            .pre_conditions
            .iter()
            .find(|condition| !dsl::evaluate(condition, &eval_ctx))
            .cloned()
    }

    /// Both the registered contract and the manifest's declarative
    /// pre-conditions are checked when a contract is registered; the
    /// contract's verdict takes precedence on conflict (spec §4.4).
    fn check_pre_conditions(
        &self,
        ctx: &ExecutionContext,
        domain_config: &crate::manifest::DomainConfig,
        op_contract: Option<&crate::manifest::OperationConfig>,
    ) -> Option<ValidationResult> {
        let failed_manifest_condition =
            op_contract.and_then(|op_contract| Self::failing_manifest_pre_condition(ctx, op_contract));

        let contracts = self.contracts.read();
        if let Some(contract) = contracts.get(&ctx.operation) {
            let input = PreConditionInput {
                context: ctx,
                domain_config: Some(domain_config),
                strictness: self.circuit_breaker.as_ref(),
            };
            let result = contract.check_pre(&input);
            drop(contracts);

            if !result.approved {
                return Some(ValidationResult::deny(
                    "contract_check",
                    result.reason,
                    format!("intent contract pre-condition failed: {}", result.message),
                ));
            }

            let mut approval = ValidationResult::approve("contract_check");
            if let Some(condition) = failed_manifest_condition {
                approval = approval.with_warning(format!(
                    "manifest pre-condition '{condition}' failed for '{}' but the registered contract approved; contract takes precedence",
                    ctx.operation
                ));
            }
            return Some(approval);
        }
        drop(contracts);

        op_contract?;
        match failed_manifest_condition {
            Some(condition) => Some(ValidationResult::deny(
                "contract_check",
                DecisionReason::PreConditionFailed,
                format!("pre-condition '{condition}' failed"),
            )),
            None => Some(ValidationResult::approve("contract_check")),
        }
    }

    // ------------------------------------------------------------------
    // Execute
    // ------------------------------------------------------------------

    /// The only way to run a registered operation. Validates, enforces
    /// whitelist membership, re-checks the registered contract's
    /// pre-condition, runs every invariant, invokes the callable, then
    /// runs the contract's post-condition and every invariant again.
    pub async fn execute(&self, ctx: ExecutionContext) -> Result<JsonValue> {
        let validation = self.validate(&ctx).await;
        if !validation.approved {
            self.audit_denial(&ctx, &validation).await;
            return Err(KernelError::Denied {
                reason: validation.reason,
                message: validation.message,
            });
        }

        if !self.is_registered(&ctx.operation) {
            return Err(KernelError::UnknownOperation(ctx.operation.clone()));
        }

        let domain = ctx.domain.clone().unwrap_or_else(|| "system".to_string());
        let domain_config = self.manifest.get_domain_contract(&domain);

        {
            let contracts = self.contracts.read();
            if let Some(contract) = contracts.get(&ctx.operation) {
                let input = PreConditionInput {
                    context: &ctx,
                    domain_config: Some(&domain_config),
                    strictness: self.circuit_breaker.as_ref(),
                };
                let pre = contract.check_pre(&input);
                if !pre.approved {
                    return Err(KernelError::Denied {
                        reason: pre.reason,
                        message: pre.message,
                    });
                }
            }
        }

        if let Some(failure) = self.invariants.first_failure(&ctx.parameters) {
            return Err(KernelError::Denied {
                reason: DecisionReason::InvariantViolated,
                message: format!("invariant '{}' failed before execution: {}", failure.name, failure.message.unwrap_or_default()),
            });
        }

        let output = self.invoke(&ctx).await?;

        {
            let contracts = self.contracts.read();
            if let Some(contract) = contracts.get(&ctx.operation) {
                let post = contract.check_post(&ctx, &output);
                if !post.satisfied {
                    self.audit_operation_failed(&ctx, &post.message).await;
                    return Err(KernelError::Denied {
                        reason: post.reason,
                        message: post.message,
                    });
                }
            }
        }

        if let Some(failure) = self.invariants.first_failure(&ctx.parameters) {
            self.audit_operation_failed(&ctx, &failure.message.clone().unwrap_or_default()).await;
            return Err(KernelError::Denied {
                reason: DecisionReason::InvariantViolated,
                message: format!("invariant '{}' failed after execution", failure.name),
            });
        }

        self.metrics.record_executed();
        self.circuit_breaker.record_request(&ctx.agent_id, false, false);
        self.audit_success(&ctx).await;
        Ok(output)
    }

    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue> {
        let future = {
            let operations = self.operations.read();
            let op = operations
                .get(&ctx.operation)
                .ok_or_else(|| KernelError::UnknownOperation(ctx.operation.clone()))?;
            (op.callable)(ctx.parameters.clone())
        };
        future.await.map_err(|e| {
            KernelError::Denied {
                reason: DecisionReason::InternalError,
                message: format!("operation '{}' failed: {e}", ctx.operation),
            }
        })
    }

    async fn audit_denial(&self, ctx: &ExecutionContext, validation: &ValidationResult) {
        self.circuit_breaker.record_request(&ctx.agent_id, true, validation.severity >= Severity::High);
        let event = self.audit_sink.next_event(
            AuditEventType::RequestDenied,
            &ctx.agent_id,
            ctx.domain.clone(),
            serde_json::json!({
                "operation": ctx.operation,
                "reason": validation.reason,
                "message": validation.message,
            }),
        );
        let _ = self.audit_sink.emit(event).await;
    }

    async fn audit_success(&self, ctx: &ExecutionContext) {
        let event = self.audit_sink.next_event(
            AuditEventType::OperationExecuted,
            &ctx.agent_id,
            ctx.domain.clone(),
            serde_json::json!({"operation": ctx.operation, "request_id": ctx.request_id}),
        );
        let _ = self.audit_sink.emit(event).await;
    }

    async fn audit_operation_failed(&self, ctx: &ExecutionContext, message: &str) {
        self.circuit_breaker.record_request(&ctx.agent_id, true, false);
        let event = self.audit_sink.next_event(
            AuditEventType::OperationFailed,
            &ctx.agent_id,
            ctx.domain.clone(),
            serde_json::json!({"operation": ctx.operation, "message": message}),
        );
        let _ = self.audit_sink.emit(event).await;
    }

    // ------------------------------------------------------------------
    // Admin surface
    // ------------------------------------------------------------------

    /// Admin override of the autonomy level. Per the resolved open
    /// question in the circuit breaker, this never clears panic mode.
    pub async fn set_circuit_state(&self, level: AutonomyLevel) {
        self.circuit_breaker.set_autonomy_level(level);
        if let Err(e) = self.persist_circuit_state() {
            tracing::warn!(error = %e, "failed to persist circuit breaker state after override");
        }
        let event = self.audit_sink.next_event(
            AuditEventType::CircuitStateOverride,
            "admin",
            None,
            serde_json::json!({"level": format!("{level:?}")}),
        );
        let _ = self.audit_sink.emit(event).await;
    }

    pub fn get_stats(&self) -> KernelStatsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::contract::AlwaysDeny;

    fn kernel() -> ExecutionKernel {
        let mut config = KernelConfig::default();
        config.manifest_dir = "/nonexistent/manifests".to_string();
        config.circuit_breaker_dir = String::new();
        ExecutionKernel::new(config, Arc::new(InMemoryAuditSink::new(1000)))
    }

    #[test]
    fn default_kernel_is_set_once_not_overwritten() {
        let first_attempt = install_default_kernel(kernel());
        // Whichever test claims the slot first, a default kernel is now
        // present for the rest of this process.
        assert!(default_kernel().is_some());
        if first_attempt.is_ok() {
            assert!(install_default_kernel(kernel()).is_err());
        }
    }

    fn echo_callable() -> OperationCallable {
        Box::new(|params: HashMap<String, JsonValue>| {
            Box::pin(async move { Ok(JsonValue::Object(params.into_iter().collect())) })
        })
    }

    #[tokio::test]
    async fn unregistered_operation_is_denied_whitelist_closure() {
        let kernel = kernel();
        let ctx = ExecutionContext::new("agent-1", "does_not_exist", HashMap::new());
        let result = kernel.execute(ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn registering_twice_fails() {
        let kernel = kernel();
        kernel.register_operation("noop", "test op", echo_callable()).unwrap();
        let err = kernel.register_operation("noop", "test op", echo_callable());
        assert!(err.is_err());
    }

    /// Writes a minimal `operations.json` declaring `echo` as a low-risk,
    /// fast-path-eligible operation, so fast-path eligibility doesn't
    /// depend on a real manifest tree being present on disk.
    fn manifest_dir_with_low_risk_echo() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("execution-kernel-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("operations.json"),
            serde_json::json!({
                "version": 1,
                "operations": {
                    "echo": {"risk_level": 0.1, "fast_path_available": true}
                }
            })
            .to_string(),
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn fast_path_bypasses_contract_but_not_whitelist() {
        let dir = manifest_dir_with_low_risk_echo();
        let mut config = KernelConfig::default();
        config.manifest_dir = dir.to_string_lossy().to_string();
        config.fast_path.allow_list = vec!["echo".to_string()];
        let kernel = ExecutionKernel::new(config, Arc::new(InMemoryAuditSink::new(1000)));
        kernel.register_operation("echo", "echoes input", echo_callable()).unwrap();
        kernel.register_contract("echo", Arc::new(AlwaysDeny { message: "never".to_string() }));

        let ctx = ExecutionContext::new("agent-1", "echo", HashMap::new());
        let validation = kernel.validate(&ctx).await;
        assert!(validation.approved, "fast path should approve despite a denying contract");

        // execute() still enforces the registered contract's pre-condition
        // independently of the fast-path validation result.
        let ctx = ExecutionContext::new("agent-1", "echo", HashMap::new());
        let result = kernel.execute(ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fast_path_eligible_operation_still_blocked_by_always_false_invariant() {
        let dir = manifest_dir_with_low_risk_echo();
        let mut config = KernelConfig::default();
        config.manifest_dir = dir.to_string_lossy().to_string();
        config.fast_path.allow_list = vec!["echo".to_string()];
        let kernel = ExecutionKernel::new(config, Arc::new(InMemoryAuditSink::new(1000)));
        kernel.register_operation("echo", "echoes input", echo_callable()).unwrap();
        kernel.add_invariant(
            "always_false",
            Box::new(|_payload| crate::types::InvariantResult::fail("always_false", "never passes")),
        );

        let ctx = ExecutionContext::new("agent-1", "echo", HashMap::new());
        let validation = kernel.validate(&ctx).await;
        assert!(validation.approved, "fast path validation is still a bare approval");

        let ctx = ExecutionContext::new("agent-1", "echo", HashMap::new());
        let result = kernel.execute(ctx).await;
        assert!(result.is_err(), "always-false invariant must reject even on the fast path");
    }

    #[test]
    fn registered_contract_takes_precedence_over_failed_manifest_pre_condition() {
        use crate::contract::AlwaysAllow;
        use crate::manifest::{DomainConfig, OperationConfig};

        let kernel = kernel();
        kernel.register_contract("transfer_funds", Arc::new(AlwaysAllow));

        let op_contract = OperationConfig {
            pre_conditions: vec!["action == 'not_this_operation'".to_string()],
            ..Default::default()
        };
        let ctx = ExecutionContext::new("agent-1", "transfer_funds", HashMap::new());
        let domain_config = DomainConfig::safe_defaults();

        let result = kernel
            .check_pre_conditions(&ctx, &domain_config, Some(&op_contract))
            .expect("a contract is registered, a result must come back");

        assert!(result.approved, "the registered contract approves and takes precedence");
        assert!(
            result.warnings.iter().any(|w| w.contains("not_this_operation")),
            "the overridden manifest failure should still surface as a warning"
        );
    }

    #[test]
    fn manifest_pre_conditions_are_enforced_without_a_registered_contract() {
        use crate::manifest::{DomainConfig, OperationConfig};

        let kernel = kernel();
        let op_contract = OperationConfig {
            pre_conditions: vec!["action == 'not_this_operation'".to_string()],
            ..Default::default()
        };
        let ctx = ExecutionContext::new("agent-1", "transfer_funds", HashMap::new());
        let domain_config = DomainConfig::safe_defaults();

        let result = kernel
            .check_pre_conditions(&ctx, &domain_config, Some(&op_contract))
            .expect("an operation contract with pre-conditions must produce a result");

        assert!(!result.approved);
    }

    #[tokio::test]
    async fn black_level_denies_non_exempt_operations() {
        let kernel = kernel();
        kernel.register_operation("modify_core", "dangerous", echo_callable()).unwrap();
        kernel.circuit_breaker().set_autonomy_level(AutonomyLevel::Black);
        let ctx = ExecutionContext::new("agent-1", "modify_core", HashMap::new());
        let result = kernel.execute(ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fail_closed_audit_blocks_even_a_valid_request() {
        let config = KernelConfig::default();
        let kernel = ExecutionKernel::new(config, Arc::new(crate::audit::AlwaysFailingSink));
        kernel.register_operation("noop", "test op", echo_callable()).unwrap();
        let ctx = ExecutionContext::new("agent-1", "noop", HashMap::new());
        let result = kernel.execute(ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn successful_execution_updates_stats() {
        let kernel = kernel();
        kernel.register_operation("noop", "test op", echo_callable()).unwrap();
        let ctx = ExecutionContext::new("agent-1", "noop", HashMap::new());
        kernel.execute(ctx).await.unwrap();
        let stats = kernel.get_stats();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.approved, 1);
    }
}
