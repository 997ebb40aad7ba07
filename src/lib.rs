#![allow(clippy::collapsible_if)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::manual_range_contains)]
//! Execution Kernel
//!
//! A trusted boundary that sits between an autonomous agent and every
//! operation it's allowed to invoke. Nothing runs except through
//! `ExecutionKernel::execute`, and nothing is approved except through its
//! fail-fast validation chain: domain gating, RBAC, risk scoring against
//! the current circuit-breaker autonomy level, intent-contract
//! pre-conditions, circuit-breaker admission, resource limits, and a
//! fail-closed audit emission. A narrow, explicitly allow-listed fast
//! path skips the chain for cheap, pre-approved operations.
//!
//! Module map:
//! - [`kernel`] — the orchestrator (`ExecutionKernel`)
//! - [`types`] — `ExecutionContext`, `ValidationResult`, `KernelConfig`
//! - [`manifest`] — domain/operation manifests, deep-merge + inheritance
//! - [`contract`] — composable Intent Contract pre/post-conditions
//! - [`circuit_breaker`] — autonomy levels, panic mode, agent reputation
//! - [`invariants`] — always-on safety predicates run around every call
//! - [`sanitizer`] — static AST scan for code passed to `exec`-like sinks
//! - [`dsl`] — small boolean expression language for manifest conditions
//! - [`audit`] — hash-chained audit event emission
//! - [`metrics`] — kernel-level counters
//! - [`observability`] — `tracing` setup

pub mod audit;
pub mod circuit_breaker;
pub mod contract;
pub mod dsl;
pub mod error;
pub mod invariants;
pub mod kernel;
pub mod manifest;
pub mod metrics;
pub mod observability;
pub mod sanitizer;
pub mod types;

pub use audit::{AuditEvent, AuditEventType, AuditSink, AuditSinkError, InMemoryAuditSink};
pub use circuit_breaker::{
    AutonomyLevel, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitBreakerStatus,
    DynamicCircuitBreaker, PanicMode,
};
pub use contract::{
    AlwaysAllow, AlwaysDeny, And, Contract, CustomInvariant, MaxOperationSize, Not, Or,
    PreConditionInput, ProtectedPathCheck, RequireDomainEnabled, RequireManifestContract,
    RequirePermission, StrictnessProvider,
};
pub use dsl::{evaluate, EvalContext};
pub use error::{DecisionReason, KernelError, Result, Severity};
pub use invariants::{Invariant, InvariantRegistry, Predicate};
pub use kernel::{
    default_kernel, install_default_kernel, ExecutionKernel, OperationCallable, OperationFuture,
    OperationOutcome,
};
pub use manifest::{DomainConfig, Manifest, ManifestLoadError, ManifestStore, OperationConfig};
pub use metrics::{KernelMetrics, KernelStatsSnapshot};
pub use observability::{init_otel_tracer, init_tracing, shutdown_otel_tracer, OtelConfig};
pub use sanitizer::{AstSanitizer, SanitizationResult, SanitizationViolation};
pub use types::{
    ExecutionContext, FastPathConfig, InvariantResult, KernelConfig, OperationRegistration,
    PostConditionResult, ResourceLimits, SecurityLevel, ValidationResult,
};
