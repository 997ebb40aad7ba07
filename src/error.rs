//! Error taxonomy and typed decision reasons for the execution kernel.
//!
//! `DecisionReason` is a closed set — every check in the validation pipeline
//! returns one of these, never a free-form string.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of reasons a `ValidationResult` can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    Approved,
    Pending,
    DomainDisabled,
    DomainNotFound,
    PermissionDenied,
    ApprovalRequired,
    RiskTooHigh,
    DebateRequired,
    PreConditionFailed,
    PostConditionFailed,
    InvariantViolated,
    CircuitOpen,
    ResourceLimit,
    RateLimited,
    AuditFailed,
    InternalError,
    Timeout,
    Unavailable,
    UnknownOperation,
}

impl DecisionReason {
    /// Whether this reason represents an approval rather than a denial.
    pub fn is_approval(&self) -> bool {
        matches!(self, DecisionReason::Approved | DecisionReason::Pending)
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            DecisionReason::Approved | DecisionReason::Pending => Severity::Low,
            DecisionReason::DomainDisabled
            | DecisionReason::DomainNotFound
            | DecisionReason::PermissionDenied
            | DecisionReason::ApprovalRequired
            | DecisionReason::RateLimited => Severity::Medium,
            DecisionReason::RiskTooHigh
            | DecisionReason::DebateRequired
            | DecisionReason::PreConditionFailed
            | DecisionReason::PostConditionFailed
            | DecisionReason::CircuitOpen
            | DecisionReason::ResourceLimit
            | DecisionReason::UnknownOperation => Severity::High,
            DecisionReason::InvariantViolated
            | DecisionReason::AuditFailed
            | DecisionReason::InternalError
            | DecisionReason::Timeout
            | DecisionReason::Unavailable => Severity::Critical,
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Severity attached to a `ValidationResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Library-level errors. Distinct from `DecisionReason`: these represent
/// failures to even produce a decision (corrupt manifest, bad JSON, I/O),
/// not a deliberate deny.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("manifest '{name}' could not be loaded: {reason}")]
    ManifestLoad { name: String, reason: String },

    #[error("manifest '{0}' failed validation: missing 'version' field")]
    ManifestMissingVersion(String),

    #[error("operation '{op}' in manifest '{manifest}' is missing 'risk_level' or 'fallback_contract'")]
    ManifestMissingRiskLevel { manifest: String, op: String },

    #[error("operation '{0}' is not registered")]
    UnknownOperation(String),

    #[error("operation '{0}' is already registered")]
    DuplicateOperation(String),

    #[error("audit sink failed: {0}")]
    AuditFailed(String),

    #[error("request denied: {reason} ({message})")]
    Denied {
        reason: DecisionReason,
        message: String,
    },

    #[error("sanitizer failed to parse source: {0}")]
    SanitizerParse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Map to the closed `DecisionReason` set, for callers that need one.
    pub fn as_reason(&self) -> DecisionReason {
        match self {
            KernelError::ManifestLoad { .. }
            | KernelError::ManifestMissingVersion(_)
            | KernelError::ManifestMissingRiskLevel { .. }
            | KernelError::SanitizerParse(_)
            | KernelError::Internal(_) => DecisionReason::InternalError,
            KernelError::UnknownOperation(_) | KernelError::DuplicateOperation(_) => {
                DecisionReason::UnknownOperation
            }
            KernelError::AuditFailed(_) => DecisionReason::AuditFailed,
            KernelError::Denied { reason, .. } => *reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Critical);
    }

    #[test]
    fn reason_severity_mapping() {
        assert_eq!(DecisionReason::Approved.default_severity(), Severity::Low);
        assert_eq!(
            DecisionReason::InvariantViolated.default_severity(),
            Severity::Critical
        );
    }

    #[test]
    fn kernel_error_maps_to_reason() {
        let e = KernelError::UnknownOperation("foo".into());
        assert_eq!(e.as_reason(), DecisionReason::UnknownOperation);
    }
}
