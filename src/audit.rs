//! Audit emission
//!
//! The core does not own a persistent audit store — that belongs to the
//! external audit component (spec §9) — but it still needs a narrow,
//! fail-closed emission point at the end of the validation chain. This
//! module defines the event shape and hash-chain scheme from
//! `enterprise/audit_logger.py`, plus an in-memory reference sink used by
//! the demo binary and the kernel's own tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Event categories the kernel itself emits. The external audit component
/// defines a much larger taxonomy (agent lifecycle, tenancy, debate
/// pipeline, ...); the core only needs the subset it can originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RequestApproved,
    RequestDenied,
    OperationExecuted,
    OperationFailed,
    AutonomyLevelChanged,
    PanicModeChanged,
    CircuitStateOverride,
    OperationRegistered,
    OperationUnregistered,
}

/// One entry in the append-only audit chain. `event_hash` covers this
/// event's own fields plus `prev_hash`, so re-hashing in sequence detects
/// tampering anywhere in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub agent_id: String,
    pub domain: Option<String>,
    pub data: JsonValue,
    pub prev_hash: Option<String>,
    pub hash: String,
}

impl AuditEvent {
    /// Builds an event and computes its hash against the given previous
    /// hash. `hash = SHA256(id|ts|type|agent_id|domain|data|prev_hash)`,
    /// matching the original's `_calculate_hash`.
    pub fn new(
        event_type: AuditEventType,
        agent_id: impl Into<String>,
        domain: Option<String>,
        data: JsonValue,
        prev_hash: Option<String>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now();
        let agent_id = agent_id.into();
        let hash = Self::compute_hash(&id, timestamp, event_type, &agent_id, &domain, &data, &prev_hash);
        Self {
            id,
            timestamp,
            event_type,
            agent_id,
            domain,
            data,
            prev_hash,
            hash,
        }
    }

    fn compute_hash(
        id: &str,
        timestamp: DateTime<Utc>,
        event_type: AuditEventType,
        agent_id: &str,
        domain: &Option<String>,
        data: &JsonValue,
        prev_hash: &Option<String>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        hasher.update(b"|");
        hasher.update(timestamp.to_rfc3339().as_bytes());
        hasher.update(b"|");
        hasher.update(format!("{:?}", event_type).as_bytes());
        hasher.update(b"|");
        hasher.update(agent_id.as_bytes());
        hasher.update(b"|");
        hasher.update(domain.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(serde_json::to_string(data).unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(prev_hash.as_deref().unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Recomputes the hash from this event's own fields and checks it
    /// matches the stored `hash`, confirming neither the event nor its
    /// recorded `prev_hash` link was altered.
    pub fn verify(&self) -> bool {
        let recomputed = Self::compute_hash(
            &self.id,
            self.timestamp,
            self.event_type,
            &self.agent_id,
            &self.domain,
            &self.data,
            &self.prev_hash,
        );
        recomputed == self.hash
    }
}

/// Failure emitting an audit event. Distinct from `KernelError` so sinks
/// can be implemented without depending on the kernel's error type.
#[derive(Debug, thiserror::Error)]
#[error("audit sink failed: {0}")]
pub struct AuditSinkError(pub String);

/// Narrow capability the kernel needs from an audit backend: build the
/// next chained event from the sink's own tip hash, then emit it,
/// fail-closed if the backend can't accept it. Implementors may perform
/// disk or network I/O in `emit`; `next_event` only touches in-memory
/// chain state.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn next_event(
        &self,
        event_type: AuditEventType,
        agent_id: &str,
        domain: Option<String>,
        data: JsonValue,
    ) -> AuditEvent;

    async fn emit(&self, event: AuditEvent) -> Result<(), AuditSinkError>;
}

/// Reference in-memory sink: append-only, bounded, hash-chained. Suitable
/// for tests and the demo binary; a production deployment plugs in a
/// durable sink (disk-backed JSONL, a message queue) behind the same
/// trait.
pub struct InMemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    last_hash: Mutex<Option<String>>,
    capacity: usize,
}

impl InMemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            last_hash: Mutex::new(None),
            capacity,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Verifies the entire chain by re-hashing in sequence and confirming
    /// each event's `prev_hash` matches the previous event's `hash`.
    pub fn verify_chain(&self) -> bool {
        let events = self.events.lock();
        let mut expected_prev: Option<String> = None;
        for event in events.iter() {
            if event.prev_hash != expected_prev {
                return false;
            }
            if !event.verify() {
                return false;
            }
            expected_prev = Some(event.hash.clone());
        }
        true
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    fn next_event(
        &self,
        event_type: AuditEventType,
        agent_id: &str,
        domain: Option<String>,
        data: JsonValue,
    ) -> AuditEvent {
        let prev_hash = self.last_hash.lock().clone();
        AuditEvent::new(event_type, agent_id, domain, data, prev_hash)
    }

    async fn emit(&self, event: AuditEvent) -> Result<(), AuditSinkError> {
        let mut last_hash = self.last_hash.lock();
        *last_hash = Some(event.hash.clone());
        drop(last_hash);

        let mut events = self.events.lock();
        events.push_back(event);
        if events.len() > self.capacity {
            events.pop_front();
        }
        Ok(())
    }
}

/// A sink that always fails, for exercising `auditFailClosed` behavior in
/// tests.
pub struct AlwaysFailingSink;

#[async_trait]
impl AuditSink for AlwaysFailingSink {
    fn next_event(
        &self,
        event_type: AuditEventType,
        agent_id: &str,
        domain: Option<String>,
        data: JsonValue,
    ) -> AuditEvent {
        AuditEvent::new(event_type, agent_id, domain, data, None)
    }

    async fn emit(&self, _event: AuditEvent) -> Result<(), AuditSinkError> {
        Err(AuditSinkError("audit backend unreachable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chain_round_trip_verifies() {
        let sink = InMemoryAuditSink::new(100);
        for i in 0..5 {
            let event = sink.next_event(
                AuditEventType::RequestApproved,
                "agent-1",
                None,
                serde_json::json!({"seq": i}),
            );
            sink.emit(event).await.unwrap();
        }
        assert!(sink.verify_chain());
        assert_eq!(sink.events().len(), 5);
    }

    #[tokio::test]
    async fn tampering_breaks_chain_verification() {
        let sink = InMemoryAuditSink::new(100);
        for i in 0..3 {
            let event = sink.next_event(
                AuditEventType::RequestApproved,
                "agent-1",
                None,
                serde_json::json!({"seq": i}),
            );
            sink.emit(event).await.unwrap();
        }
        {
            let mut events = sink.events.lock();
            events[1].data = serde_json::json!({"seq": 999});
        }
        assert!(!sink.verify_chain());
    }

    #[tokio::test]
    async fn always_failing_sink_errors() {
        let sink = AlwaysFailingSink;
        let event = AuditEvent::new(
            AuditEventType::RequestDenied,
            "agent-1",
            None,
            serde_json::json!({}),
            None,
        );
        assert!(sink.emit(event).await.is_err());
    }
}
