//! Kernel metrics
//!
//! Atomic counters for `ExecutionKernel::get_stats()`, exported in
//! Prometheus text format: total/approved/denied/fast-path hits/by-reason.

use crate::error::DecisionReason;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters recorded on every `validate`/`execute` call. Cheap
/// enough to update on the hot path without a lock, except the by-reason
/// breakdown which is low-cardinality and rarely contended.
#[derive(Default)]
pub struct KernelMetrics {
    total_requests: AtomicU64,
    approved: AtomicU64,
    denied: AtomicU64,
    fast_path_hits: AtomicU64,
    executed: AtomicU64,
    by_reason: RwLock<HashMap<DecisionReason, u64>>,
}

impl KernelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_total(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fast_path_hit(&self) {
        self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a terminal validation outcome: increments `approved` or
    /// `denied`, and for denials bumps the per-reason breakdown.
    pub fn record_outcome(&self, approved: bool, reason: DecisionReason) {
        if approved {
            self.approved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            *self.by_reason.write().entry(reason).or_insert(0) += 1;
        }
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.approved.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
        self.fast_path_hits.store(0, Ordering::Relaxed);
        self.executed.store(0, Ordering::Relaxed);
        self.by_reason.write().clear();
    }

    pub fn snapshot(&self) -> KernelStatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let approved = self.approved.load(Ordering::Relaxed);
        let fast_path_hits = self.fast_path_hits.load(Ordering::Relaxed);
        KernelStatsSnapshot {
            total_requests: total,
            approved,
            denied: self.denied.load(Ordering::Relaxed),
            fast_path_hits,
            executed: self.executed.load(Ordering::Relaxed),
            by_reason: self.by_reason.read().clone(),
            approval_rate: if total > 0 { approved as f64 / total as f64 } else { 0.0 },
            fast_path_rate: if total > 0 { fast_path_hits as f64 / total as f64 } else { 0.0 },
        }
    }

    /// Export in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        out.push_str(
            "# HELP execution_kernel_requests_total Total validation requests\n\
             # TYPE execution_kernel_requests_total counter\n",
        );
        out.push_str(&format!("execution_kernel_requests_total {}\n\n", snapshot.total_requests));

        out.push_str(
            "# HELP execution_kernel_approved_total Approved requests\n\
             # TYPE execution_kernel_approved_total counter\n",
        );
        out.push_str(&format!("execution_kernel_approved_total {}\n\n", snapshot.approved));

        out.push_str(
            "# HELP execution_kernel_denied_total Denied requests\n\
             # TYPE execution_kernel_denied_total counter\n",
        );
        out.push_str(&format!("execution_kernel_denied_total {}\n\n", snapshot.denied));

        out.push_str(
            "# HELP execution_kernel_fast_path_hits_total Fast-path validations\n\
             # TYPE execution_kernel_fast_path_hits_total counter\n",
        );
        out.push_str(&format!(
            "execution_kernel_fast_path_hits_total {}\n\n",
            snapshot.fast_path_hits
        ));

        out.push_str(
            "# HELP execution_kernel_denied_by_reason Denied requests by reason\n\
             # TYPE execution_kernel_denied_by_reason counter\n",
        );
        for (reason, count) in &snapshot.by_reason {
            out.push_str(&format!(
                "execution_kernel_denied_by_reason{{reason=\"{}\"}} {}\n",
                reason, count
            ));
        }
        out
    }
}

/// Point-in-time snapshot matching `ExecutionKernel.get_stats()`'s shape
/// in the original (`approval_rate`, `fast_path_rate` included). Keys of
/// `by_reason` are stringified so the snapshot serializes to plain JSON.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KernelStatsSnapshot {
    pub total_requests: u64,
    pub approved: u64,
    pub denied: u64,
    pub fast_path_hits: u64,
    pub executed: u64,
    #[serde(serialize_with = "serialize_by_reason")]
    pub by_reason: HashMap<DecisionReason, u64>,
    pub approval_rate: f64,
    pub fast_path_rate: f64,
}

fn serialize_by_reason<S>(map: &HashMap<DecisionReason, u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::Serialize;
    let stringified: HashMap<String, u64> = map.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    stringified.serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_computes_rates() {
        let metrics = KernelMetrics::new();
        for _ in 0..10 {
            metrics.record_total();
        }
        for _ in 0..7 {
            metrics.record_outcome(true, DecisionReason::Approved);
        }
        for _ in 0..3 {
            metrics.record_outcome(false, DecisionReason::RiskTooHigh);
        }
        metrics.record_fast_path_hit();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 10);
        assert_eq!(snapshot.approved, 7);
        assert_eq!(snapshot.denied, 3);
        assert_eq!(snapshot.by_reason.get(&DecisionReason::RiskTooHigh), Some(&3));
        assert!((snapshot.approval_rate - 0.7).abs() < 1e-9);
        assert!((snapshot.fast_path_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_all_counters() {
        let metrics = KernelMetrics::new();
        metrics.record_total();
        metrics.record_outcome(false, DecisionReason::DomainDisabled);
        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.by_reason.is_empty());
    }

    #[test]
    fn prometheus_export_contains_counters() {
        let metrics = KernelMetrics::new();
        metrics.record_total();
        metrics.record_outcome(true, DecisionReason::Approved);
        let text = metrics.export_prometheus();
        assert!(text.contains("execution_kernel_requests_total 1"));
        assert!(text.contains("execution_kernel_approved_total 1"));
    }
}
