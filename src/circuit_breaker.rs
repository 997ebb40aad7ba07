//! Dynamic Circuit Breaker
//!
//! Unifies two state machines from the original platform as orthogonal
//! state variables on one type, per the resolved open question: an
//! `autonomy_level` (driven by host inactivity and system state, grounded
//! on `mat/circuit_breaker.py`) and a `panic_mode` + `strictness` pair
//! (driven by rolling rejection-rate metrics, grounded on
//! `kernel/dynamic_circuit_breaker.py`). An admin override of
//! `autonomy_level` never exits panic mode; panic clears only through its
//! own cooldown.

use crate::contract::StrictnessProvider;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Graduated autonomy level. Ordered by restrictiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AutonomyLevel {
    Green,
    Amber,
    Red,
    Black,
}

/// Orthogonal panic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanicMode {
    Normal,
    Elevated,
    Panic,
}

/// Host-activity tracking that drives autonomy escalation/de-escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostActivity {
    pub last_seen: DateTime<Utc>,
    pub last_action: String,
}

impl Default for HostActivity {
    fn default() -> Self {
        Self {
            last_seen: Utc::now(),
            last_action: "none".to_string(),
        }
    }
}

/// System-state signals that drive escalation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemState {
    pub backlog_size: u32,
    pub critical_issues: u32,
    pub failed_deployments: u32,
    pub last_error: Option<String>,
    pub resource_usage: HashMap<String, f64>,
}

/// Per-agent reputation, recomputed once `total_requests >= 5`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReputation {
    pub agent_id: String,
    pub score: f64,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub forbidden_attempts: u64,
    pub successful_ops: u64,
    pub last_forbidden_at: Option<DateTime<Utc>>,
}

impl AgentReputation {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            score: 1.0,
            total_requests: 0,
            rejected_requests: 0,
            forbidden_attempts: 0,
            successful_ops: 0,
            last_forbidden_at: None,
        }
    }

    pub fn rejection_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.rejected_requests as f64 / self.total_requests as f64
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.total_requests >= 5 && self.score >= 0.8
    }

    /// `score = clamp(0,1, 1 - 0.5*rejectionRate - min(0.15*forbiddenAttempts,0.4)
    ///   + min(0.02*successfulOps, 0.2))`, only recomputed once
    /// `totalRequests >= 5`.
    pub fn update_score(&mut self) {
        if self.total_requests < 5 {
            return;
        }
        let penalty_forbidden = (0.15 * self.forbidden_attempts as f64).min(0.4);
        let bonus_success = (0.02 * self.successful_ops as f64).min(0.2);
        let raw = 1.0 - 0.5 * self.rejection_rate() - penalty_forbidden + bonus_success;
        self.score = raw.clamp(0.0, 1.0);
    }

    pub fn record_outcome(&mut self, rejected: bool, forbidden: bool) {
        self.total_requests += 1;
        if rejected {
            self.rejected_requests += 1;
        } else {
            self.successful_ops += 1;
        }
        if forbidden {
            self.forbidden_attempts += 1;
            self.last_forbidden_at = Some(Utc::now());
        }
        self.update_score();
    }
}

/// One rolling-window snapshot of request outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub rejected: u64,
    pub forbidden: u64,
    pub per_agent_rejections: HashMap<String, u64>,
    pub started_at: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    fn started(now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(now),
            ..Default::default()
        }
    }

    pub fn rejection_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.rejected as f64 / self.total as f64
        }
    }
}

/// Rolling buffer of at most `window_count` snapshots, each of duration
/// `window_duration`.
pub struct MetricsWindow {
    pub window_duration: chrono::Duration,
    pub window_count: usize,
    history: Vec<MetricsSnapshot>,
    current: MetricsSnapshot,
}

impl MetricsWindow {
    pub fn new(window_duration: chrono::Duration, window_count: usize) -> Self {
        Self {
            window_duration,
            window_count,
            history: Vec::new(),
            current: MetricsSnapshot::started(Utc::now()),
        }
    }

    pub fn record(&mut self, agent_id: &str, rejected: bool, forbidden: bool) {
        self.rotate_if_needed();
        self.current.total += 1;
        if rejected {
            self.current.rejected += 1;
            *self
                .current
                .per_agent_rejections
                .entry(agent_id.to_string())
                .or_insert(0) += 1;
        }
        if forbidden {
            self.current.forbidden += 1;
        }
    }

    fn rotate_if_needed(&mut self) {
        let started = self.current.started_at.unwrap_or_else(Utc::now);
        if Utc::now() - started >= self.window_duration {
            self.history.push(std::mem::replace(
                &mut self.current,
                MetricsSnapshot::started(Utc::now()),
            ));
            if self.history.len() > self.window_count {
                self.history.remove(0);
            }
        }
    }

    /// Aggregate rejection rate = Sum(rejected) / Sum(total) over all
    /// snapshots, including the current one.
    pub fn average_rejection_rate(&self) -> f64 {
        let mut total = self.current.total;
        let mut rejected = self.current.rejected;
        for snapshot in &self.history {
            total += snapshot.total;
            rejected += snapshot.rejected;
        }
        if total == 0 {
            0.0
        } else {
            rejected as f64 / total as f64
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.current.rejection_rate()
    }

    /// All rotated snapshots plus the current one, oldest first. Used to
    /// persist the rolling window across restarts.
    pub fn all_snapshots(&self) -> Vec<MetricsSnapshot> {
        let mut all = self.history.clone();
        all.push(self.current.clone());
        all
    }

    /// Restores the window from a persisted snapshot list: everything
    /// but the last entry becomes rotated history, the last becomes the
    /// in-progress window.
    pub fn restore(&mut self, mut snapshots: Vec<MetricsSnapshot>) {
        let current = snapshots.pop().unwrap_or_else(|| MetricsSnapshot::started(Utc::now()));
        if snapshots.len() > self.window_count {
            let drop = snapshots.len() - self.window_count;
            snapshots.drain(0..drop);
        }
        self.history = snapshots;
        self.current = current;
    }
}

/// All threshold constants for the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub amber_silence_hours: i64,
    pub amber_backlog_threshold: u32,
    pub red_silence_hours: i64,
    pub red_critical_issue_threshold: u32,
    pub black_critical_issue_multiplier: u32,

    pub panic_threshold: f64,
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub max_adjust_step: f64,
    pub min_panic_cycles: u32,

    pub agent_strictness_multiplier: f64,
    pub window_duration_secs: i64,
    pub window_count: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            amber_silence_hours: 2,
            amber_backlog_threshold: 5,
            red_silence_hours: 6,
            red_critical_issue_threshold: 1,
            black_critical_issue_multiplier: 2,

            panic_threshold: 0.8,
            high_threshold: 0.3,
            low_threshold: 0.1,
            max_adjust_step: 0.1,
            min_panic_cycles: 3,

            agent_strictness_multiplier: 1.5,
            window_duration_secs: 60,
            window_count: 10,
        }
    }
}

/// Per-operation base risk, used by `estimate_operation_risk`.
fn base_operation_risk(operation: &str) -> f64 {
    match operation {
        "read_file" => 0.0,
        "exec_code" => 0.9,
        "trade_execute" => 0.95,
        "network_request" => 0.6,
        "modify_core" => 0.6,
        _ => 0.3,
    }
}

/// Per-operation admission threshold. Operations not listed fall back to
/// the agent's own reputation-weighted threshold (see `is_allowed`).
fn operation_threshold(operation: &str) -> Option<f64> {
    match operation {
        "exec_code" => Some(0.8),
        "delete_file" => Some(0.7),
        "trade_execute" => Some(0.9),
        "network_request" => Some(0.6),
        _ => None,
    }
}

/// Read-only operations permitted even at RED.
const RED_ALLOWED_OPERATIONS: &[&str] = &["read_file", "get_status", "list_operations"];
/// Monitoring-only operations permitted at BLACK.
const BLACK_ALLOWED_OPERATIONS: &[&str] = &["get_status", "health_check"];

pub type StateChangeCallback = Box<dyn Fn(AutonomyLevel, AutonomyLevel) + Send + Sync>;
pub type PanicModeCallback = Box<dyn Fn(PanicMode, PanicMode) + Send + Sync>;

struct MutableState {
    autonomy_level: AutonomyLevel,
    panic_mode: PanicMode,
    strictness: f64,
    panic_start: Option<DateTime<Utc>>,
    cooldown_cycles: u32,
    system_state: SystemState,
    host_activity: HostActivity,
    window: MetricsWindow,
    reputations: HashMap<String, AgentReputation>,
}

/// State machine over autonomy level (host-inactivity driven), panic mode
/// (rejection-rate driven), and per-agent reputation. All updates are
/// serialized through a single mutator path behind one lock; read paths
/// observe a consistent snapshot.
pub struct DynamicCircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<MutableState>,
    on_state_change: Option<StateChangeCallback>,
    on_panic_mode: Option<PanicModeCallback>,
}

impl DynamicCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let window = MetricsWindow::new(
            chrono::Duration::seconds(config.window_duration_secs),
            config.window_count,
        );
        Self {
            state: RwLock::new(MutableState {
                autonomy_level: AutonomyLevel::Green,
                panic_mode: PanicMode::Normal,
                strictness: 0.3,
                panic_start: None,
                cooldown_cycles: 0,
                system_state: SystemState::default(),
                host_activity: HostActivity::default(),
                window,
                reputations: HashMap::new(),
            }),
            config,
            on_state_change: None,
            on_panic_mode: None,
        }
    }

    pub fn with_state_change_callback(mut self, cb: StateChangeCallback) -> Self {
        self.on_state_change = Some(cb);
        self
    }

    pub fn with_panic_mode_callback(mut self, cb: PanicModeCallback) -> Self {
        self.on_panic_mode = Some(cb);
        self
    }

    pub fn autonomy_level(&self) -> AutonomyLevel {
        self.state.read().autonomy_level
    }

    pub fn panic_mode(&self) -> PanicMode {
        self.state.read().panic_mode
    }

    pub fn strictness(&self) -> f64 {
        self.state.read().strictness
    }

    pub fn cooldown_cycles(&self) -> u32 {
        self.state.read().cooldown_cycles
    }

    pub fn get_agent_reputation(&self, agent_id: &str) -> AgentReputation {
        self.state
            .read()
            .reputations
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| AgentReputation::new(agent_id))
    }

    /// Admin override. Per the resolved open question, this changes
    /// `autonomy_level` only; it never clears panic mode.
    pub fn set_autonomy_level(&self, level: AutonomyLevel) {
        let mut state = self.state.write();
        let old = state.autonomy_level;
        state.autonomy_level = level;
        drop(state);
        if old != level {
            if let Some(cb) = &self.on_state_change {
                cb(old, level);
            }
        }
    }

    pub fn record_human_activity(&self, action: impl Into<String>) {
        let mut state = self.state.write();
        state.host_activity = HostActivity {
            last_seen: Utc::now(),
            last_action: action.into(),
        };
        let old = state.autonomy_level;
        state.autonomy_level = AutonomyLevel::Green;
        drop(state);
        if old != AutonomyLevel::Green {
            if let Some(cb) = &self.on_state_change {
                cb(old, AutonomyLevel::Green);
            }
        }
    }

    pub fn update_system_state(&self, system_state: SystemState) {
        let mut state = self.state.write();
        state.system_state = system_state;
        self.escalate_if_needed(&mut state);
    }

    fn escalate_if_needed(&self, state: &mut MutableState) {
        let old = state.autonomy_level;
        let silence = Utc::now() - state.host_activity.last_seen;
        let silence_hours = silence.num_hours();

        let new_level = if state.system_state.critical_issues
            >= self.config.red_critical_issue_threshold * self.config.black_critical_issue_multiplier
        {
            AutonomyLevel::Black
        } else if silence_hours >= self.config.red_silence_hours
            && state.system_state.critical_issues >= self.config.red_critical_issue_threshold
        {
            AutonomyLevel::Red
        } else if silence_hours >= self.config.amber_silence_hours
            && state.system_state.backlog_size >= self.config.amber_backlog_threshold
        {
            AutonomyLevel::Amber
        } else {
            old
        };

        if new_level > old {
            state.autonomy_level = new_level;
            if let Some(cb) = &self.on_state_change {
                cb(old, new_level);
            }
        }
    }

    /// Per-request risk decision.
    pub fn is_allowed(&self, operation: &str, agent_id: &str) -> bool {
        let state = self.state.read();
        if state.panic_mode == PanicMode::Panic {
            return false;
        }
        let reputation = state
            .reputations
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| AgentReputation::new(agent_id));

        // Low-reputation agents face up to 1.5x stricter thresholds;
        // high-reputation up to 2x more lenient, bounded.
        let agent_threshold = state.strictness
            * (self.config.agent_strictness_multiplier - reputation.score).clamp(0.5, 1.5);

        // Operation-specific threshold overrides the agent threshold when
        // defined; the stricter (larger) of the two always wins.
        let op_threshold = operation_threshold(operation).unwrap_or(agent_threshold);
        let effective_threshold = agent_threshold.max(op_threshold);

        let op_risk = (base_operation_risk(operation) * (2.0 - reputation.score)).clamp(0.0, 1.0);

        op_risk <= effective_threshold
    }

    /// Records a request outcome: updates the window snapshot and the
    /// agent's reputation counters.
    pub fn record_request(&self, agent_id: &str, rejected: bool, forbidden: bool) {
        let mut state = self.state.write();
        state.window.record(agent_id, rejected, forbidden);
        let reputation = state
            .reputations
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentReputation::new(agent_id));
        reputation.record_outcome(rejected, forbidden);
    }

    /// Strictness adjustment, run on a tick.
    pub fn adjust_strictness(&self) {
        let mut state = self.state.write();
        let current_rate = state.window.current_rate();
        let avg_rate = state.window.average_rejection_rate();
        let old_panic = state.panic_mode;

        if current_rate >= self.config.panic_threshold {
            state.panic_mode = PanicMode::Panic;
            state.strictness = 1.0;
            state.cooldown_cycles = self.config.min_panic_cycles;
            state.panic_start = Some(Utc::now());
            tracing::error!(rate = current_rate, "circuit breaker entering panic mode");
        } else if state.panic_mode == PanicMode::Panic {
            if state.cooldown_cycles > 0 {
                state.cooldown_cycles -= 1;
            }
            if state.cooldown_cycles == 0 && avg_rate < self.config.high_threshold {
                state.panic_mode = PanicMode::Normal;
                state.strictness = (state.strictness - self.config.max_adjust_step).max(0.0);
            }
        } else if state.cooldown_cycles > 0 {
            // Cooling down from a prior elevation: strictness holds steady.
            // Still-high rate re-arms the cooldown instead of letting it
            // expire; otherwise it ticks down toward the normal branch.
            if avg_rate > self.config.high_threshold {
                state.cooldown_cycles = self.config.min_panic_cycles;
            } else {
                state.cooldown_cycles -= 1;
            }
        } else if avg_rate > self.config.high_threshold {
            state.strictness = (state.strictness + self.config.max_adjust_step).min(1.0);
            state.cooldown_cycles = self.config.min_panic_cycles;
            state.panic_mode = PanicMode::Elevated;
        } else if avg_rate < self.config.low_threshold {
            state.strictness = (state.strictness - self.config.max_adjust_step).max(0.0);
            if state.panic_mode == PanicMode::Elevated {
                state.panic_mode = PanicMode::Normal;
            }
        }

        state.window.rotate_if_needed();
        let new_panic = state.panic_mode;
        drop(state);
        if old_panic != new_panic {
            if let Some(cb) = &self.on_panic_mode {
                cb(old_panic, new_panic);
            }
        }
    }

    pub fn reset_panic_mode(&self) {
        let mut state = self.state.write();
        let old = state.panic_mode;
        state.panic_mode = PanicMode::Normal;
        state.cooldown_cycles = 0;
        state.strictness = 0.3;
        drop(state);
        if old != PanicMode::Normal {
            if let Some(cb) = &self.on_panic_mode {
                cb(old, PanicMode::Normal);
            }
        }
    }

    /// Whether `operation` passes the permission matrix for the current
    /// autonomy level, independent of strictness/reputation.
    pub fn permits_at_current_level(&self, operation: &str) -> bool {
        match self.autonomy_level() {
            AutonomyLevel::Green | AutonomyLevel::Amber => true,
            AutonomyLevel::Red => RED_ALLOWED_OPERATIONS.contains(&operation),
            AutonomyLevel::Black => BLACK_ALLOWED_OPERATIONS.contains(&operation),
        }
    }

    pub fn get_status(&self) -> CircuitBreakerStatus {
        let state = self.state.read();
        CircuitBreakerStatus {
            autonomy_level: state.autonomy_level,
            panic_mode: state.panic_mode,
            strictness: state.strictness,
            cooldown_cycles: state.cooldown_cycles,
            system_state: state.system_state.clone(),
            current_rejection_rate: state.window.current_rate(),
            average_rejection_rate: state.window.average_rejection_rate(),
        }
    }

    /// Builds the persisted-state snapshot: current autonomy level,
    /// system state, and the rolling window's history.
    pub fn to_snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.read();
        CircuitBreakerSnapshot {
            current_level: state.autonomy_level,
            system_state: state.system_state.clone(),
            history: state.window.all_snapshots(),
            timestamp: Utc::now(),
        }
    }

    /// Restores autonomy level, system state, and window history from a
    /// previously saved snapshot. Strictness, panic mode, and
    /// reputations are not part of the persisted shape and reset to
    /// their defaults, matching a cold-start circuit breaker that has
    /// just reloaded its last known level.
    pub fn restore_snapshot(&self, snapshot: CircuitBreakerSnapshot) {
        let mut state = self.state.write();
        state.autonomy_level = snapshot.current_level;
        state.system_state = snapshot.system_state;
        state.window.restore(snapshot.history);
    }

    /// Persists the current snapshot to `path` as JSON, matching the
    /// `{current_level, system_state, history, timestamp}` shape.
    pub fn save_state(&self, path: &std::path::Path) -> Result<(), crate::error::KernelError> {
        let snapshot = self.to_snapshot();
        let json = serde_json::to_string_pretty(&snapshot).map_err(|e| crate::error::KernelError::Internal(
            format!("failed to serialize circuit breaker state: {e}"),
        ))?;
        std::fs::write(path, json).map_err(|e| crate::error::KernelError::Internal(
            format!("failed to write circuit breaker state to {}: {e}", path.display()),
        ))
    }

    /// Loads a previously saved snapshot from `path` and applies it.
    pub fn load_state(&self, path: &std::path::Path) -> Result<(), crate::error::KernelError> {
        let text = std::fs::read_to_string(path).map_err(|e| crate::error::KernelError::Internal(
            format!("failed to read circuit breaker state from {}: {e}", path.display()),
        ))?;
        let snapshot: CircuitBreakerSnapshot = serde_json::from_str(&text).map_err(|e| crate::error::KernelError::Internal(
            format!("failed to parse circuit breaker state: {e}"),
        ))?;
        self.restore_snapshot(snapshot);
        Ok(())
    }
}

/// Persisted shape of circuit breaker state: `{current_level,
/// system_state, history, timestamp}`. Round-tripping through
/// `save_state`/`load_state` reproduces an equivalent `get_status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub current_level: AutonomyLevel,
    pub system_state: SystemState,
    pub history: Vec<MetricsSnapshot>,
    pub timestamp: DateTime<Utc>,
}

impl StrictnessProvider for DynamicCircuitBreaker {
    fn current_strictness(&self) -> f64 {
        self.strictness()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub autonomy_level: AutonomyLevel,
    pub panic_mode: PanicMode,
    pub strictness: f64,
    pub cooldown_cycles: u32,
    pub system_state: SystemState,
    pub current_rejection_rate: f64,
    pub average_rejection_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_dominance_denies_every_request() {
        let breaker = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        for _ in 0..10 {
            breaker.record_request("agent-x", true, false);
        }
        breaker.adjust_strictness();
        assert_eq!(breaker.panic_mode(), PanicMode::Panic);
        assert!(!breaker.is_allowed("read_file", "agent-x"));
        assert!(!breaker.is_allowed("anything", "trusted-agent"));
    }

    #[test]
    fn monotone_reputation_update() {
        let mut reputation = AgentReputation::new("agent-y");
        for _ in 0..4 {
            reputation.record_outcome(true, false);
        }
        // total_requests still < 5, score untouched.
        assert_eq!(reputation.score, 1.0);
        reputation.record_outcome(true, false);
        let rate_at_5 = reputation.rejection_rate();
        let score_at_5 = reputation.score;
        reputation.record_outcome(false, false);
        assert!(reputation.score >= score_at_5 || reputation.rejection_rate() < rate_at_5);
    }

    #[test]
    fn panic_holds_through_cooldown_then_exits_once_rate_recovers() {
        let breaker = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        for _ in 0..9 {
            breaker.record_request("agent-w", true, false);
        }
        breaker.record_request("agent-w", false, false);
        breaker.adjust_strictness();
        assert_eq!(breaker.panic_mode(), PanicMode::Panic);
        assert_eq!(breaker.cooldown_cycles(), 3);

        // Dilute the rate below panic_threshold (9/21 ≈ 0.43) but keep it
        // above high_threshold, so the three follow-up ticks decrement
        // cooldown through the "already PANIC" branch without meeting the
        // exit condition.
        for _ in 0..11 {
            breaker.record_request("agent-w", false, false);
        }
        for _ in 0..3 {
            breaker.adjust_strictness();
            assert_eq!(breaker.panic_mode(), PanicMode::Panic);
        }
        assert_eq!(breaker.cooldown_cycles(), 0);

        // More clean traffic drops the aggregate rate below high_threshold
        // (9/31 ≈ 0.29); with cooldown already at 0 the next tick exits.
        for _ in 0..10 {
            breaker.record_request("agent-w", false, false);
        }
        breaker.adjust_strictness();
        assert_eq!(breaker.panic_mode(), PanicMode::Normal);
    }

    #[test]
    fn admin_override_does_not_exit_panic() {
        let breaker = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        for _ in 0..10 {
            breaker.record_request("agent-z", true, false);
        }
        breaker.adjust_strictness();
        assert_eq!(breaker.panic_mode(), PanicMode::Panic);
        breaker.set_autonomy_level(AutonomyLevel::Green);
        assert_eq!(breaker.panic_mode(), PanicMode::Panic);
        assert_eq!(breaker.autonomy_level(), AutonomyLevel::Green);
    }

    #[test]
    fn black_level_blocks_non_read_operations() {
        let breaker = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        breaker.set_autonomy_level(AutonomyLevel::Black);
        assert!(!breaker.permits_at_current_level("modify_core"));
        assert!(breaker.permits_at_current_level("get_status"));
    }

    #[test]
    fn reputation_weighted_risk_favors_trusted_agents() {
        let breaker = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        // Build up a high-reputation agent (mostly successful requests).
        for _ in 0..10 {
            breaker.record_request("agent_a", false, false);
        }
        // And a low-reputation agent (mostly rejected, some forbidden).
        for _ in 0..10 {
            breaker.record_request("agent_b", true, true);
        }
        let rep_a = breaker.get_agent_reputation("agent_a");
        let rep_b = breaker.get_agent_reputation("agent_b");
        assert!(rep_a.score > rep_b.score);

        // A moderate-risk operation should be easier to permit for the
        // trusted agent than for the distrusted one.
        let allowed_a = breaker.is_allowed("network_request", "agent_a");
        let allowed_b = breaker.is_allowed("network_request", "agent_b");
        assert!(!allowed_b || allowed_a, "trusted agent should never be stricter than a distrusted one");
    }

    #[test]
    fn reputation_weighted_risk_matches_worked_example() {
        // agent_a score=1.0, agent_b score=0.0, strictness=0.5,
        // network_request base risk 0.6: agent_a is allowed, agent_b is
        // denied, by the exact threshold/op-risk formulas.
        let breaker = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        {
            let mut state = breaker.state.write();
            state.strictness = 0.5;
            state.reputations.insert("agent_a".to_string(), {
                let mut r = AgentReputation::new("agent_a");
                r.score = 1.0;
                r
            });
            state.reputations.insert("agent_b".to_string(), {
                let mut r = AgentReputation::new("agent_b");
                r.score = 0.0;
                r
            });
        }

        assert!(breaker.is_allowed("network_request", "agent_a"));
        assert!(!breaker.is_allowed("network_request", "agent_b"));
    }

    #[test]
    fn red_level_permits_only_read_ops() {
        let breaker = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        breaker.set_autonomy_level(AutonomyLevel::Red);
        assert!(breaker.permits_at_current_level("read_file"));
        assert!(!breaker.permits_at_current_level("exec_code"));
    }

    #[test]
    fn round_trip_through_file_preserves_level_and_counters() {
        let breaker = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        breaker.set_autonomy_level(AutonomyLevel::Amber);
        for _ in 0..4 {
            breaker.record_request("agent-p", true, false);
        }
        breaker.update_system_state(SystemState {
            backlog_size: 12,
            critical_issues: 2,
            failed_deployments: 1,
            last_error: Some("deploy timeout".to_string()),
            resource_usage: HashMap::from([("cpu".to_string(), 0.82)]),
        });

        let before = breaker.to_snapshot();
        let path = std::env::temp_dir().join(format!("circuit-breaker-roundtrip-{}.json", std::process::id()));
        breaker.save_state(&path).unwrap();

        let restored = DynamicCircuitBreaker::new(CircuitBreakerConfig::default());
        restored.load_state(&path).unwrap();
        let after = restored.to_snapshot();

        assert_eq!(before.current_level, after.current_level);
        assert_eq!(before.system_state.backlog_size, after.system_state.backlog_size);
        assert_eq!(before.system_state.last_error, after.system_state.last_error);
        assert_eq!(
            before.history.iter().map(|s| s.total).sum::<u64>(),
            after.history.iter().map(|s| s.total).sum::<u64>()
        );
        assert_eq!(restored.autonomy_level(), AutonomyLevel::Amber);

        let _ = std::fs::remove_file(&path);
    }
}
