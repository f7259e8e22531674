//! Controller state machine and the state shared between the cycle loop
//! and the stop monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

use super::stop::StopReason;

/// Phase of the learning controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    /// Waiting for the next cycle
    Idle,
    Detecting,
    Planning,
    Executing,
    Evaluating,
    /// Terminal until the controller is rebuilt
    Stopped,
}

/// Something that happened to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    CycleStarted,
    GapsDetected,
    PlanReady,
    ExecutionFinished,
    CycleEvaluated,
    /// The cycle was abandoned after an error
    CycleFailed,
    StopRequested,
}

/// Pure transition function. Events that make no sense in the current
/// phase leave it unchanged; `Stopped` absorbs everything.
pub fn transition(phase: ControllerPhase, event: ControllerEvent) -> ControllerPhase {
    use ControllerEvent as E;
    use ControllerPhase as P;

    match (phase, event) {
        (P::Stopped, _) => P::Stopped,
        (_, E::StopRequested) => P::Stopped,
        (P::Idle, E::CycleStarted) => P::Detecting,
        (P::Detecting, E::GapsDetected) => P::Planning,
        (P::Planning, E::PlanReady) => P::Executing,
        (P::Executing, E::ExecutionFinished) => P::Evaluating,
        (P::Evaluating, E::CycleEvaluated) => P::Idle,
        (P::Detecting | P::Planning | P::Executing | P::Evaluating, E::CycleFailed) => P::Idle,
        (current, _) => current,
    }
}

/// One completed learning cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningCycleRecord {
    pub cycle: u64,
    pub goals_attempted: usize,
    pub goals_succeeded: usize,
    pub quality_score: f64,
    pub coverage_score: f64,
    pub gap_ratio: f64,
    pub timestamp: DateTime<Utc>,
}

/// Controller bookkeeping; written only by the cycle loop
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub phase: ControllerPhase,
    pub is_running: bool,
    pub cycle_count: u64,
    pub consecutive_no_improvement: u32,
    pub last_quality_score: f64,
    pub total_learned_items: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub next_cycle_at: Option<DateTime<Utc>>,
    /// Gap ratio of the latest detection pass
    pub gap_ratio: Option<f64>,
    pub last_gap_keys: Vec<String>,
    pub last_error: Option<String>,
    history: VecDeque<LearningCycleRecord>,
    history_capacity: usize,
}

impl ControllerState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            phase: ControllerPhase::Idle,
            is_running: false,
            cycle_count: 0,
            consecutive_no_improvement: 0,
            last_quality_score: 0.0,
            total_learned_items: 0,
            start_time: None,
            next_cycle_at: None,
            gap_ratio: None,
            last_gap_keys: Vec::new(),
            last_error: None,
            history: VecDeque::with_capacity(history_capacity),
            history_capacity: history_capacity.max(1),
        }
    }

    /// Advance the phase; returns the new phase
    pub fn apply(&mut self, event: ControllerEvent) -> ControllerPhase {
        self.phase = transition(self.phase, event);
        self.phase
    }

    /// Append a cycle record, dropping the oldest beyond capacity
    pub fn record_cycle(&mut self, record: LearningCycleRecord) {
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn history(&self) -> &VecDeque<LearningCycleRecord> {
        &self.history
    }

    /// Update the stagnation counter against the previous quality score
    pub fn observe_quality(&mut self, quality: f64) -> bool {
        let improved = quality > self.last_quality_score;
        if improved {
            self.consecutive_no_improvement = 0;
        } else {
            self.consecutive_no_improvement += 1;
        }
        self.last_quality_score = quality;
        improved
    }
}

/// Monotonic stop flag plus the reason it was raised
///
/// The reason is recorded before the token is cancelled, so anyone who
/// observes the cancellation can read it.
#[derive(Debug, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: OnceLock<StopReason>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag; only the first reason sticks. Returns whether this
    /// call was the one that stopped the controller.
    pub fn trigger(&self, reason: StopReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn should_stop(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&StopReason> {
        self.reason.get()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the flag is raised
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}
