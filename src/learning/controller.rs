//! Learning Controller - supervises the detect/plan/execute/evaluate loop
//!
//! Two background tasks run while the controller is started:
//! - the cycle loop, the only writer of `ControllerState`
//! - the stop monitor, which only ever raises the `StopSignal`
//!
//! Errors inside either task are logged and recorded in the state; they
//! never end the process.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::detector::GapDetector;
use super::executor::LearningExecutor;
use super::generator::ContentGenerator;
use super::planner::LearningPlanner;
use super::state::{ControllerEvent, ControllerPhase, ControllerState, LearningCycleRecord, StopSignal};
use super::stop::{coverage_score, evaluate_stop, quality_score, StopInputs, StopReason};
use crate::config::{LearningConfig, StopConfig};
use crate::error::{KnowledgeError, Result};
use crate::memory::HybridSearchEngine;

/// Smallest monitor tick accepted
const MIN_MONITOR_TICK: Duration = Duration::from_millis(10);

/// Cycle records included in a status snapshot
const STATUS_HISTORY: usize = 10;

/// Point-in-time view of the controller, for display and APIs
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub phase: ControllerPhase,
    pub is_running: bool,
    pub cycle_count: u64,
    pub total_learned_items: u64,
    pub coverage_score: f64,
    pub quality_score: f64,
    pub gap_ratio: Option<f64>,
    pub consecutive_no_improvement: u32,
    pub last_quality_score: f64,
    pub should_stop: bool,
    pub stop_reason: Option<StopReason>,
    pub start_time: Option<DateTime<Utc>>,
    pub elapsed_secs: Option<f64>,
    pub next_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_gap_keys: Vec<String>,
    pub thresholds: StopConfig,
    pub recent_history: Vec<LearningCycleRecord>,
}

struct Inner {
    engine: Arc<HybridSearchEngine>,
    detector: GapDetector,
    planner: LearningPlanner,
    executor: LearningExecutor,
    config: LearningConfig,
    state: RwLock<ControllerState>,
    signal: StopSignal,
    /// Serializes cycles between the loop and direct `run_cycle` callers
    cycle_lock: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Autonomous learning controller
#[derive(Clone)]
pub struct LearningController {
    inner: Arc<Inner>,
}

impl LearningController {
    pub fn new(
        engine: Arc<HybridSearchEngine>,
        generator: Arc<dyn ContentGenerator>,
        config: LearningConfig,
    ) -> Self {
        let detector = GapDetector::new(engine.clone(), config.taxonomy.clone(), config.gap_threshold)
            .with_results_per_item(config.results_per_item);
        let planner = LearningPlanner::new(&config);
        let executor = LearningExecutor::new(engine.clone(), generator, &config);
        let state = ControllerState::new(config.history_capacity);

        Self {
            inner: Arc::new(Inner {
                engine,
                detector,
                planner,
                executor,
                config,
                state: RwLock::new(state),
                signal: StopSignal::new(),
                cycle_lock: Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the cycle loop and the stop monitor
    pub async fn start(&self) -> Result<()> {
        if self.inner.signal.should_stop() {
            return Err(KnowledgeError::InvalidInput(
                "controller has stopped; build a new one to restart".to_string(),
            ));
        }

        {
            let mut state = self.inner.state.write().await;
            if state.is_running {
                return Err(KnowledgeError::InvalidInput("controller is already running".to_string()));
            }
            state.is_running = true;
            state.start_time = Some(Utc::now());
        }

        info!(
            "Autonomous learning started: {} taxonomy keys, up to {} goals per cycle",
            self.inner.detector.taxonomy().len(),
            self.inner.config.max_learning_per_cycle
        );

        let cycle = tokio::spawn(self.inner.clone().cycle_loop());
        let monitor = tokio::spawn(self.inner.clone().monitor_loop());
        self.inner.tasks.lock().await.extend([cycle, monitor]);
        Ok(())
    }

    /// Request a stop; the goal in flight finishes first
    pub fn stop(&self) {
        if self.inner.signal.trigger(StopReason::Manual) {
            info!("Learning stop requested");
        }
    }

    /// Wait until a stop condition fires and both tasks have exited
    pub async fn wait_stopped(&self) {
        self.inner.signal.stopped().await;
        let handles: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Learning task ended abnormally: {}", e);
            }
        }
    }

    pub fn should_stop(&self) -> bool {
        self.inner.signal.should_stop()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.inner.signal.reason().cloned()
    }

    /// Run one detect/plan/execute/evaluate cycle now
    pub async fn run_cycle(&self) -> Result<LearningCycleRecord> {
        self.inner.run_cycle().await
    }

    /// Evaluate the stop rules once, raising the stop flag if one holds
    pub async fn check_stop_conditions(&self) -> Result<Option<StopReason>> {
        self.inner.check_stop_conditions().await
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        let coverage = self.inner.coverage().await?;
        let state = self.inner.state.read().await;
        let history = state.history();

        let elapsed_secs = state
            .start_time
            .map(|start| (Utc::now() - start).to_std().unwrap_or_default().as_secs_f64());

        Ok(ControllerStatus {
            phase: state.phase,
            is_running: state.is_running,
            cycle_count: state.cycle_count,
            total_learned_items: state.total_learned_items,
            coverage_score: coverage,
            quality_score: quality_score(history.iter(), coverage),
            gap_ratio: state.gap_ratio,
            consecutive_no_improvement: state.consecutive_no_improvement,
            last_quality_score: state.last_quality_score,
            should_stop: self.inner.signal.should_stop(),
            stop_reason: self.inner.signal.reason().cloned(),
            start_time: state.start_time,
            elapsed_secs,
            next_cycle_at: state.next_cycle_at,
            last_error: state.last_error.clone(),
            last_gap_keys: state.last_gap_keys.clone(),
            thresholds: self.inner.config.stop.clone(),
            recent_history: history.iter().rev().take(STATUS_HISTORY).rev().cloned().collect(),
        })
    }
}

impl Inner {
    async fn coverage(&self) -> Result<f64> {
        let total = self.engine.store().count().await?;
        Ok(coverage_score(total, self.config.expected_max_entries))
    }

    async fn run_cycle(&self) -> Result<LearningCycleRecord> {
        let _cycle = self.cycle_lock.lock().await;

        let cycle = {
            let mut state = self.state.write().await;
            state.cycle_count += 1;
            state.apply(ControllerEvent::CycleStarted);
            state.cycle_count
        };
        info!("Starting learning cycle {}", cycle);

        let report = match self.detector.detect().await {
            Ok(report) => report,
            Err(e) => {
                let mut state = self.state.write().await;
                state.apply(ControllerEvent::CycleFailed);
                state.last_error = Some(format!("cycle {} gap detection: {}", cycle, e));
                return Err(e);
            }
        };
        let gap_ratio = report.gap_ratio();
        {
            let mut state = self.state.write().await;
            state.gap_ratio = Some(gap_ratio);
            state.last_gap_keys = report.gap_keys();
            state.apply(ControllerEvent::GapsDetected);
        }

        let plan = self.planner.plan(&report.gaps);
        self.state.write().await.apply(ControllerEvent::PlanReady);

        let summary = self.executor.execute(plan.selected, self.signal.token()).await;
        {
            let mut state = self.state.write().await;
            state.total_learned_items += summary.succeeded as u64;
            state.apply(ControllerEvent::ExecutionFinished);
        }

        let coverage = match self.coverage().await {
            Ok(coverage) => coverage,
            Err(e) => {
                warn!("Coverage unavailable after cycle {}: {}", cycle, e);
                0.0
            }
        };

        let mut state = self.state.write().await;
        // Scored on the cycles before this one, so a cold start never
        // registers as an improvement
        let quality = quality_score(state.history().iter(), coverage);
        let improved = state.observe_quality(quality);

        let record = LearningCycleRecord {
            cycle,
            goals_attempted: summary.attempted,
            goals_succeeded: summary.succeeded,
            quality_score: quality,
            coverage_score: coverage,
            gap_ratio,
            timestamp: Utc::now(),
        };
        state.record_cycle(record.clone());
        state.last_error = None;
        state.apply(ControllerEvent::CycleEvaluated);

        info!(
            "Learning cycle {} done: {}/{} goals learned, quality {:.2} ({}), gap ratio {:.2}",
            cycle,
            summary.succeeded,
            summary.attempted,
            quality,
            if improved {
                "improved".to_string()
            } else {
                format!("{} cycles without improvement", state.consecutive_no_improvement)
            },
            gap_ratio
        );

        Ok(record)
    }

    async fn check_stop_conditions(&self) -> Result<Option<StopReason>> {
        if let Some(reason) = self.signal.reason() {
            return Ok(Some(reason.clone()));
        }

        let coverage = self.coverage().await?;
        let inputs = {
            let state = self.state.read().await;
            StopInputs {
                cycle_count: state.cycle_count,
                elapsed: state
                    .start_time
                    .map(|start| (Utc::now() - start).to_std().unwrap_or_default())
                    .unwrap_or_default(),
                coverage,
                quality: quality_score(state.history().iter(), coverage),
                gap_ratio: state.gap_ratio,
                consecutive_no_improvement: state.consecutive_no_improvement,
            }
        };

        match evaluate_stop(&inputs, &self.config.stop) {
            Some(reason) => {
                if self.signal.trigger(reason.clone()) {
                    info!("Stop condition met: {}", reason);
                }
                Ok(self.signal.reason().cloned())
            }
            None => Ok(None),
        }
    }

    async fn cycle_loop(self: Arc<Self>) {
        while !self.signal.should_stop() {
            let wait = match self.run_cycle().await {
                Ok(record) => self.config.cycle_interval(record.cycle),
                Err(e) => {
                    error!("Learning cycle failed: {}", e);
                    self.config.error_backoff()
                }
            };

            if let Err(e) = self.check_stop_conditions().await {
                warn!("Stop check after cycle failed: {}", e);
            }
            if self.signal.should_stop() {
                break;
            }

            {
                let next = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
                self.state.write().await.next_cycle_at = Some(next);
            }
            debug!("Next learning cycle in {:.0}s", wait.as_secs_f64());

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.signal.stopped() => {}
            }
        }

        let mut state = self.state.write().await;
        state.apply(ControllerEvent::StopRequested);
        state.is_running = false;
        state.next_cycle_at = None;
        info!(
            "Autonomous learning stopped after {} cycles: {}",
            state.cycle_count,
            self.signal.reason().map(ToString::to_string).unwrap_or_default()
        );
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval().max(MIN_MONITOR_TICK));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.signal.stopped() => break,
            }

            if let Err(e) = self.check_stop_conditions().await {
                warn!("Stop condition check failed: {}", e);
            }
            if self.signal.should_stop() {
                break;
            }
        }
        debug!("Stop monitor exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, SearchConfig};
    use crate::learning::generator::TemplateContentGenerator;
    use crate::learning::taxonomy::Taxonomy;
    use crate::memory::{CacheLayer, InMemoryKnowledgeStore};

    fn controller(config: LearningConfig) -> LearningController {
        let engine = Arc::new(HybridSearchEngine::new(
            Arc::new(InMemoryKnowledgeStore::new()),
            None,
            Arc::new(CacheLayer::local(&CacheConfig::default())),
            SearchConfig::default(),
        ));
        LearningController::new(engine, Arc::new(TemplateContentGenerator), config)
    }

    fn quick_config() -> LearningConfig {
        LearningConfig {
            taxonomy: Taxonomy::from_keys(["bank_info:Acme Savings", "bank_info:Borealis Credit"]).unwrap(),
            inter_goal_delay_secs: 0.0,
            base_interval_secs: 0.01,
            min_interval_secs: 0.01,
            monitor_interval_secs: 0.01,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_cycle_records_history() {
        let controller = controller(quick_config());
        let record = controller.run_cycle().await.unwrap();

        assert_eq!(record.cycle, 1);
        assert_eq!(record.goals_attempted, 2);
        assert_eq!(record.goals_succeeded, 2);
        assert!((record.gap_ratio - 1.0).abs() < 1e-12);

        let status = controller.status().await.unwrap();
        assert_eq!(status.phase, ControllerPhase::Idle);
        assert_eq!(status.cycle_count, 1);
        assert_eq!(status.total_learned_items, 2);
        // first cycle is scored on an empty history
        assert_eq!(status.consecutive_no_improvement, 1);
        assert_eq!(status.recent_history.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_stop_is_terminal() {
        let controller = controller(quick_config());
        controller.stop();
        assert!(controller.should_stop());
        assert_eq!(controller.stop_reason(), Some(StopReason::Manual));
        assert!(controller.start().await.is_err());

        // a later condition does not replace the first reason
        assert_eq!(controller.check_stop_conditions().await.unwrap(), Some(StopReason::Manual));
    }

    #[tokio::test]
    async fn test_started_controller_stops_on_gap_ratio() {
        let controller = controller(quick_config());
        controller.start().await.unwrap();
        assert!(controller.start().await.is_err());

        tokio::time::timeout(Duration::from_secs(10), controller.wait_stopped())
            .await
            .expect("controller did not stop");

        // cycle 1 learns both items, cycle 2 finds no gaps left
        assert!(matches!(controller.stop_reason(), Some(StopReason::GapRatio { .. })));
        let status = controller.status().await.unwrap();
        assert_eq!(status.phase, ControllerPhase::Stopped);
        assert!(!status.is_running);
        assert_eq!(status.cycle_count, 2);
    }
}
