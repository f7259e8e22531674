//! Autonomous Learning System
//!
//! Measures knowledge coverage against a domain taxonomy, plans which gaps
//! to fill, generates and ingests new entries, and decides when to stop.

pub mod taxonomy;
pub mod detector;
pub mod planner;
pub mod generator;
pub mod executor;
pub mod state;
pub mod stop;
pub mod controller;

pub use taxonomy::{Taxonomy, LearningGap, default_taxonomy};
pub use detector::{GapDetector, GapReport};
pub use planner::{LearningPlanner, LearningGoal, LearningPlan, GoalStatus};
pub use generator::{
    ContentGenerator, ContentKind, LlmContentGenerator, TemplateContentGenerator, TieredContentGenerator,
};
pub use executor::{LearningExecutor, ExecutionSummary, LEARNING_SOURCE};
pub use state::{ControllerPhase, ControllerEvent, ControllerState, LearningCycleRecord, StopSignal, transition};
pub use stop::{StopReason, StopInputs, evaluate_stop, coverage_score, quality_score};
pub use controller::{LearningController, ControllerStatus};
