//! Learning Planner - turns detected gaps into a prioritized, bounded plan

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::taxonomy::LearningGap;
use crate::config::LearningConfig;

/// Lifecycle of a learning goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Pending,
    Completed,
    Failed,
}

/// A gap scheduled for remediation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningGoal {
    pub gap: LearningGap,
    pub priority: f64,
    pub status: GoalStatus,
}

/// Goals selected for this cycle plus those left for later
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearningPlan {
    pub selected: Vec<LearningGoal>,
    /// Still pending; picked up by a later cycle if the gap persists
    pub deferred: Vec<LearningGoal>,
}

impl LearningPlan {
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

pub struct LearningPlanner {
    weights: BTreeMap<String, f64>,
    unknown_weight: f64,
    jitter: (f64, f64),
    max_per_cycle: usize,
}

impl LearningPlanner {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            weights: config.category_weights.clone(),
            unknown_weight: config.unknown_category_weight,
            jitter: (config.jitter_min, config.jitter_max),
            max_per_cycle: config.max_learning_per_cycle,
        }
    }

    /// Base weight of a gap's category
    pub fn base_weight(&self, category: &str) -> f64 {
        self.weights.get(category).copied().unwrap_or(self.unknown_weight)
    }

    pub fn plan(&self, gaps: &[LearningGap]) -> LearningPlan {
        self.plan_with_rng(gaps, &mut rand::rng())
    }

    /// Plan with a caller-supplied random source (seeded in tests)
    pub fn plan_with_rng<R: Rng>(&self, gaps: &[LearningGap], rng: &mut R) -> LearningPlan {
        let (lo, hi) = self.jitter;
        let mut goals: Vec<LearningGoal> = gaps
            .iter()
            .map(|gap| {
                let jitter = if hi > lo { rng.random_range(lo..=hi) } else { lo };
                LearningGoal {
                    gap: gap.clone(),
                    priority: self.base_weight(&gap.category) * jitter,
                    status: GoalStatus::Pending,
                }
            })
            .collect();

        goals.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        let split = goals.len().min(self.max_per_cycle);
        let deferred = goals.split_off(split);
        debug!("Planned {} goals, deferred {}", goals.len(), deferred.len());

        LearningPlan {
            selected: goals,
            deferred,
        }
    }
}
