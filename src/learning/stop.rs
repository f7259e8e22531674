//! Stop conditions and the metrics they are computed from

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::state::LearningCycleRecord;
use crate::config::StopConfig;

/// Cycle records considered by the quality score
const QUALITY_WINDOW: usize = 10;

/// Why the controller stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    MaxCycles { cycles: u64 },
    MaxDuration { hours: f64 },
    Coverage { score: f64 },
    Quality { score: f64 },
    GapRatio { ratio: f64 },
    Stagnation { cycles: u32 },
    Manual,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxCycles { cycles } => write!(f, "reached maximum cycle count: {}", cycles),
            StopReason::MaxDuration { hours } => write!(f, "reached maximum learning time: {:.1}h", hours),
            StopReason::Coverage { score } => write!(f, "knowledge coverage reached: {:.2}", score),
            StopReason::Quality { score } => write!(f, "quality score reached: {:.2}", score),
            StopReason::GapRatio { ratio } => write!(f, "gap ratio low enough: {:.2}", ratio),
            StopReason::Stagnation { cycles } => write!(f, "no improvement for {} consecutive cycles", cycles),
            StopReason::Manual => write!(f, "stopped on request"),
        }
    }
}

/// Snapshot of everything the stop rules look at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopInputs {
    pub cycle_count: u64,
    pub elapsed: Duration,
    pub coverage: f64,
    pub quality: f64,
    /// `None` until the first detection pass has completed
    pub gap_ratio: Option<f64>,
    pub consecutive_no_improvement: u32,
}

/// First stop condition that holds, checked in a fixed order
pub fn evaluate_stop(inputs: &StopInputs, limits: &StopConfig) -> Option<StopReason> {
    if inputs.cycle_count >= limits.max_cycles {
        return Some(StopReason::MaxCycles { cycles: inputs.cycle_count });
    }

    let hours = inputs.elapsed.as_secs_f64() / 3600.0;
    if hours >= limits.max_hours {
        return Some(StopReason::MaxDuration { hours });
    }

    // Cold-start guards: an empty store or a history without successes
    // must not count as having met the target
    if inputs.coverage > 0.0 && inputs.coverage >= limits.min_coverage {
        return Some(StopReason::Coverage { score: inputs.coverage });
    }
    if inputs.quality > 0.1 && inputs.quality >= limits.min_quality {
        return Some(StopReason::Quality { score: inputs.quality });
    }

    if let Some(ratio) = inputs.gap_ratio {
        if ratio <= limits.max_gap_ratio {
            return Some(StopReason::GapRatio { ratio });
        }
    }

    if inputs.consecutive_no_improvement >= limits.max_stagnation {
        return Some(StopReason::Stagnation { cycles: inputs.consecutive_no_improvement });
    }

    None
}

/// Store size relative to the expected maximum, capped at 1
pub fn coverage_score(total_entries: usize, expected_max: usize) -> f64 {
    if expected_max == 0 {
        return 1.0;
    }
    (total_entries as f64 / expected_max as f64).min(1.0)
}

/// Successful / attempted goals over the most recent cycles
pub fn recent_success_rate<'a, I>(history: I) -> Option<f64>
where
    I: DoubleEndedIterator<Item = &'a LearningCycleRecord>,
{
    let (attempted, succeeded) = history
        .rev()
        .take(QUALITY_WINDOW)
        .fold((0usize, 0usize), |(a, s), r| (a + r.goals_attempted, s + r.goals_succeeded));

    if attempted == 0 {
        None
    } else {
        Some(succeeded as f64 / attempted as f64)
    }
}

/// `0.6 * recent success rate + 0.4 * coverage`; zero without attempts
pub fn quality_score<'a, I>(history: I, coverage: f64) -> f64
where
    I: DoubleEndedIterator<Item = &'a LearningCycleRecord>,
{
    match recent_success_rate(history) {
        Some(rate) => 0.6 * rate + 0.4 * coverage,
        None => 0.0,
    }
}
