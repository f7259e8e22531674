//! Gap Detector - measures how well the knowledge store covers the taxonomy
//!
//! Each taxonomy item is looked up with a hybrid search. An item with no hits,
//! or whose hits score poorly on average, is reported as a gap.

use std::sync::Arc;
use tracing::{debug, info};

use super::taxonomy::{LearningGap, Taxonomy};
use crate::error::Result;
use crate::memory::{HybridSearchEngine, SearchMode, SearchRequest};

/// Outcome of one detection pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapReport {
    /// One entry per under-covered domain key
    pub gaps: Vec<LearningGap>,
    /// Number of taxonomy keys checked
    pub total_keys: usize,
}

impl GapReport {
    /// Fraction of taxonomy keys that are gaps
    pub fn gap_ratio(&self) -> f64 {
        if self.total_keys == 0 {
            0.0
        } else {
            self.gaps.len() as f64 / self.total_keys as f64
        }
    }

    pub fn gap_keys(&self) -> Vec<String> {
        self.gaps.iter().map(LearningGap::domain_key).collect()
    }
}

/// Taxonomy coverage detector
pub struct GapDetector {
    engine: Arc<HybridSearchEngine>,
    taxonomy: Taxonomy,
    gap_threshold: f32,
    results_per_item: usize,
}

impl GapDetector {
    pub fn new(engine: Arc<HybridSearchEngine>, taxonomy: Taxonomy, gap_threshold: f32) -> Self {
        Self {
            engine,
            taxonomy,
            gap_threshold,
            results_per_item: 3,
        }
    }

    /// Results inspected per taxonomy item
    pub fn with_results_per_item(mut self, results_per_item: usize) -> Self {
        self.results_per_item = results_per_item.max(1);
        self
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Search for every taxonomy item
    ///
    /// A store failure aborts the pass; the caller decides whether to retry.
    pub async fn detect(&self) -> Result<GapReport> {
        let mut report = GapReport {
            total_keys: self.taxonomy.len(),
            ..Default::default()
        };

        for (category, item) in self.taxonomy.entries() {
            let request = SearchRequest::new(item)
                .max_results(self.results_per_item)
                .mode(SearchMode::Hybrid);
            let results = self.engine.search(&request).await?;

            let is_gap = if results.is_empty() {
                true
            } else {
                let mean = results.iter().map(|r| r.score).sum::<f32>() / results.len() as f32;
                debug!("Coverage of {}:{} mean score {:.3}", category, item, mean);
                mean < self.gap_threshold
            };

            if is_gap {
                report.gaps.push(LearningGap::new(category, item));
            }
        }

        info!(
            "Detected {} knowledge gaps across {} taxonomy keys",
            report.gaps.len(),
            report.total_keys
        );
        Ok(report)
    }
}
