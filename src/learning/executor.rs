//! Learning Executor - generates and ingests knowledge for planned goals
//!
//! Each goal runs in isolation: a timeout, a generator error, empty output
//! or a failed insert marks that goal failed and the batch moves on.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::generator::{title_for, ContentGenerator};
use super::planner::{GoalStatus, LearningGoal};
use super::taxonomy::LearningGap;
use crate::config::LearningConfig;
use crate::error::{KnowledgeError, Result};
use crate::memory::{HybridSearchEngine, KnowledgeId, Metadata};

/// Provenance tag written on every learned entry
pub const LEARNING_SOURCE: &str = "autonomous_learning";

/// Result of running one plan
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    /// Goals with their final status; unreached goals stay pending
    pub goals: Vec<LearningGoal>,
    pub attempted: usize,
    pub succeeded: usize,
    pub learned_ids: Vec<KnowledgeId>,
    /// Stopped early because cancellation was requested
    pub interrupted: bool,
}

pub struct LearningExecutor {
    engine: Arc<HybridSearchEngine>,
    generator: Arc<dyn ContentGenerator>,
    timeout: Duration,
    inter_goal_delay: Duration,
}

impl LearningExecutor {
    pub fn new(
        engine: Arc<HybridSearchEngine>,
        generator: Arc<dyn ContentGenerator>,
        config: &LearningConfig,
    ) -> Self {
        Self {
            engine,
            generator,
            timeout: config.generation_timeout(),
            inter_goal_delay: config.inter_goal_delay(),
        }
    }

    /// Run the goals in order
    ///
    /// Cancellation is checked between goals; a goal that has started always
    /// finishes. Cached search results are dropped once anything was learned
    /// so the next detection pass sees the new entries.
    pub async fn execute(&self, goals: Vec<LearningGoal>, cancel: &CancellationToken) -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        let total = goals.len();

        for (index, mut goal) in goals.into_iter().enumerate() {
            if summary.interrupted || cancel.is_cancelled() {
                summary.interrupted = true;
                summary.goals.push(goal);
                continue;
            }

            summary.attempted += 1;
            match self.learn(&goal.gap).await {
                Ok(id) => {
                    info!("Learned {} as entry {}", goal.gap, id);
                    goal.status = GoalStatus::Completed;
                    summary.succeeded += 1;
                    summary.learned_ids.push(id);
                }
                Err(e) => {
                    warn!("Learning goal {} failed: {}", goal.gap, e);
                    goal.status = GoalStatus::Failed;
                }
            }
            summary.goals.push(goal);

            if index + 1 < total && !self.inter_goal_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.inter_goal_delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        if summary.succeeded > 0 {
            self.engine.invalidate_search_cache().await;
        }

        summary
    }

    /// Generate content for one gap and store it
    pub async fn learn(&self, gap: &LearningGap) -> Result<KnowledgeId> {
        let content = tokio::time::timeout(self.timeout, self.generator.generate(gap))
            .await
            .map_err(|_| {
                KnowledgeError::ContentGeneration(format!(
                    "{} timed out after {:.1}s",
                    self.generator.name(),
                    self.timeout.as_secs_f64()
                ))
            })??;

        if content.trim().is_empty() {
            return Err(KnowledgeError::ContentGeneration(format!(
                "{} returned empty output", self.generator.name()
            )));
        }

        self.engine
            .add_knowledge(&gap.category, &title_for(gap), &content, provenance(gap))
            .await
    }
}

fn provenance(gap: &LearningGap) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("learning_source".into(), LEARNING_SOURCE.into());
    metadata.insert("target".into(), gap.domain_key().into());
    metadata.insert("timestamp".into(), Utc::now().to_rfc3339().into());
    metadata.insert("learning_type".into(), gap.category.clone().into());
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, SearchConfig};
    use crate::learning::generator::{TemplateContentGenerator, TieredContentGenerator};
    use crate::memory::{CacheLayer, InMemoryKnowledgeStore};
    use async_trait::async_trait;

    /// Fails for items named "bad", hangs for "slow", echoes otherwise
    struct Picky;

    #[async_trait]
    impl ContentGenerator for Picky {
        fn name(&self) -> &str {
            "picky"
        }

        async fn generate(&self, gap: &LearningGap) -> Result<String> {
            match gap.item.as_str() {
                "bad" => Err(KnowledgeError::ContentGeneration("refused".into())),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok("late".into())
                }
                "blank" => Ok(String::new()),
                item => Ok(format!("Facts about {}", item)),
            }
        }
    }

    fn executor() -> (LearningExecutor, Arc<HybridSearchEngine>) {
        let engine = Arc::new(HybridSearchEngine::new(
            Arc::new(InMemoryKnowledgeStore::new()),
            None,
            Arc::new(CacheLayer::local(&CacheConfig::default())),
            SearchConfig::default(),
        ));
        let config = LearningConfig {
            generation_timeout_secs: 0.1,
            inter_goal_delay_secs: 0.0,
            ..Default::default()
        };
        (LearningExecutor::new(engine.clone(), Arc::new(Picky), &config), engine)
    }

    fn goal(item: &str) -> LearningGoal {
        LearningGoal {
            gap: LearningGap::new("bank_info", item),
            priority: 0.4,
            status: GoalStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_batch() {
        let (executor, engine) = executor();
        let goals = vec![goal("bad"), goal("slow"), goal("blank"), goal("Acme")];

        let summary = executor.execute(goals, &CancellationToken::new()).await;
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 1);
        let statuses: Vec<_> = summary.goals.iter().map(|g| g.status).collect();
        assert_eq!(
            statuses,
            vec![GoalStatus::Failed, GoalStatus::Failed, GoalStatus::Failed, GoalStatus::Completed]
        );

        let entry = engine.get_knowledge(summary.learned_ids[0]).await.unwrap();
        assert_eq!(entry.content, "Facts about Acme");
        assert_eq!(entry.metadata["learning_source"], LEARNING_SOURCE);
        assert_eq!(entry.metadata["target"], "bank_info:Acme");
        assert!(entry.metadata.contains_key("timestamp"));
    }

    #[tokio::test]
    async fn test_stalled_llm_tier_still_learns_from_templates() {
        let engine = Arc::new(HybridSearchEngine::new(
            Arc::new(InMemoryKnowledgeStore::new()),
            None,
            Arc::new(CacheLayer::local(&CacheConfig::default())),
            SearchConfig::default(),
        ));
        let tiered = TieredContentGenerator::new(Some(Arc::new(Picky)), Arc::new(TemplateContentGenerator))
            .with_primary_timeout(Duration::from_millis(50));
        let config = LearningConfig {
            generation_timeout_secs: 0.5,
            inter_goal_delay_secs: 0.0,
            ..Default::default()
        };
        let executor = LearningExecutor::new(engine.clone(), Arc::new(tiered), &config);

        // "slow" hangs in the primary tier well past the goal timeout
        let summary = executor.execute(vec![goal("slow")], &CancellationToken::new()).await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.goals[0].status, GoalStatus::Completed);

        let entry = engine.get_knowledge(summary.learned_ids[0]).await.unwrap();
        assert_eq!(entry.content, TemplateContentGenerator::render(&LearningGap::new("bank_info", "slow")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_goals_pending() {
        let (executor, engine) = executor();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = executor.execute(vec![goal("Acme"), goal("Borealis")], &cancel).await;
        assert!(summary.interrupted);
        assert_eq!(summary.attempted, 0);
        assert!(summary.goals.iter().all(|g| g.status == GoalStatus::Pending));
        assert_eq!(engine.stats().await.unwrap().total_entries, 0);
    }
}
