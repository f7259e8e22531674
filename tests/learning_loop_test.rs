//! End-to-end runs of the learning controller over an in-memory store

use async_trait::async_trait;
use knowledge_engine::config::{CacheConfig, LearningConfig, SearchConfig, StopConfig};
use knowledge_engine::learning::{
    ContentGenerator, ControllerPhase, LearningController, LearningGap, StopReason, Taxonomy,
    LEARNING_SOURCE,
};
use knowledge_engine::memory::{CacheLayer, HybridSearchEngine, InMemoryKnowledgeStore, Metadata};
use knowledge_engine::{KnowledgeError, Result, SearchMode, SearchRequest};
use std::sync::Arc;
use std::time::Duration;

/// Writes one short sentence naming the item
struct EchoGenerator;

#[async_trait]
impl ContentGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, gap: &LearningGap) -> Result<String> {
        Ok(format!("Notes on {}.", gap.item))
    }
}

/// Never produces anything
struct MuteGenerator;

#[async_trait]
impl ContentGenerator for MuteGenerator {
    fn name(&self) -> &str {
        "mute"
    }

    async fn generate(&self, _gap: &LearningGap) -> Result<String> {
        Err(KnowledgeError::ContentGeneration("model offline".into()))
    }
}

fn engine() -> Arc<HybridSearchEngine> {
    Arc::new(HybridSearchEngine::new(
        Arc::new(InMemoryKnowledgeStore::new()),
        None,
        Arc::new(CacheLayer::local(&CacheConfig::default())),
        SearchConfig::default(),
    ))
}

fn fast_config(keys: &[&str]) -> LearningConfig {
    LearningConfig {
        taxonomy: Taxonomy::from_keys(keys.iter().copied()).unwrap(),
        inter_goal_delay_secs: 0.0,
        base_interval_secs: 0.01,
        min_interval_secs: 0.01,
        monitor_interval_secs: 0.01,
        error_backoff_secs: 0.01,
        ..Default::default()
    }
}

async fn run_to_stop(controller: &LearningController) {
    controller.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), controller.wait_stopped())
        .await
        .expect("controller did not stop in time");
}

#[tokio::test]
async fn test_two_banks_learned_one_per_cycle() {
    let engine = engine();
    let config = LearningConfig {
        max_learning_per_cycle: 1,
        ..fast_config(&["bank_info:Acme Savings", "bank_info:Borealis Trust"])
    };
    let controller = LearningController::new(engine.clone(), Arc::new(EchoGenerator), config);

    let first = controller.run_cycle().await.unwrap();
    assert_eq!(first.gap_ratio, 1.0);
    assert_eq!(first.goals_succeeded, 1);

    let second = controller.run_cycle().await.unwrap();
    assert_eq!(second.gap_ratio, 0.5);
    assert_eq!(second.goals_succeeded, 1);

    let third = controller.run_cycle().await.unwrap();
    assert_eq!(third.gap_ratio, 0.0);
    assert_eq!(third.goals_attempted, 0);

    assert_eq!(
        controller.check_stop_conditions().await.unwrap(),
        Some(StopReason::GapRatio { ratio: 0.0 })
    );

    let results = engine
        .search(&SearchRequest::new("Borealis Trust").mode(SearchMode::Lexical))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let entry = engine.get_knowledge(results[0].knowledge_id).await.unwrap();
    assert_eq!(entry.category, "bank_info");
    assert_eq!(entry.content, "Notes on Borealis Trust.");
    assert_eq!(entry.metadata["learning_source"], LEARNING_SOURCE);
    assert_eq!(entry.metadata["target"], "bank_info:Borealis Trust");
}

#[tokio::test]
async fn test_stops_at_cycle_limit_when_nothing_is_learned() {
    let config = LearningConfig {
        stop: StopConfig {
            max_cycles: 3,
            max_stagnation: 100,
            ..Default::default()
        },
        ..fast_config(&["bank_info:Acme Savings"])
    };
    let controller = LearningController::new(engine(), Arc::new(MuteGenerator), config);

    run_to_stop(&controller).await;

    assert_eq!(controller.stop_reason(), Some(StopReason::MaxCycles { cycles: 3 }));
    let status = controller.status().await.unwrap();
    assert_eq!(status.phase, ControllerPhase::Stopped);
    assert_eq!(status.cycle_count, 3);
    assert_eq!(status.total_learned_items, 0);
    assert_eq!(status.gap_ratio, Some(1.0));
    assert!(status.recent_history.iter().all(|r| r.goals_succeeded == 0));
}

#[tokio::test]
async fn test_stagnation_stops_a_failing_run() {
    let config = LearningConfig {
        stop: StopConfig {
            max_stagnation: 2,
            ..Default::default()
        },
        ..fast_config(&["bank_info:Acme Savings"])
    };
    let controller = LearningController::new(engine(), Arc::new(MuteGenerator), config);

    run_to_stop(&controller).await;

    assert_eq!(controller.stop_reason(), Some(StopReason::Stagnation { cycles: 2 }));
    assert_eq!(controller.status().await.unwrap().cycle_count, 2);
}

#[tokio::test]
async fn test_monitor_stops_on_coverage_while_loop_waits() {
    let engine = engine();
    let config = LearningConfig {
        expected_max_entries: 5,
        base_interval_secs: 3600.0,
        min_interval_secs: 3600.0,
        ..fast_config(&["bank_info:Acme Savings"])
    };
    let controller = LearningController::new(engine.clone(), Arc::new(MuteGenerator), config);
    controller.start().await.unwrap();

    // The loop has finished cycle 1 and its own stop check once the next
    // cycle is scheduled; from here only the monitor is awake
    tokio::time::timeout(Duration::from_secs(10), async {
        while controller.status().await.unwrap().next_cycle_at.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first cycle did not finish");
    assert!(!controller.should_stop());

    for i in 0..5 {
        engine
            .add_knowledge("general_knowledge", &format!("Note {}", i), "Seeded entry", Metadata::new())
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), controller.wait_stopped())
        .await
        .expect("monitor did not stop the controller");

    assert_eq!(controller.stop_reason(), Some(StopReason::Coverage { score: 1.0 }));
    let status = controller.status().await.unwrap();
    assert_eq!(status.cycle_count, 1);
    assert!(!status.is_running);
    assert_eq!(status.coverage_score, 1.0);
}

#[tokio::test]
async fn test_manual_stop_ends_a_long_wait() {
    let config = LearningConfig {
        base_interval_secs: 3600.0,
        min_interval_secs: 3600.0,
        monitor_interval_secs: 3600.0,
        ..fast_config(&["bank_info:Acme Savings", "bank_info:Borealis Trust"])
    };
    let controller = LearningController::new(engine(), Arc::new(MuteGenerator), config);
    controller.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.stop();
    tokio::time::timeout(Duration::from_secs(5), controller.wait_stopped())
        .await
        .expect("stop did not interrupt the wait");

    assert_eq!(controller.stop_reason(), Some(StopReason::Manual));
    assert_eq!(controller.status().await.unwrap().phase, ControllerPhase::Stopped);
}
