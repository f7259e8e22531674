//! Configuration management
//!
//! Manages engine configuration: store location, embeddings, cache, search
//! tuning, and the learning controller's cadence and stop thresholds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::KnowledgeError;
use crate::learning::taxonomy::Taxonomy;
use crate::memory::embeddings::EmbeddingConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Persistent knowledge store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Embedding backend settings
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Search result cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Hybrid search tuning
    #[serde(default)]
    pub search: SearchConfig,
    /// Learning controller settings
    #[serde(default)]
    pub learning: LearningConfig,
    /// Content generator settings
    #[serde(default)]
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file; defaults to the data directory
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Keep knowledge in process memory only (nothing persisted)
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            in_memory: false,
        }
    }
}

impl StoreConfig {
    /// Resolve the database path, falling back to the data directory
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("knowledge.db")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Namespace prepended to every cache key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Time-to-live for cached search results (seconds)
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Maximum entries held by the in-process fallback
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,
    /// Shared Redis cache, e.g. `redis://127.0.0.1:6379/0`; local only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// How long to wait for the shared cache at startup (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
}

fn default_key_prefix() -> String {
    "kb:".to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_local_max_entries() -> usize {
    1000
}

fn default_connect_timeout_secs() -> f64 {
    2.0
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_ttl_secs: default_ttl_secs(),
            local_max_entries: default_local_max_entries(),
            url: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Weight of vector similarity in hybrid scoring
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Minimum similarity for vector-mode (precision) queries
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Minimum similarity for vector candidates in hybrid (best-effort) queries
    #[serde(default = "default_best_effort_threshold")]
    pub best_effort_threshold: f32,
    /// Results returned when the caller does not say
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
    /// Nearest-neighbour candidates fetched per requested result in hybrid mode
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

fn default_alpha() -> f32 {
    0.7
}

fn default_similarity_threshold() -> f32 {
    0.7
}

fn default_best_effort_threshold() -> f32 {
    0.1
}

fn default_max_results() -> usize {
    5
}

fn default_candidate_multiplier() -> usize {
    4
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            similarity_threshold: default_similarity_threshold(),
            best_effort_threshold: default_best_effort_threshold(),
            default_max_results: default_max_results(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

/// Learning controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Mean hybrid score below which a taxonomy item counts as a gap
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold: f32,
    /// Results inspected per taxonomy item
    #[serde(default = "default_results_per_item")]
    pub results_per_item: usize,
    /// Goals executed per cycle
    #[serde(default = "default_max_learning_per_cycle")]
    pub max_learning_per_cycle: usize,
    /// Base priority weight per taxonomy category
    #[serde(default = "default_category_weights")]
    pub category_weights: BTreeMap<String, f64>,
    /// Weight for categories missing from `category_weights`
    #[serde(default = "default_unknown_category_weight")]
    pub unknown_category_weight: f64,
    /// Lower bound of the priority jitter factor
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,
    /// Upper bound of the priority jitter factor
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
    /// Timeout for a single content generation call (seconds)
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: f64,
    /// Pause between consecutive goals (seconds)
    #[serde(default = "default_inter_goal_delay_secs")]
    pub inter_goal_delay_secs: f64,
    /// Cycle interval while cycle_count <= 10 (seconds)
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: f64,
    /// Cycle interval once cycle_count > 20 (seconds)
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: f64,
    /// Stop-condition monitor tick (seconds)
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: f64,
    /// Wait after a failed cycle before trying again (seconds)
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: f64,
    /// Store size treated as full coverage
    #[serde(default = "default_expected_max_entries")]
    pub expected_max_entries: usize,
    /// Cycle records kept in history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Stop thresholds
    #[serde(default)]
    pub stop: StopConfig,
    /// Items whose coverage the gap detector measures
    #[serde(default)]
    pub taxonomy: Taxonomy,
}

fn default_gap_threshold() -> f32 {
    0.4
}

fn default_results_per_item() -> usize {
    3
}

fn default_max_learning_per_cycle() -> usize {
    5
}

pub fn default_category_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("bank_info".to_string(), 0.4),
        ("product_info".to_string(), 0.3),
        ("general_knowledge".to_string(), 0.2),
        ("user_feedback".to_string(), 0.1),
    ])
}

fn default_unknown_category_weight() -> f64 {
    0.1
}

fn default_jitter_min() -> f64 {
    0.8
}

fn default_jitter_max() -> f64 {
    1.2
}

fn default_generation_timeout_secs() -> f64 {
    30.0
}

fn default_inter_goal_delay_secs() -> f64 {
    5.0
}

fn default_base_interval_secs() -> f64 {
    3600.0
}

fn default_min_interval_secs() -> f64 {
    7200.0
}

fn default_monitor_interval_secs() -> f64 {
    300.0
}

fn default_error_backoff_secs() -> f64 {
    60.0
}

fn default_expected_max_entries() -> usize {
    1000
}

fn default_history_capacity() -> usize {
    50
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            gap_threshold: default_gap_threshold(),
            results_per_item: default_results_per_item(),
            max_learning_per_cycle: default_max_learning_per_cycle(),
            category_weights: default_category_weights(),
            unknown_category_weight: default_unknown_category_weight(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
            generation_timeout_secs: default_generation_timeout_secs(),
            inter_goal_delay_secs: default_inter_goal_delay_secs(),
            base_interval_secs: default_base_interval_secs(),
            min_interval_secs: default_min_interval_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            expected_max_entries: default_expected_max_entries(),
            history_capacity: default_history_capacity(),
            stop: StopConfig::default(),
            taxonomy: Taxonomy::default(),
        }
    }
}

impl LearningConfig {
    pub fn generation_timeout(&self) -> Duration {
        secs(self.generation_timeout_secs)
    }

    pub fn inter_goal_delay(&self) -> Duration {
        secs(self.inter_goal_delay_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        secs(self.monitor_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        secs(self.error_backoff_secs)
    }

    /// Interval before the next cycle, stretched as cycles accumulate
    pub fn cycle_interval(&self, cycle_count: u64) -> Duration {
        if cycle_count > 20 {
            secs(self.min_interval_secs)
        } else if cycle_count > 10 {
            secs(self.base_interval_secs * 1.5)
        } else {
            secs(self.base_interval_secs)
        }
    }
}

/// Longest interval any setting may ask for (one year)
const MAX_INTERVAL_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value.min(MAX_INTERVAL_SECS)).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

/// Thresholds that end an unattended learning run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConfig {
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u64,
    #[serde(default = "default_max_hours")]
    pub max_hours: f64,
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
    #[serde(default = "default_max_gap_ratio")]
    pub max_gap_ratio: f64,
    #[serde(default = "default_max_stagnation")]
    pub max_stagnation: u32,
}

fn default_max_cycles() -> u64 {
    100
}

fn default_max_hours() -> f64 {
    24.0
}

fn default_min_coverage() -> f64 {
    0.8
}

fn default_min_quality() -> f64 {
    0.85
}

fn default_max_gap_ratio() -> f64 {
    0.1
}

fn default_max_stagnation() -> u32 {
    5
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            max_hours: default_max_hours(),
            min_coverage: default_min_coverage(),
            min_quality: default_min_quality(),
            max_gap_ratio: default_max_gap_ratio(),
            max_stagnation: default_max_stagnation(),
        }
    }
}

/// LLM content generator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Use the LLM tier at all (template fallback is always available)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// OpenAI-compatible API base URL
    #[serde(default = "default_generator_base_url")]
    pub base_url: String,
    /// Model used to write new knowledge
    #[serde(default = "default_generator_model")]
    pub model: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Budget for one LLM call before falling back to templates (seconds)
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: f64,
}

fn default_true() -> bool {
    true
}

fn default_generator_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_generator_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    1200
}

fn default_generator_timeout_secs() -> f64 {
    20.0
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            base_url: default_generator_base_url(),
            model: default_generator_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_generator_timeout_secs(),
        }
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from the default location, writing defaults on first use
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    /// Save configuration to an explicit file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Reject settings that would make scoring or planning meaningless
    pub fn validate(&self) -> crate::error::Result<()> {
        let unit = |name: &str, value: f64| -> crate::error::Result<()> {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(KnowledgeError::Configuration(format!(
                    "{} must be within [0, 1], got {}", name, value
                )));
            }
            Ok(())
        };

        unit("search.alpha", self.search.alpha as f64)?;
        unit("search.similarity_threshold", self.search.similarity_threshold as f64)?;
        unit("search.best_effort_threshold", self.search.best_effort_threshold as f64)?;
        unit("learning.gap_threshold", self.learning.gap_threshold as f64)?;
        unit("learning.stop.min_coverage", self.learning.stop.min_coverage)?;
        unit("learning.stop.min_quality", self.learning.stop.min_quality)?;
        unit("learning.stop.max_gap_ratio", self.learning.stop.max_gap_ratio)?;

        let learning = &self.learning;
        for (name, value) in [
            ("learning.generation_timeout_secs", learning.generation_timeout_secs),
            ("learning.inter_goal_delay_secs", learning.inter_goal_delay_secs),
            ("learning.base_interval_secs", learning.base_interval_secs),
            ("learning.min_interval_secs", learning.min_interval_secs),
            ("learning.monitor_interval_secs", learning.monitor_interval_secs),
            ("learning.error_backoff_secs", learning.error_backoff_secs),
            ("generator.timeout_secs", self.generator.timeout_secs),
            ("cache.connect_timeout_secs", self.cache.connect_timeout_secs),
        ] {
            if !value.is_finite() || !(0.0..=MAX_INTERVAL_SECS).contains(&value) {
                return Err(KnowledgeError::Configuration(format!(
                    "{} must be between 0 and {} seconds, got {}", name, MAX_INTERVAL_SECS, value
                )));
            }
        }
        if self.generator.timeout_secs >= learning.generation_timeout_secs {
            return Err(KnowledgeError::Configuration(format!(
                "generator.timeout_secs ({}) must be below learning.generation_timeout_secs ({}) \
                 so the template fallback still has time to run",
                self.generator.timeout_secs, learning.generation_timeout_secs
            )));
        }

        let mut total = 0.0;
        for (category, weight) in &self.learning.category_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(KnowledgeError::Configuration(format!(
                    "weight for '{}' must be a non-negative number, got {}", category, weight
                )));
            }
            total += weight;
        }
        if total <= 0.0 || total > 1.0 + 1e-6 {
            return Err(KnowledgeError::Configuration(format!(
                "category weights must sum to a value in (0, 1], got {:.3}", total
            )));
        }
        unit("learning.unknown_category_weight", self.learning.unknown_category_weight)?;

        let (lo, hi) = (self.learning.jitter_min, self.learning.jitter_max);
        if !(lo > 0.0 && lo <= hi && hi.is_finite()) {
            return Err(KnowledgeError::Configuration(format!(
                "jitter range [{}, {}] is empty or non-positive", lo, hi
            )));
        }

        if self.learning.max_learning_per_cycle == 0 {
            return Err(KnowledgeError::Configuration(
                "learning.max_learning_per_cycle must be at least 1".to_string(),
            ));
        }
        if self.learning.history_capacity == 0 {
            return Err(KnowledgeError::Configuration(
                "learning.history_capacity must be at least 1".to_string(),
            ));
        }
        if self.learning.expected_max_entries == 0 {
            return Err(KnowledgeError::Configuration(
                "learning.expected_max_entries must be at least 1".to_string(),
            ));
        }
        if self.learning.taxonomy.is_empty() {
            return Err(KnowledgeError::Configuration(
                "learning.taxonomy must name at least one item".to_string(),
            ));
        }
        if self.cache.local_max_entries == 0 {
            return Err(KnowledgeError::Configuration(
                "cache.local_max_entries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "knowledge-engine", "knowledge-engine")
        .context("Failed to get project directories")
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
