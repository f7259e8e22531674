//! Knowledge Engine - hybrid knowledge retrieval with autonomous learning
//!
//! - Hybrid vector + lexical search over a persistent knowledge store
//! - Two-tier result cache (shared backend with a local LRU fallback)
//! - Gap detection against a domain taxonomy
//! - A learning controller that plans, generates and ingests new knowledge
//!   until one of its stop conditions fires
//!
//! # Example
//!
//! ```ignore
//! use knowledge_engine::{Config, EngineContext, SearchRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = EngineContext::build(Config::load()?).await?;
//!     let results = ctx.engine.search(&SearchRequest::new("fixed deposit rates")).await?;
//!     println!("{:?}", results);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod config;
pub mod memory;
pub mod learning;
pub mod context;
pub mod cli;

pub use error::{KnowledgeError, Result};
pub use config::Config;
pub use context::EngineContext;

pub use memory::{
    CacheLayer,
    HybridSearchEngine,
    KnowledgeEntry,
    KnowledgeStore,
    SearchMode,
    SearchRequest,
    SearchResult,
};

pub use learning::{
    ControllerStatus,
    LearningController,
    StopReason,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
