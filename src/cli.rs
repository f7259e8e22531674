//! CLI interface for knowledge-engine

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::context::EngineContext;
use crate::learning::{GapDetector, LearningCycleRecord};
use crate::memory::{Metadata, SearchMode, SearchRequest};

#[derive(Parser)]
#[command(name = "knowledge-engine")]
#[command(about = "Hybrid knowledge search with an autonomous learning loop", long_about = None)]
#[command(version)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true, env = "KNOWLEDGE_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a knowledge entry
    Add {
        /// Entry content
        content: String,
        /// Category used for filtered search
        #[arg(short, long, default_value = "general_knowledge")]
        category: String,
        /// Entry title
        #[arg(short, long, default_value = "")]
        title: String,
        /// Metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,
    },
    /// Show a knowledge entry
    Get {
        id: i64,
    },
    /// Delete a knowledge entry
    Delete {
        id: i64,
    },
    /// Search the knowledge base
    Search {
        /// Search query
        query: String,
        /// Restrict to one category
        #[arg(short, long)]
        category: Option<String>,
        /// Maximum results to return
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// vector, lexical or hybrid
        #[arg(short, long, default_value = "hybrid")]
        mode: String,
    },
    /// Show knowledge base and cache statistics
    Stats,
    /// Run one gap detection pass and list the gaps
    Gaps,
    /// Run the autonomous learning loop
    Learn {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Show or reset configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Overwrite the config file with defaults
    Reset,
    /// Print the config file location
    Path,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Config { command } => run_config(command, config_path)?,
        Commands::Add { content, category, title, metadata } => {
            let ctx = engine(config_path).await?;
            let metadata: Metadata = match metadata {
                Some(json) => serde_json::from_str(&json).context("Metadata must be a JSON object")?,
                None => Metadata::new(),
            };
            let id = ctx.engine.add_knowledge(&category, &title, &content, metadata).await?;
            println!("✓ Knowledge added with ID: {}", id);
        }
        Commands::Get { id } => {
            show_entry(&engine(config_path).await?, id).await?;
        }
        Commands::Delete { id } => {
            engine(config_path).await?.engine.delete_knowledge(id).await?;
            println!("✓ Deleted knowledge entry {}", id);
        }
        Commands::Search { query, category, limit, mode } => {
            let ctx = engine(config_path).await?;
            let mode: SearchMode = mode.parse()?;
            let mut request = SearchRequest::new(&query)
                .max_results(limit.unwrap_or(ctx.config.search.default_max_results))
                .mode(mode);
            if let Some(category) = category {
                request = request.category(category);
            }
            search(&ctx, &request).await?;
        }
        Commands::Stats => {
            show_stats(&engine(config_path).await?).await?;
        }
        Commands::Gaps => {
            detect_gaps(&engine(config_path).await?).await?;
        }
        Commands::Learn { once } => {
            learn(&engine(config_path).await?, once).await?;
        }
    }

    Ok(())
}

async fn engine(config_path: Option<&Path>) -> Result<EngineContext> {
    let config = load_config(config_path)?;
    EngineContext::build(config).await.context("Failed to initialize engine")
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_config(command: ConfigCommands, path: Option<&Path>) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = load_config(path)?;
            println!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        }
        ConfigCommands::Reset => {
            let path = match path {
                Some(path) => path.to_path_buf(),
                None => config::config_path()?,
            };
            Config::default().save_to(&path)?;
            println!("✓ Configuration reset: {}", path.display());
        }
        ConfigCommands::Path => {
            println!("{}", config::config_path()?.display());
        }
    }
    Ok(())
}

/// Show a single entry
async fn show_entry(ctx: &EngineContext, id: i64) -> Result<()> {
    let entry = ctx.engine.get_knowledge(id).await?;
    println!("[{}] {} ({})", entry.id, entry.title, entry.category);
    println!("  Created: {}", entry.created_at.format("%Y-%m-%d %H:%M"));
    println!("  Updated: {}", entry.updated_at.format("%Y-%m-%d %H:%M"));
    println!("  Embedding: {}", entry.embedding.as_ref().map_or("none".to_string(), |v| format!("{} dims", v.len())));
    if !entry.metadata.is_empty() {
        println!("  Metadata: {}", serde_json::Value::Object(entry.metadata.clone()));
    }
    println!();
    println!("{}", entry.content);
    Ok(())
}

/// Show knowledge base and cache statistics
async fn show_stats(ctx: &EngineContext) -> Result<()> {
    let stats = ctx.engine.stats().await?;
    let cache = ctx.cache.stats().await;

    println!("\nKnowledge Base Statistics");
    println!("=======================================");
    println!("  Total entries:     {}", stats.total_entries);
    println!("  With embeddings:   {}", stats.embedded_entries);
    for (category, count) in &stats.by_category {
        println!("    {:<24} {}", category, count);
    }
    println!("\nCache ({})", cache.backend);
    println!("  Hits / misses:     {} / {}", cache.hits, cache.misses);
    if let Some(entries) = cache.entries {
        println!("  Entries:           {}", entries);
    }
    match &ctx.embedder {
        Some(embedder) => println!("\nEmbeddings: {} ({} dims)", embedder.name(), embedder.dimension()),
        None => println!("\nEmbeddings: disabled (lexical search only)"),
    }
    Ok(())
}

/// One detection pass over the configured taxonomy
async fn detect_gaps(ctx: &EngineContext) -> Result<()> {
    let learning = &ctx.config.learning;
    let detector = GapDetector::new(ctx.engine.clone(), learning.taxonomy.clone(), learning.gap_threshold)
        .with_results_per_item(learning.results_per_item);
    let report = detector.detect().await?;

    println!("{} of {} taxonomy keys are gaps (ratio {:.2})",
        report.gaps.len(), report.total_keys, report.gap_ratio());
    for key in report.gap_keys() {
        println!("  - {}", key);
    }
    Ok(())
}

/// Run the learning controller until it stops or the user interrupts
async fn learn(ctx: &EngineContext, once: bool) -> Result<()> {
    let controller = ctx.controller();
    if once {
        let record = controller.run_cycle().await?;
        print_cycle(&record);
    } else {
        controller.start().await?;
        println!("Learning started. Press Ctrl-C to stop.");

        tokio::select! {
            _ = controller.wait_stopped() => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping after the current goal...");
                controller.stop();
                controller.wait_stopped().await;
            }
        }
    }

    let status = controller.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn search(ctx: &EngineContext, request: &SearchRequest) -> Result<()> {
    let results = ctx.engine.search(request).await?;
    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s):\n", results.len());
    for (i, result) in results.iter().enumerate() {
        // Results only carry ids; entries may have been deleted since caching
        match ctx.store.get(result.knowledge_id).await? {
            Some(entry) => {
                let preview: String = entry.content.chars().take(80).collect();
                println!("{}. [{:.2}] {} ({}, id {})", i + 1, result.score, entry.title, entry.category, entry.id);
                println!("   \"{}\"", preview.replace('\n', " "));
            }
            None => println!("{}. [{:.2}] id {} (deleted)", i + 1, result.score, result.knowledge_id),
        }
    }
    Ok(())
}

fn print_cycle(record: &LearningCycleRecord) {
    println!("Cycle {}: learned {}/{} goals", record.cycle, record.goals_succeeded, record.goals_attempted);
    println!("  Gap ratio: {:.2}  Coverage: {:.3}  Quality: {:.2}",
        record.gap_ratio, record.coverage_score, record.quality_score);
}
