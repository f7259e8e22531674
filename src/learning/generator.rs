//! Content generation for learning goals
//!
//! Two tiers: an LLM behind an OpenAI-compatible chat API, and fixed
//! templates per taxonomy category that always produce something.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::taxonomy::LearningGap;
use crate::config::GeneratorConfig;
use crate::error::{KnowledgeError, Result};

/// Produces knowledge text for a gap
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Generator name for logs
    fn name(&self) -> &str;

    async fn generate(&self, gap: &LearningGap) -> Result<String>;
}

/// Template family used for a gap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Bank,
    Product,
    Topic,
    Question,
}

impl ContentKind {
    pub fn for_category(category: &str) -> Self {
        match category {
            "bank_info" => ContentKind::Bank,
            "product_info" => ContentKind::Product,
            "user_feedback" => ContentKind::Question,
            _ => ContentKind::Topic,
        }
    }
}

/// Title stored with generated knowledge
pub fn title_for(gap: &LearningGap) -> String {
    match ContentKind::for_category(&gap.category) {
        ContentKind::Bank => format!("{} personal lending overview", gap.item),
        ContentKind::Product => format!("{} product guide", gap.item),
        ContentKind::Topic => format!("{} explained", gap.item),
        ContentKind::Question => format!("Answer: {}", gap.item),
    }
}

fn prompt_for(gap: &LearningGap) -> String {
    match ContentKind::for_category(&gap.category) {
        ContentKind::Bank => format!(
            "Write a concise, factual overview of the personal lending products offered by {}: \
             loan types, typical rate ranges, terms, eligibility and how to apply.",
            gap.item
        ),
        ContentKind::Product => format!(
            "Explain the loan product '{}': what it is, typical features, eligibility, \
             the application process and points to watch out for.",
            gap.item
        ),
        ContentKind::Topic => format!(
            "Explain the lending topic '{}' for a consumer: definition, the rules that \
             apply, practical examples and common pitfalls.",
            gap.item
        ),
        ContentKind::Question => format!(
            "Answer this frequently asked borrower question clearly and practically: {}",
            gap.item
        ),
    }
}

const SYSTEM_PROMPT: &str = "You write reference entries for a consumer lending knowledge base. \
Be accurate and neutral, and say when figures vary by lender.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Generator backed by an OpenAI-compatible chat completion endpoint
pub struct LlmContentGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl LlmContentGenerator {
    pub fn new(config: &GeneratorConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| KnowledgeError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// Build from config, reading the key from the configured env var
    pub fn from_env(config: &GeneratorConfig) -> Result<Option<Self>> {
        match std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()) {
            Some(api_key) => Self::new(config, api_key).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ContentGenerator for LlmContentGenerator {
    fn name(&self) -> &str {
        "llm"
    }

    async fn generate(&self, gap: &LearningGap) -> Result<String> {
        let prompt = prompt_for(gap);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: SYSTEM_PROMPT },
                ChatMessage { role: "user", content: &prompt },
            ],
            max_tokens: self.max_tokens,
        };

        let response = self.client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "Knowledge Engine")
            .json(&request)
            .send()
            .await
            .map_err(|e| KnowledgeError::ContentGeneration(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(KnowledgeError::ContentGeneration(format!("API error ({}): {}", status, body)));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| KnowledgeError::ContentGeneration(format!("unreadable response: {}", e)))?;

        // Content may be a plain string or an array of typed parts
        let content = match raw
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
        {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Array(parts)) => parts
                .iter()
                .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };

        debug!("LLM produced {} chars for {}", content.len(), gap);
        Ok(content)
    }
}

/// Fixed-template generator; never fails
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateContentGenerator;

impl TemplateContentGenerator {
    pub fn render(gap: &LearningGap) -> String {
        let item = &gap.item;
        match ContentKind::for_category(&gap.category) {
            ContentKind::Bank => format!(
                "{item} personal lending overview\n\n\
                 {item} is a financial institution offering personal banking services, \
                 including personal loans, credit cards and wealth management.\n\n\
                 Main personal credit products:\n\
                 1. {item} personal credit loan: amount set by applicant profile, \
                 annual rate roughly 4.5%-15.6%, terms of 12-60 months, unsecured with fast approval.\n\
                 2. {item} credit cards: several card tiers, annual rate roughly 12.99%-24.99%, \
                 reward points and promotions.\n\n\
                 Eligibility: aged 18-65, stable income, good credit record, identity accepted by the bank.\n\n\
                 How to apply: online, mobile app, branch, or customer service hotline."
            ),
            ContentKind::Product => format!(
                "{item} product guide\n\n\
                 {item} is a lending product that covers customers' funding needs.\n\n\
                 Features: simple application, fast approval, flexible use, convenient repayment.\n\n\
                 Eligibility: aged 18-65, stable income, good credit record, meets lender rules.\n\n\
                 Process: prepare documents, submit the application, lender review, decision, \
                 sign the contract, funds disbursed.\n\n\
                 Notes: provide accurate information, repay on time, read the terms, \
                 and check current details with the lender."
            ),
            ContentKind::Topic => format!(
                "{item} explained\n\n\
                 {item} is an important concept for understanding lending products and services.\n\n\
                 Covers: definition, applicable rules, practical scenarios, things to watch.\n\n\
                 Common questions: what is {item}? how does {item} work? when does {item} matter?\n\n\
                 Tip: confirm current rules with a lender or a qualified adviser."
            ),
            ContentKind::Question => format!(
                "Answer: {item}\n\n\
                 This is a question borrowers ask often.\n\n\
                 Answer outline: the basic concept, the relevant rules and requirements, \
                 the practical steps, and what to watch out for.\n\n\
                 Common mistakes: unclear understanding of terms, overlooked details, \
                 skipped steps.\n\n\
                 Advice: read the lender's rules carefully, prepare documents early, \
                 and ask customer service when in doubt."
            ),
        }
    }
}

#[async_trait]
impl ContentGenerator for TemplateContentGenerator {
    fn name(&self) -> &str {
        "template"
    }

    async fn generate(&self, gap: &LearningGap) -> Result<String> {
        Ok(Self::render(gap))
    }
}

/// Primary generator with a fallback for errors, empty output and timeouts
///
/// The primary tier runs under its own budget, which must stay below the
/// executor's per-goal timeout for the fallback to get a chance.
pub struct TieredContentGenerator {
    primary: Option<Arc<dyn ContentGenerator>>,
    fallback: Arc<dyn ContentGenerator>,
    primary_timeout: Duration,
}

impl TieredContentGenerator {
    pub fn new(primary: Option<Arc<dyn ContentGenerator>>, fallback: Arc<dyn ContentGenerator>) -> Self {
        Self {
            primary,
            fallback,
            primary_timeout: GeneratorConfig::default().timeout(),
        }
    }

    pub fn with_primary_timeout(mut self, timeout: Duration) -> Self {
        self.primary_timeout = timeout;
        self
    }

    /// LLM tier when enabled and a key is available, templates otherwise
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let primary = if config.enabled {
            let llm = LlmContentGenerator::from_env(config)?;
            if llm.is_none() {
                warn!("{} not set, learning will use template content only", config.api_key_env);
            }
            llm.map(|g| Arc::new(g) as Arc<dyn ContentGenerator>)
        } else {
            None
        };

        Ok(Self::new(primary, Arc::new(TemplateContentGenerator)).with_primary_timeout(config.timeout()))
    }
}

#[async_trait]
impl ContentGenerator for TieredContentGenerator {
    fn name(&self) -> &str {
        "tiered"
    }

    async fn generate(&self, gap: &LearningGap) -> Result<String> {
        if let Some(primary) = &self.primary {
            match tokio::time::timeout(self.primary_timeout, primary.generate(gap)).await {
                Ok(Ok(text)) if !text.trim().is_empty() => return Ok(text),
                Ok(Ok(_)) => warn!("{} returned no content for {}, using {}", primary.name(), gap, self.fallback.name()),
                Ok(Err(e)) => warn!("{} failed for {}: {}, using {}", primary.name(), gap, e, self.fallback.name()),
                Err(_) => warn!(
                    "{} timed out after {:.1}s for {}, using {}",
                    primary.name(),
                    self.primary_timeout.as_secs_f64(),
                    gap,
                    self.fallback.name()
                ),
            }
        }
        self.fallback.generate(gap).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Result<String>);

    #[async_trait]
    impl ContentGenerator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _gap: &LearningGap) -> Result<String> {
            match &self.0 {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(KnowledgeError::ContentGeneration(e.to_string())),
            }
        }
    }

    #[test]
    fn test_templates_mention_item() {
        for category in ["bank_info", "product_info", "general_knowledge", "user_feedback", "other"] {
            let gap = LearningGap::new(category, "Acme Savings");
            let text = TemplateContentGenerator::render(&gap);
            assert!(text.contains("Acme Savings"), "{} template lacks item", category);
            assert!(title_for(&gap).contains("Acme Savings"));
        }
    }

    #[tokio::test]
    async fn test_tiered_prefers_primary() {
        let tiered = TieredContentGenerator::new(
            Some(Arc::new(Scripted(Ok("from llm".into())))),
            Arc::new(TemplateContentGenerator),
        );
        let text = tiered.generate(&LearningGap::new("bank_info", "Acme")).await.unwrap();
        assert_eq!(text, "from llm");
    }

    #[tokio::test]
    async fn test_tiered_falls_back_on_error_and_empty() {
        let gap = LearningGap::new("product_info", "car loan");

        let failing = TieredContentGenerator::new(
            Some(Arc::new(Scripted(Err(KnowledgeError::ContentGeneration("503".into()))))),
            Arc::new(TemplateContentGenerator),
        );
        assert!(failing.generate(&gap).await.unwrap().starts_with("car loan product guide"));

        let empty = TieredContentGenerator::new(
            Some(Arc::new(Scripted(Ok("  ".into())))),
            Arc::new(TemplateContentGenerator),
        );
        assert!(empty.generate(&gap).await.unwrap().contains("car loan"));
    }

    struct Stalled;

    #[async_trait]
    impl ContentGenerator for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn generate(&self, _gap: &LearningGap) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".into())
        }
    }

    #[tokio::test]
    async fn test_tiered_falls_back_when_primary_stalls() {
        let tiered = TieredContentGenerator::new(Some(Arc::new(Stalled)), Arc::new(TemplateContentGenerator))
            .with_primary_timeout(Duration::from_millis(20));
        let gap = LearningGap::new("bank_info", "Acme Savings");

        let text = tokio::time::timeout(Duration::from_secs(5), tiered.generate(&gap))
            .await
            .expect("fallback did not run")
            .unwrap();
        assert_eq!(text, TemplateContentGenerator::render(&gap));
    }

    #[test]
    fn test_disabled_config_has_no_primary() {
        let config = GeneratorConfig {
            enabled: false,
            timeout_secs: 7.0,
            ..Default::default()
        };
        let tiered = TieredContentGenerator::from_config(&config).unwrap();
        assert!(tiered.primary.is_none());
        assert_eq!(tiered.primary_timeout, Duration::from_secs(7));
    }
}
