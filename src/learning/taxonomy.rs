//! Domain taxonomy the learning loop measures coverage against

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::KnowledgeError;

/// Category -> item keys. The key set is configuration, not code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Taxonomy(BTreeMap<String, Vec<String>>);

impl Taxonomy {
    pub fn new(categories: BTreeMap<String, Vec<String>>) -> Self {
        Self(categories)
    }

    /// Build from `"category:item"` keys
    pub fn from_keys<I, S>(keys: I) -> Result<Self, KnowledgeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut categories: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in keys {
            let gap: LearningGap = key.as_ref().parse()?;
            let items = categories.entry(gap.category).or_default();
            if !items.contains(&gap.item) {
                items.push(gap.item);
            }
        }
        Ok(Self(categories))
    }

    pub fn categories(&self) -> &BTreeMap<String, Vec<String>> {
        &self.0
    }

    /// Every (category, item) pair in category order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(category, items)| items.iter().map(move |item| (category.as_str(), item.as_str())))
    }

    /// All domain keys, `"category:item"`
    pub fn all_keys(&self) -> Vec<String> {
        self.entries().map(|(c, i)| format!("{}:{}", c, i)).collect()
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self(default_taxonomy())
    }
}

/// An under-represented taxonomy item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LearningGap {
    pub category: String,
    pub item: String,
}

impl LearningGap {
    pub fn new(category: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            item: item.into(),
        }
    }

    pub fn domain_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LearningGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.item)
    }
}

impl FromStr for LearningGap {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((category, item)) if !category.trim().is_empty() && !item.trim().is_empty() => {
                Ok(Self::new(category.trim(), item.trim()))
            }
            _ => Err(KnowledgeError::InvalidInput(format!(
                "domain key '{}' is not of the form category:item", s
            ))),
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Lending-domain taxonomy: banks, loan products, topics, user questions
pub fn default_taxonomy() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        (
            "bank_info".to_string(),
            owned(&[
                "China Merchants Bank",
                "Industrial and Commercial Bank of China",
                "China Construction Bank",
                "Agricultural Bank of China",
                "Bank of China",
                "China Everbright Bank",
                "China Minsheng Bank",
                "Industrial Bank",
                "Shanghai Pudong Development Bank",
                "Bank of Communications",
                "China CITIC Bank",
                "Hua Xia Bank",
                "China Guangfa Bank",
                "Ping An Bank",
                "Postal Savings Bank of China",
                "Citibank",
                "HSBC",
                "Standard Chartered",
                "JPMorgan Chase",
                "Wells Fargo",
                "Bank of America",
                "Deutsche Bank",
                "UBS",
                "Barclays",
                "ANZ",
                "Royal Bank of Canada",
                "MUFG Bank",
                "Sumitomo Mitsui Banking Corporation",
            ]),
        ),
        (
            "product_info".to_string(),
            owned(&[
                "personal credit loan",
                "credit card",
                "mortgage",
                "car loan",
                "business loan",
                "consumer loan",
                "education loan",
                "home renovation loan",
                "travel loan",
            ]),
        ),
        (
            "general_knowledge".to_string(),
            owned(&[
                "interest rate calculation",
                "application requirements",
                "approval process",
                "repayment methods",
                "risk assessment",
                "credit report inquiry",
                "loan comparison",
                "preferential policies",
            ]),
        ),
        (
            "user_feedback".to_string(),
            owned(&[
                "how is the loan interest rate calculated",
                "what do I need to apply for a loan",
                "which bank has the lowest loan rate",
                "how can I improve my loan approval odds",
                "what are the rules for early repayment",
            ]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_taxonomy_shape() {
        let taxonomy = Taxonomy::default();
        assert_eq!(taxonomy.categories().len(), 4);
        assert_eq!(taxonomy.len(), 28 + 9 + 8 + 5);
        assert!(taxonomy.all_keys().contains(&"product_info:mortgage".to_string()));
    }

    #[test]
    fn test_from_keys_groups_and_dedups() {
        let taxonomy = Taxonomy::from_keys(["bank:A", "bank:B", "bank:A", "topic:rates"]).unwrap();
        assert_eq!(taxonomy.len(), 3);
        assert_eq!(taxonomy.all_keys(), vec!["bank:A", "bank:B", "topic:rates"]);
    }

    #[test]
    fn test_gap_parse() {
        let gap: LearningGap = "user_feedback: early repayment rules".parse().unwrap();
        assert_eq!(gap.category, "user_feedback");
        assert_eq!(gap.item, "early repayment rules");
        assert_eq!(gap.domain_key(), "user_feedback:early repayment rules");

        assert!("no-separator".parse::<LearningGap>().is_err());
        assert!(":item".parse::<LearningGap>().is_err());
    }
}
