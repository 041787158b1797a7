use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A finding produced by the remote AI predictor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Defect {
    pub category: String,
    pub reasoning: String,
}

/// Remote predictor used by AI-prefixed commands.
///
/// The engine is optional at flow level: its absence is only an error when
/// an AI command actually executes, so non-AI flows run without credentials.
#[async_trait]
pub trait AiEngine: Send + Sync {
    /// Scan a screenshot for visual defects.
    async fn find_defects(&self, screen: &[u8]) -> Result<Vec<Defect>>;

    /// Check a natural-language assertion against a screenshot. Returns a
    /// defect describing the mismatch, or `None` when the assertion holds.
    async fn perform_assertion(&self, screen: &[u8], assertion: &str) -> Result<Option<Defect>>;

    /// Extract text matching a natural-language query from a screenshot.
    async fn extract_text(&self, screen: &[u8], query: &str) -> Result<String>;
}
