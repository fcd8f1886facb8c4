use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::target::Target;

/// Free-text contextualization of a target's findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum Summary {
    Text(String),
    /// The summarizer couldn't answer, e.g. missing key or exhausted quota
    Unavailable(String),
}

impl Summary {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Unavailable(_) => None,
        }
    }
}

/// Boundary to an external summarization service.
///
/// Implementations must not fail the scan: any problem is reported as
/// `Summary::Unavailable`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `snippets` holds the `(term, snippet)` pairs found for `target`.
    async fn summarize(&self, target: &Target, snippets: &[(String, String)]) -> Summary;
}

/// Used when no summarization service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSummarizer;

#[async_trait]
impl Summarizer for NoSummarizer {
    async fn summarize(&self, _target: &Target, _snippets: &[(String, String)]) -> Summary {
        Summary::Unavailable("no summarizer configured".into())
    }
}
