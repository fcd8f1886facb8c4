use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::html::collapse_whitespace;
use crate::target::Source;

/// All occurrences of one term on one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub term: String,
    pub url: String,
    pub source: Source,
    pub occurrences: usize,
    pub snippets: Vec<String>,
}

/// Case-insensitive substring search with context extraction.
#[derive(Debug, Clone)]
pub struct TermSearcher {
    terms: Vec<(String, Regex)>,
    context_chars: usize,
    max_snippets: usize,
}

impl TermSearcher {
    pub fn new(config: &SearchConfig) -> anyhow::Result<Self> {
        let mut terms: Vec<(String, Regex)> = Vec::new();
        for term in &config.terms {
            let term = term.trim();
            if term.is_empty() || terms.iter().any(|(t, _)| t.eq_ignore_ascii_case(term)) {
                continue;
            }
            let re = RegexBuilder::new(&regex::escape(term))
                .case_insensitive(true)
                .build()?;
            terms.push((term.to_string(), re));
        }
        Ok(Self {
            terms,
            context_chars: config.context_chars,
            max_snippets: config.max_snippets_per_term,
        })
    }

    pub fn terms(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(t, _)| t.as_str())
    }

    /// One `SearchMatch` per term found in `text`, in configured term order.
    pub fn search(&self, text: &str, url: &str, source: Source) -> Vec<SearchMatch> {
        self.terms
            .iter()
            .filter_map(|(term, re)| {
                let mut occurrences = 0;
                let mut snippets = Vec::new();
                for m in re.find_iter(text) {
                    occurrences += 1;
                    if snippets.len() < self.max_snippets {
                        snippets.push(self.snippet(text, m.start(), m.end()));
                    }
                }
                (occurrences > 0).then(|| SearchMatch {
                    term: term.clone(),
                    url: url.to_string(),
                    source,
                    occurrences,
                    snippets,
                })
            })
            .collect()
    }

    pub fn contains_any(&self, text: &str) -> bool {
        self.terms.iter().any(|(_, re)| re.is_match(text))
    }

    /// Window of `context_chars` characters centered on `[start, end)`,
    /// clamped to the text bounds. The match itself is always kept whole.
    fn snippet(&self, text: &str, start: usize, end: usize) -> String {
        let half = self.context_chars / 2;
        let from = text[..start]
            .char_indices()
            .rev()
            .nth(half.saturating_sub(1))
            .map_or(0, |(i, _)| i);
        let from = if half == 0 { start } else { from };
        let to = text[end..]
            .char_indices()
            .nth(half)
            .map_or(text.len(), |(i, _)| end + i);
        collapse_whitespace(&text[from..to])
    }
}
