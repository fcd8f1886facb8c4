use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crawler::PageFailure;
use crate::searcher::SearchMatch;
use crate::summarizer::Summary;

/// Stable identifier of a target across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One school or district to scan, as read from the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Roster identifier, e.g. an NCES id
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub primary_url: Option<String>,
    #[serde(default)]
    pub secondary_url: Option<String>,
}

impl Target {
    pub fn new(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            state: state.into(),
            primary_url: None,
            secondary_url: None,
        }
    }

    pub fn with_primary(mut self, url: impl Into<String>) -> Self {
        self.primary_url = Some(url.into());
        self
    }

    pub fn with_secondary(mut self, url: impl Into<String>) -> Self {
        self.secondary_url = Some(url.into());
        self
    }

    /// The roster id when present, else `name_state`.
    pub fn id(&self) -> TargetId {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => TargetId(id.to_string()),
            _ => TargetId(format!("{}_{}", self.name.trim(), self.state.trim())),
        }
    }

    /// Provided seed URLs, blank cells dropped.
    pub fn seeds(&self) -> impl Iterator<Item = (Source, &str)> {
        [
            (Source::Primary, self.primary_url.as_deref()),
            (Source::Secondary, self.secondary_url.as_deref()),
        ]
        .into_iter()
        .filter_map(|(source, url)| url.map(str::trim).filter(|u| !u.is_empty()).map(|u| (source, u)))
    }
}

/// Which of a target's seeds a page was reached from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    /// The school site
    Primary,
    /// The district site
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScrapeStatus {
    Success,
    PartialFailure,
    Failure,
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::PartialFailure => f.write_str("partial-failure"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

/// Outcome of scanning one target. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    pub target: Target,
    /// Per-page matches grouped by term
    pub matches: BTreeMap<String, Vec<SearchMatch>>,
    pub term_counts: BTreeMap<String, usize>,
    pub total_occurrences: usize,
    pub matched_urls: BTreeSet<String>,
    pub pages_scanned: usize,
    pub failures: Vec<PageFailure>,
    /// Configuration problems such as an unparseable URL
    pub errors: Vec<String>,
    pub status: ScrapeStatus,
    pub summary: Option<Summary>,
    pub completed_at: DateTime<Utc>,
    /// Rebuilt from the checkpoint instead of scanned in this run
    pub resumed: bool,
}

impl TargetResult {
    pub fn new(
        target: Target,
        matches: Vec<SearchMatch>,
        pages_scanned: usize,
        failures: Vec<PageFailure>,
        errors: Vec<String>,
        status: ScrapeStatus,
    ) -> Self {
        let mut grouped: BTreeMap<String, Vec<SearchMatch>> = BTreeMap::new();
        let mut term_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut matched_urls = BTreeSet::new();
        for m in matches {
            *term_counts.entry(m.term.clone()).or_default() += m.occurrences;
            matched_urls.insert(m.url.clone());
            grouped.entry(m.term.clone()).or_default().push(m);
        }
        Self {
            target,
            total_occurrences: term_counts.values().sum(),
            matches: grouped,
            term_counts,
            matched_urls,
            pages_scanned,
            failures,
            errors,
            status,
            summary: None,
            completed_at: Utc::now(),
            resumed: false,
        }
    }

    pub fn with_summary(mut self, summary: Option<Summary>) -> Self {
        self.summary = summary;
        self
    }

    /// Rebuilds a result for a target completed by an earlier run.
    pub fn from_summary(target: Target, summary: &ResultSummary) -> Self {
        Self {
            target,
            matches: BTreeMap::new(),
            term_counts: summary.term_counts.clone(),
            total_occurrences: summary.total_occurrences,
            matched_urls: summary.matched_urls.clone(),
            pages_scanned: summary.pages_scanned,
            failures: vec![],
            errors: vec![],
            status: summary.status,
            summary: summary.summary.clone(),
            completed_at: summary.completed_at,
            resumed: true,
        }
    }

    pub fn terms_found(&self) -> impl Iterator<Item = &str> {
        self.term_counts.keys().map(String::as_str)
    }

    /// Flattened `(term, snippet)` pairs in term order.
    pub fn snippets(&self) -> Vec<(&str, &str)> {
        self.matches
            .iter()
            .flat_map(|(term, matches)| {
                matches
                    .iter()
                    .flat_map(move |m| m.snippets.iter().map(move |s| (term.as_str(), s.as_str())))
            })
            .collect()
    }

    pub fn occurrences_from(&self, source: Source) -> usize {
        self.matches
            .values()
            .flatten()
            .filter(|m| m.source == source)
            .map(|m| m.occurrences)
            .sum()
    }

    pub fn urls_from(&self, source: Source) -> BTreeSet<&str> {
        self.matches
            .values()
            .flatten()
            .filter(|m| m.source == source)
            .map(|m| m.url.as_str())
            .collect()
    }

    pub fn to_summary(&self) -> ResultSummary {
        ResultSummary {
            status: self.status,
            pages_scanned: self.pages_scanned,
            total_occurrences: self.total_occurrences,
            term_counts: self.term_counts.clone(),
            matched_urls: self.matched_urls.clone(),
            summary: self.summary.clone(),
            completed_at: self.completed_at,
        }
    }
}

/// Compact form of a `TargetResult` kept in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub status: ScrapeStatus,
    pub pages_scanned: usize,
    pub total_occurrences: usize,
    pub term_counts: BTreeMap<String, usize>,
    pub matched_urls: BTreeSet<String>,
    #[serde(default)]
    pub summary: Option<Summary>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(term: &str, url: &str, source: Source, n: usize) -> SearchMatch {
        SearchMatch {
            term: term.into(),
            url: url.into(),
            source,
            occurrences: n,
            snippets: vec![format!("... {term} ...")],
        }
    }

    #[test]
    fn ids_fall_back_to_name_and_state() {
        let t = Target::new("Oak Elementary ", "NC");
        assert_eq!(t.id(), TargetId("Oak Elementary_NC".into()));
        let t = Target {
            id: Some("370001234".into()),
            ..t
        };
        assert_eq!(t.id().to_string(), "370001234");
    }

    #[test]
    fn seeds_skip_blank_urls() {
        let t = Target::new("Oak", "NC")
            .with_primary("  ")
            .with_secondary("https://district.example.org");
        let seeds: Vec<_> = t.seeds().collect();
        assert_eq!(seeds, vec![(Source::Secondary, "https://district.example.org")]);
    }

    #[test]
    fn aggregation_by_term_and_source() {
        let result = TargetResult::new(
            Target::new("Oak", "NC"),
            vec![
                m("race equity", "https://oak.example.org/a", Source::Primary, 2),
                m("restorative justice", "https://oak.example.org/a", Source::Primary, 1),
                m("race equity", "https://district.example.org/b", Source::Secondary, 3),
            ],
            7,
            vec![],
            vec![],
            ScrapeStatus::Success,
        );

        assert_eq!(result.total_occurrences, 6);
        assert_eq!(result.term_counts["race equity"], 5);
        assert_eq!(result.matches["race equity"].len(), 2);
        assert_eq!(result.matched_urls.len(), 2);
        assert_eq!(result.occurrences_from(Source::Primary), 3);
        assert_eq!(result.occurrences_from(Source::Secondary), 3);
        assert_eq!(result.urls_from(Source::Secondary).len(), 1);
        assert_eq!(result.snippets().len(), 3);
        assert_eq!(result.terms_found().collect::<Vec<_>>(), vec!["race equity", "restorative justice"]);
    }

    #[test]
    fn summary_rebuilds_a_resumed_result() {
        let result = TargetResult::new(
            Target::new("Oak", "NC"),
            vec![m("race equity", "https://oak.example.org/a", Source::Primary, 2)],
            3,
            vec![],
            vec![],
            ScrapeStatus::PartialFailure,
        );
        let rebuilt = TargetResult::from_summary(result.target.clone(), &result.to_summary());

        assert!(rebuilt.resumed);
        assert_eq!(rebuilt.status, ScrapeStatus::PartialFailure);
        assert_eq!(rebuilt.term_counts, result.term_counts);
        assert_eq!(rebuilt.matched_urls, result.matched_urls);
        assert_eq!(rebuilt.completed_at, result.completed_at);
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ScrapeStatus::PartialFailure).unwrap(),
            "\"partial-failure\""
        );
    }
}
