use std::cmp;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    #[serde(default)]
    pub crawler: CrawlerConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum number of link hops from a seed
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Maximum number of page fetches per seed
    #[serde(default = "default_max_pages_per_site")]
    pub max_pages_per_site: usize,

    /// Minimum delay in seconds between two requests to the same domain
    #[serde(default = "default_domain_delay")]
    pub domain_delay: f32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra attempts for timeouts and transient network errors
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Concurrent fetches within one BFS level
    #[serde(default = "default_concurrent_fetches")]
    pub concurrent_fetches: usize,

    /// Targets processed concurrently
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Hosts considered part of any seed's site
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Case-insensitive regexes, matching links are never queued
    #[serde(default = "default_skip_url_patterns")]
    pub skip_url_patterns: Vec<String>,

    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,

    #[serde(default)]
    pub require_relevant_content: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_depth: default_max_depth(),
            max_pages_per_site: default_max_pages_per_site(),
            domain_delay: default_domain_delay(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            concurrent_fetches: default_concurrent_fetches(),
            num_workers: default_num_workers(),
            allowed_hosts: vec![],
            skip_url_patterns: default_skip_url_patterns(),
            min_content_length: default_min_content_length(),
            require_relevant_content: false,
        }
    }
}

impl CrawlerConfig {
    pub fn domain_interval(&self) -> Duration {
        if self.domain_delay.is_nan() || self.domain_delay <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f32(self.domain_delay).unwrap_or(Duration::MAX)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_user_agent() -> String {
    String::from("termscout/0.1")
}

fn default_max_depth() -> usize {
    3
}

fn default_max_pages_per_site() -> usize {
    50
}

fn default_domain_delay() -> f32 {
    1.0
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_concurrent_fetches() -> usize {
    4
}

fn default_num_workers() -> usize {
    cmp::max(1, num_cpus::get().saturating_sub(2))
}

fn default_min_content_length() -> usize {
    200
}

fn default_skip_url_patterns() -> Vec<String> {
    [
        r"\.(pdf|docx?|xlsx?|pptx?|zip|rar|7z|gz|tar)$",
        r"\.(jpe?g|png|gif|svg|webp|ico|bmp|tiff?)$",
        r"\.(mp3|mp4|wav|ogg|m4a|avi|mov|wmv|webm)$",
        r"\.(css|js|json|xml|rss|atom|woff2?|ttf|eot)$",
        r"/wp-content/uploads/",
        r"/userfiles/",
        r"/(login|logout|signup|register)\b",
        r"/wp-admin",
        r"/cdn-cgi/",
        r"/cms/one\.aspx\?.*(view=day|currentdate=)",
        r"returnurl=",
        r"sessionid=",
        r"/(print|share)\b",
        r"/(feed|api|ajax|graphql)/",
        r"/(calendar|events)/\d{4}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    #[serde(default = "default_terms")]
    pub terms: Vec<String>,

    /// Size in characters of the window kept around each occurrence
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,

    /// Maximum snippets kept per term and page, occurrences are always counted
    #[serde(default = "default_max_snippets_per_term")]
    pub max_snippets_per_term: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            terms: default_terms(),
            context_chars: default_context_chars(),
            max_snippets_per_term: default_max_snippets_per_term(),
        }
    }
}

fn default_terms() -> Vec<String> {
    [
        "restorative justice",
        "race equity",
        "restorative practices",
        "restorative discipline",
        "alternatives to suspension",
        "non-punitive discipline",
        "student-centered discipline",
        "discipline equity",
        "equitable discipline",
        "closing discipline gaps",
        "discipline disparities",
        "disproportionate discipline",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_context_chars() -> usize {
    200
}

fn default_max_snippets_per_term() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Skip targets already marked done in the checkpoint
    #[serde(default = "default_resume")]
    pub resume: bool,

    /// Stop after this many targets were processed in one invocation
    #[serde(default)]
    pub max_targets: Option<usize>,

    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,

    /// No directory keeps the page cache in memory only
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            resume: default_resume(),
            max_targets: None,
            checkpoint_file: default_checkpoint_file(),
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_resume() -> bool {
    true
}

fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("output/progress.json")
}

fn default_cache_dir() -> Option<PathBuf> {
    Some(PathBuf::from("output/cache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_like_json_keeps_defaults() {
        let conf: ScanConfig = serde_json::from_str(
            r#"{"crawler": {"maxDepth": 1, "domainDelay": 0}, "search": {"terms": ["race equity"]}}"#,
        )
        .unwrap();

        assert_eq!(conf.crawler.max_depth, 1);
        assert_eq!(conf.crawler.domain_interval(), Duration::ZERO);
        assert_eq!(conf.crawler.max_pages_per_site, 50);
        assert_eq!(conf.search.terms, vec!["race equity".to_string()]);
        assert_eq!(conf.search.context_chars, 200);
        assert!(conf.run.resume);
        assert!(conf.run.max_targets.is_none());
    }

    #[test]
    fn negative_delay_disables_throttling() {
        let conf = CrawlerConfig {
            domain_delay: -2.0,
            ..Default::default()
        };
        assert_eq!(conf.domain_interval(), Duration::ZERO);
    }

    #[test]
    fn huge_delay_saturates() {
        let conf = CrawlerConfig {
            domain_delay: 1e30,
            ..Default::default()
        };
        assert_eq!(conf.domain_interval(), Duration::MAX);

        let conf = CrawlerConfig {
            domain_delay: f32::INFINITY,
            ..Default::default()
        };
        assert_eq!(conf.domain_interval(), Duration::MAX);
    }
}
