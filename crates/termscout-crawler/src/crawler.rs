use std::collections::HashSet;

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::CrawlerConfig;
use crate::fetcher::{Fetch, FetchResult};
use crate::html;
use crate::orchestrator::StopSignal;
use crate::searcher::TermSearcher;
use crate::target::Source;
use crate::urls::{self, LinkFilter};

/// A fetched page and its extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledPage {
    pub url: String,
    pub text: String,
    pub depth: usize,
    pub source: Source,
}

/// A page whose fetch failed, kept as an annotation on the target result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageFailure {
    pub url: String,
    pub depth: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub seed: String,
    pub source: Source,
    pub pages: Vec<CrawledPage>,
    pub failures: Vec<PageFailure>,
    /// Fetch attempts, cache hits included
    pub fetched: usize,
    pub seed_failed: bool,
    /// Interrupted by the stop signal
    pub aborted: bool,
}

impl CrawlReport {
    fn new(seed: &Url, source: Source) -> Self {
        Self {
            seed: urls::normalize(seed),
            source,
            pages: vec![],
            failures: vec![],
            fetched: 0,
            seed_failed: false,
            aborted: false,
        }
    }
}

/// URLs already queued during the traversal of one target.
#[derive(Debug, Default)]
pub struct Traversal {
    visited: HashSet<String>,
}

impl Traversal {
    /// Records `key`, returning false when it was already visited.
    pub fn visit(&mut self, key: &str) -> bool {
        self.visited.insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.visited.contains(key)
    }

    pub fn len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
    }
}

/// Breadth-first traversal of the pages of a site.
pub struct Crawler<'a, F: ?Sized> {
    fetcher: &'a F,
    config: &'a CrawlerConfig,
    searcher: &'a TermSearcher,
    stop: &'a StopSignal,
}

impl<'a, F> Crawler<'a, F>
where
    F: Fetch + ?Sized,
{
    pub fn new(
        fetcher: &'a F,
        config: &'a CrawlerConfig,
        searcher: &'a TermSearcher,
        stop: &'a StopSignal,
    ) -> Self {
        Self {
            fetcher,
            config,
            searcher,
            stop,
        }
    }

    /// Crawls same-site pages reachable from `seed`, level by level, up to
    /// `maxDepth` hops and `maxPagesPerSite` fetches.
    ///
    /// Pages are returned in BFS order. Fails only on an invalid link filter
    /// configuration, fetch problems are recorded in the report.
    pub async fn crawl(
        &self,
        seed: &Url,
        source: Source,
        traversal: &mut Traversal,
    ) -> anyhow::Result<CrawlReport> {
        let filter = LinkFilter::new(seed, &self.config.allowed_hosts, &self.config.skip_url_patterns)?;
        let mut report = CrawlReport::new(seed, source);

        if !traversal.visit(&report.seed) {
            log::debug!("Seed {seed} already crawled for this target");
            return Ok(report);
        }

        log::info!(
            "Crawling {seed} (max depth {}, max pages {})",
            self.config.max_depth,
            self.config.max_pages_per_site
        );

        let mut frontier = vec![seed.clone()];
        let mut depth = 0;
        while !frontier.is_empty() && report.fetched < self.config.max_pages_per_site {
            if self.stop.is_raised() {
                report.aborted = true;
                break;
            }

            let mut level = std::mem::take(&mut frontier);
            level.truncate(self.config.max_pages_per_site - report.fetched);

            let fetcher = self.fetcher;
            let mut results = stream::iter(level)
                .map(|url| async move {
                    let res = fetcher.fetch(&url).await;
                    (url, res)
                })
                .buffered(self.config.concurrent_fetches.max(1));

            while let Some((url, res)) = results.next().await {
                report.fetched += 1;
                match res {
                    FetchResult::Ok(page) => {
                        let base = page
                            .location
                            .as_deref()
                            .and_then(|l| Url::parse(l).ok())
                            .unwrap_or_else(|| url.clone());
                        if depth > 0 && !filter.same_site(&base) {
                            log::debug!("Ignoring {url}, redirected off site to {base}");
                            continue;
                        }
                        let location_key = urls::normalize(&base);
                        if location_key != urls::normalize(&url) && !traversal.visit(&location_key) {
                            log::debug!("Ignoring {url}, redirected to already visited {base}");
                            continue;
                        }

                        let parsed = if page.is_html() {
                            html::parse_page(&page.content, &base)
                        } else {
                            html::ParsedPage {
                                text: html::collapse_whitespace(&page.content),
                                links: vec![],
                            }
                        };

                        if depth < self.config.max_depth && self.follow_links(depth, &parsed.text) {
                            for link in parsed.links {
                                if filter.accept(&link) && traversal.visit(&urls::normalize(&link)) {
                                    frontier.push(link);
                                }
                            }
                        }

                        report.pages.push(CrawledPage {
                            url: location_key,
                            text: parsed.text,
                            depth,
                            source,
                        });
                    }
                    FetchResult::NonHtml(ct) if depth == 0 => {
                        report.seed_failed = true;
                        report.failures.push(PageFailure {
                            url: urls::normalize(&url),
                            depth,
                            reason: format!("seed is not a web page ({ct})"),
                        });
                    }
                    FetchResult::NonHtml(_) => {}
                    failure => {
                        if depth == 0 {
                            report.seed_failed = true;
                        }
                        report.failures.push(PageFailure {
                            url: urls::normalize(&url),
                            depth,
                            reason: failure.to_string(),
                        });
                    }
                }

                if self.stop.is_raised() {
                    report.aborted = true;
                    break;
                }
            }

            if report.aborted {
                break;
            }
            depth += 1;
        }

        log::info!(
            "Crawled {seed}: {} pages, {} failures{}",
            report.pages.len(),
            report.failures.len(),
            if report.aborted { ", aborted" } else { "" }
        );
        Ok(report)
    }

    /// Thin directory-like pages are dead ends unless they mention a term.
    fn follow_links(&self, depth: usize, text: &str) -> bool {
        if self.config.require_relevant_content {
            return self.searcher.contains_any(text);
        }
        depth == 0
            || text.len() >= self.config.min_content_length
            || self.searcher.contains_any(text)
    }
}
