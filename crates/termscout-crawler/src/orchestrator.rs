use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{future, stream, StreamExt};

use crate::checkpoint::{CheckpointStore, Status};
use crate::config::ScanConfig;
use crate::crawler::{Crawler, Traversal};
use crate::fetcher::Fetch;
use crate::searcher::TermSearcher;
use crate::summarizer::Summarizer;
use crate::target::{ScrapeStatus, Target, TargetResult};
use crate::urls;

/// Cooperative cancellation shared by the orchestrator and the crawlers.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Downstream consumer of finished targets, e.g. the CSV report.
pub trait ResultSink: Send + Sync {
    fn emit(&self, result: &TargetResult) -> anyhow::Result<()>;
}

/// Keeps emitted results in memory.
#[derive(Debug, Default)]
pub struct CollectSink(Mutex<Vec<TargetResult>>);

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<TargetResult> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ResultSink for CollectSink {
    fn emit(&self, result: &TargetResult) -> anyhow::Result<()> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTally {
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    /// Skipped because an earlier run completed them
    pub resumed: usize,
}

impl RunTally {
    fn count(&mut self, result: &TargetResult) {
        if result.resumed {
            self.resumed += 1;
            return;
        }
        match result.status {
            ScrapeStatus::Success => self.succeeded += 1,
            ScrapeStatus::PartialFailure => self.partial += 1,
            ScrapeStatus::Failure => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// Resumed results first, then scanned ones in completion order
    pub results: Vec<TargetResult>,
    pub tally: RunTally,
    /// The stop signal ended the run early
    pub stopped: bool,
}

/// Drives the scan of a roster: resume decisions, crawling, searching and
/// checkpointing of every target.
pub struct Orchestrator<'a, F: ?Sized> {
    fetcher: &'a F,
    checkpoint: &'a dyn CheckpointStore,
    summarizer: &'a dyn Summarizer,
    sink: &'a dyn ResultSink,
    stop: StopSignal,
}

impl<'a, F> Orchestrator<'a, F>
where
    F: Fetch + ?Sized,
{
    pub fn new(
        fetcher: &'a F,
        checkpoint: &'a dyn CheckpointStore,
        summarizer: &'a dyn Summarizer,
        sink: &'a dyn ResultSink,
        stop: StopSignal,
    ) -> Self {
        Self {
            fetcher,
            checkpoint,
            summarizer,
            sink,
            stop,
        }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Scans `targets` in roster order with up to `numWorkers` targets in
    /// flight.
    ///
    /// Targets failing in any way still produce a result. Only a checkpoint
    /// write failure aborts the run.
    pub async fn run(&self, targets: &[Target], config: &ScanConfig) -> anyhow::Result<RunReport> {
        let searcher = TermSearcher::new(&config.search)?;
        let mut results = Vec::new();
        let mut tally = RunTally::default();

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for target in targets {
            let id = target.id();
            if !seen.insert(id.clone()) {
                log::warn!("Duplicate target {id} in roster, skipping");
                continue;
            }
            if config.run.resume && self.checkpoint.is_done(&id) {
                let entry = self.checkpoint.get(&id).and_then(|e| e.summary);
                match entry {
                    Some(summary) => {
                        log::debug!("Skipping {id}, already done");
                        let result = TargetResult::from_summary(target.clone(), &summary);
                        tally.count(&result);
                        results.push(result);
                        continue;
                    }
                    None => log::warn!("Target {id} is done but has no summary, scanning again"),
                }
            }
            pending.push(target);
        }

        let max_targets = config.run.max_targets.unwrap_or(usize::MAX);
        log::info!(
            "Scanning {} targets ({} already done) with {} workers",
            pending.len().min(max_targets),
            tally.resumed,
            config.crawler.num_workers
        );

        let mut scans = stream::iter(pending)
            .take(max_targets)
            .take_while(|_| future::ready(!self.stop.is_raised()))
            .map(|target| self.scan_target(target, &searcher, config))
            .buffer_unordered(config.crawler.num_workers.max(1));

        while let Some(result) = scans.next().await {
            let result = result?;
            tally.count(&result);
            results.push(result);
        }

        let stopped = self.stop.is_raised();
        log::info!(
            "Run {}: {} succeeded, {} partial, {} failed, {} resumed",
            if stopped { "stopped" } else { "finished" },
            tally.succeeded,
            tally.partial,
            tally.failed,
            tally.resumed
        );

        Ok(RunReport {
            results,
            tally,
            stopped,
        })
    }

    async fn scan_target(
        &self,
        target: &Target,
        searcher: &TermSearcher,
        config: &ScanConfig,
    ) -> anyhow::Result<TargetResult> {
        let id = target.id();
        self.checkpoint.mark(&id, Status::InProgress, None)?;
        log::info!("Scanning {id} ({})", target.name);

        let mut errors = Vec::new();
        let mut seeds = Vec::new();
        for (source, raw) in target.seeds() {
            match urls::parse_seed(raw) {
                Ok(url) => seeds.push((source, url)),
                Err(e) => errors.push(format!("Invalid {source:?} url {raw:?}: {e:#}")),
            }
        }
        if seeds.is_empty() {
            if errors.is_empty() {
                errors.push("No url provided".to_string());
            }
            log::warn!("Target {id} has no valid url: {}", errors.join("; "));
            let result = TargetResult::new(target.clone(), vec![], 0, vec![], errors, ScrapeStatus::Failure);
            return self.finish(result, false);
        }

        let crawler = Crawler::new(self.fetcher, &config.crawler, searcher, &self.stop);
        let mut traversal = Traversal::default();
        let mut matches = Vec::new();
        let mut pages_scanned = 0;
        let mut failures = Vec::new();
        let mut seeds_failed = 0;
        let mut aborted = false;

        for (source, seed) in &seeds {
            if aborted {
                break;
            }
            let report = match crawler.crawl(seed, *source, &mut traversal).await {
                Ok(report) => report,
                Err(e) => {
                    errors.push(format!("{e:#}"));
                    seeds_failed += 1;
                    continue;
                }
            };

            pages_scanned += report.pages.len();
            for page in &report.pages {
                matches.extend(searcher.search(&page.text, &page.url, page.source));
            }
            if report.seed_failed {
                seeds_failed += 1;
            }
            failures.extend(report.failures);
            aborted |= report.aborted;
        }

        if pages_scanned == 0 && failures.is_empty() && errors.is_empty() && !aborted {
            errors.push("No page could be scanned".to_string());
        }
        let status = if aborted || seeds_failed == seeds.len() || pages_scanned == 0 {
            ScrapeStatus::Failure
        } else if !failures.is_empty() || !errors.is_empty() {
            ScrapeStatus::PartialFailure
        } else {
            ScrapeStatus::Success
        };
        if aborted {
            errors.push("Interrupted by stop signal".to_string());
        }

        let mut result = TargetResult::new(target.clone(), matches, pages_scanned, failures, errors, status);
        if !aborted && result.total_occurrences > 0 {
            let snippets: Vec<(String, String)> = result
                .snippets()
                .into_iter()
                .map(|(term, snippet)| (term.to_string(), snippet.to_string()))
                .collect();
            let summary = self.summarizer.summarize(target, &snippets).await;
            result = result.with_summary(Some(summary));
        }

        self.finish(result, aborted)
    }

    /// Emits `result` then records its final checkpoint state.
    fn finish(&self, result: TargetResult, aborted: bool) -> anyhow::Result<TargetResult> {
        let id = result.target.id();

        let emitted = if aborted {
            false
        } else {
            match self.sink.emit(&result) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("Couldn't emit result for {id}: {e:#}");
                    false
                }
            }
        };

        if emitted && result.status != ScrapeStatus::Failure {
            self.checkpoint.mark(&id, Status::Done, Some(result.to_summary()))?;
        } else {
            self.checkpoint.mark(&id, Status::Failed, None)?;
        }

        log::info!(
            "Finished {id}: {}, {} pages, {} occurrences",
            result.status,
            result.pages_scanned,
            result.total_occurrences
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::cache::CachedPage;
    use crate::checkpoint::MemoryCheckpoint;
    use crate::fetcher::FetchResult;
    use crate::summarizer::{NoSummarizer, Summary};

    /// Serves canned pages keyed by normalized URL.
    #[derive(Default)]
    struct StaticFetch {
        pages: HashMap<String, FetchResult>,
        calls: Mutex<Vec<String>>,
    }

    impl StaticFetch {
        fn page(mut self, url: &str, body: &str) -> Self {
            let key = urls::normalize_str(url).unwrap();
            let page = CachedPage::new(key.clone(), 200, Some("text/html".into()), body.into());
            self.pages.insert(key, FetchResult::Ok(Arc::new(page)));
            self
        }

        fn fail(mut self, url: &str, res: FetchResult) -> Self {
            self.pages.insert(urls::normalize_str(url).unwrap(), res);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetch for StaticFetch {
        async fn fetch(&self, url: &Url) -> FetchResult {
            let key = urls::normalize(url);
            self.calls.lock().unwrap().push(key.clone());
            self.pages
                .get(&key)
                .cloned()
                .unwrap_or(FetchResult::HttpStatus(404))
        }
    }

    struct FailingSink;

    impl ResultSink for FailingSink {
        fn emit(&self, _result: &TargetResult) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    struct EchoSummarizer;

    #[async_trait]
    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, target: &Target, snippets: &[(String, String)]) -> Summary {
            Summary::Text(format!("{}: {} snippets", target.name, snippets.len()))
        }
    }

    fn config() -> ScanConfig {
        let mut config = ScanConfig::default();
        config.crawler.num_workers = 1;
        config.search.terms = vec!["race equity".into()];
        config
    }

    fn oak() -> Target {
        Target::new("Oak", "NC").with_primary("https://oak.example.org")
    }

    fn oak_site() -> StaticFetch {
        StaticFetch::default()
            .page(
                "https://oak.example.org",
                r#"<p>Welcome</p><a href="/policy">Policy</a>"#,
            )
            .page(
                "https://oak.example.org/policy",
                "<p>Our race equity plan.</p>",
            )
    }

    #[tokio::test]
    async fn scans_and_checkpoints_a_target() {
        let fetch = oak_site();
        let checkpoint = MemoryCheckpoint::new();
        let sink = CollectSink::new();
        let orchestrator = Orchestrator::new(&fetch, &checkpoint, &EchoSummarizer, &sink, StopSignal::new());

        let report = orchestrator.run(&[oak()], &config()).await.unwrap();

        assert_eq!(report.tally.succeeded, 1);
        let result = &report.results[0];
        assert_eq!(result.status, ScrapeStatus::Success);
        assert_eq!(result.pages_scanned, 2);
        assert_eq!(result.term_counts["race equity"], 1);
        assert_eq!(result.summary, Some(Summary::Text("Oak: 1 snippets".into())));
        assert!(checkpoint.is_done(&oak().id()));
        assert_eq!(sink.results().len(), 1);
    }

    #[tokio::test]
    async fn resumed_targets_are_not_crawled_again() {
        let fetch = oak_site();
        let checkpoint = MemoryCheckpoint::new();
        let sink = CollectSink::new();
        let orchestrator = Orchestrator::new(&fetch, &checkpoint, &NoSummarizer, &sink, StopSignal::new());

        orchestrator.run(&[oak()], &config()).await.unwrap();
        let calls = fetch.calls().len();
        let report = orchestrator.run(&[oak()], &config()).await.unwrap();

        assert_eq!(fetch.calls().len(), calls);
        assert_eq!(report.tally.resumed, 1);
        assert!(report.results[0].resumed);
        assert_eq!(report.results[0].term_counts["race equity"], 1);
        assert_eq!(sink.results().len(), 1);
    }

    #[tokio::test]
    async fn invalid_url_fails_without_network() {
        let fetch = StaticFetch::default();
        let checkpoint = MemoryCheckpoint::new();
        let sink = CollectSink::new();
        let orchestrator = Orchestrator::new(&fetch, &checkpoint, &NoSummarizer, &sink, StopSignal::new());

        let targets = [
            Target::new("Elm", "NC").with_primary("ftp://elm.example.org"),
            Target::new("Pine", "NC"),
        ];
        let report = orchestrator.run(&targets, &config()).await.unwrap();

        assert!(fetch.calls().is_empty());
        assert_eq!(report.tally.failed, 2);
        assert!(report.results.iter().all(|r| !r.errors.is_empty()));
        let state = checkpoint.load().unwrap();
        assert!(state.values().all(|e| e.status == Status::Failed));
    }

    #[tokio::test]
    async fn failed_secondary_is_a_partial_failure() {
        let fetch = oak_site().fail("https://district.example.org", FetchResult::Timeout);
        let checkpoint = MemoryCheckpoint::new();
        let sink = CollectSink::new();
        let orchestrator = Orchestrator::new(&fetch, &checkpoint, &NoSummarizer, &sink, StopSignal::new());

        let target = oak().with_secondary("https://district.example.org");
        let report = orchestrator.run(&[target.clone()], &config()).await.unwrap();

        assert_eq!(report.results[0].status, ScrapeStatus::PartialFailure);
        assert_eq!(report.results[0].failures.len(), 1);
        assert!(checkpoint.is_done(&target.id()));
    }

    #[tokio::test]
    async fn sink_errors_mark_the_target_failed() {
        let fetch = oak_site();
        let checkpoint = MemoryCheckpoint::new();
        let orchestrator = Orchestrator::new(&fetch, &checkpoint, &NoSummarizer, &FailingSink, StopSignal::new());

        let report = orchestrator.run(&[oak()], &config()).await.unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(checkpoint.get(&oak().id()).unwrap().status, Status::Failed);
    }

    #[tokio::test]
    async fn raised_stop_signal_starts_nothing() {
        let fetch = oak_site();
        let checkpoint = MemoryCheckpoint::new();
        let sink = CollectSink::new();
        let stop = StopSignal::new();
        stop.raise();
        let orchestrator = Orchestrator::new(&fetch, &checkpoint, &NoSummarizer, &sink, stop);

        let report = orchestrator.run(&[oak()], &config()).await.unwrap();

        assert!(report.stopped);
        assert!(report.results.is_empty());
        assert!(fetch.calls().is_empty());
        assert!(checkpoint.get(&oak().id()).is_none());
    }

    #[tokio::test]
    async fn duplicate_seeds_are_crawled_once() {
        let fetch = oak_site();
        let checkpoint = MemoryCheckpoint::new();
        let sink = CollectSink::new();
        let orchestrator = Orchestrator::new(&fetch, &checkpoint, &NoSummarizer, &sink, StopSignal::new());

        let target = oak().with_secondary("https://oak.example.org/");
        let report = orchestrator.run(&[target], &config()).await.unwrap();

        assert_eq!(report.results[0].status, ScrapeStatus::Success);
        assert_eq!(report.results[0].pages_scanned, 2);
        assert_eq!(fetch.calls().len(), 2);
    }

    #[tokio::test]
    async fn target_without_scanned_pages_fails() {
        let fetch = StaticFetch::default().fail(
            "https://oak.example.org",
            FetchResult::NonHtml("application/pdf".into()),
        );
        let checkpoint = MemoryCheckpoint::new();
        let sink = CollectSink::new();
        let orchestrator = Orchestrator::new(&fetch, &checkpoint, &NoSummarizer, &sink, StopSignal::new());

        let report = orchestrator.run(&[oak()], &config()).await.unwrap();

        assert_eq!(report.tally.failed, 1);
        assert_eq!(report.results[0].status, ScrapeStatus::Failure);
        assert_eq!(report.results[0].pages_scanned, 0);
        assert_eq!(checkpoint.get(&oak().id()).unwrap().status, Status::Failed);

        let mut config = config();
        config.crawler.max_pages_per_site = 0;
        let report = orchestrator.run(&[oak()], &config).await.unwrap();

        assert_eq!(report.results[0].status, ScrapeStatus::Failure);
        assert_eq!(report.results[0].errors, vec!["No page could be scanned".to_string()]);
    }
}
