mod cache;
mod checkpoint;
mod config;
mod crawler;
mod fetcher;
mod limiter;
mod orchestrator;
mod searcher;
mod summarizer;
mod target;

pub mod html;
pub mod urls;

pub use cache::{CachedPage, PageCache};
pub use checkpoint::{CheckpointEntry, CheckpointState, CheckpointStore, FileCheckpoint, MemoryCheckpoint, Status};
pub use config::{CrawlerConfig, RunConfig, ScanConfig, SearchConfig};
pub use crawler::{CrawlReport, CrawledPage, Crawler, PageFailure, Traversal};
pub use fetcher::{Fetch, FetchResult, Fetcher};
pub use limiter::DomainLimiter;
pub use orchestrator::{CollectSink, Orchestrator, ResultSink, RunReport, RunTally, StopSignal};
pub use searcher::{SearchMatch, TermSearcher};
pub use summarizer::{NoSummarizer, Summarizer, Summary};
pub use target::{ResultSummary, ScrapeStatus, Source, Target, TargetId, TargetResult};

pub use anyhow;
pub use async_trait::async_trait;
