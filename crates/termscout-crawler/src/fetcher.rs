use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use tokio::sync::OnceCell;
use url::Url;

use crate::cache::{is_html_type, CachedPage, PageCache};
use crate::config::CrawlerConfig;
use crate::html;
use crate::limiter::DomainLimiter;
use crate::urls;

const MAX_REDIRECTS: usize = 10;

/// Classified outcome of fetching one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Ok(Arc<CachedPage>),
    /// Access denied or rate limited by the remote site
    Blocked(u16),
    /// Any other non-success status
    HttpStatus(u16),
    Timeout,
    NetworkError(String),
    /// Content type is not textual
    NonHtml(String),
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Whether the outcome counts as a failed fetch for the target status.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Ok(_) | Self::NonHtml(_))
    }

    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::NetworkError(_))
    }
}

impl fmt::Display for FetchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(page) => write!(f, "ok ({})", page.status),
            Self::Blocked(code) => write!(f, "blocked ({code})"),
            Self::HttpStatus(code) => write!(f, "http status {code}"),
            Self::Timeout => write!(f, "timeout"),
            Self::NetworkError(detail) => write!(f, "network error: {detail}"),
            Self::NonHtml(ct) => write!(f, "non html content: {ct}"),
        }
    }
}

/// Source of pages for the crawler.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &Url) -> FetchResult;
}

/// HTTP fetcher going through the page cache and the per-domain limiter.
///
/// Within one run a normalized URL reaches the network at most once:
/// concurrent callers share the in-flight request and outcomes that are not
/// cached (failures, non HTML) are remembered.
pub struct Fetcher {
    client: reqwest::Client,
    cache: Arc<PageCache>,
    limiter: DomainLimiter,
    retries: u32,
    retry_backoff: Duration,
    outcomes: Mutex<HashMap<String, Arc<OnceCell<FetchResult>>>>,
}

enum FetchState {
    Lookup,
    Request { attempt: u32 },
    Backoff { attempt: u32, last: FetchResult },
    Finished(FetchResult),
}

impl Fetcher {
    pub fn new(config: &CrawlerConfig, cache: Arc<PageCache>) -> anyhow::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .deflate(true)
            .build()?;

        Ok(Self {
            client,
            cache,
            limiter: DomainLimiter::new(config.domain_interval()),
            retries: config.retries,
            retry_backoff: config.retry_backoff(),
            outcomes: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn limiter(&self) -> &DomainLimiter {
        &self.limiter
    }

    fn outcome_cell(&self, key: &str) -> Arc<OnceCell<FetchResult>> {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        outcomes.entry(key.to_string()).or_default().clone()
    }

    async fn fetch_uncoalesced(&self, url: &Url, key: &str) -> FetchResult {
        let mut state = FetchState::Lookup;
        loop {
            state = match state {
                FetchState::Lookup => match self.cache.get(key) {
                    Some(page) => {
                        log::debug!("Cache hit: {key}");
                        FetchState::Finished(FetchResult::Ok(page))
                    }
                    None => FetchState::Request { attempt: 0 },
                },
                FetchState::Request { attempt } => {
                    self.limiter.wait(&urls::domain(url)).await;
                    match self.request(url, key).await {
                        res if res.is_transient() && attempt < self.retries => {
                            FetchState::Backoff { attempt, last: res }
                        }
                        res => FetchState::Finished(res),
                    }
                }
                FetchState::Backoff { attempt, last } => {
                    let delay = self
                        .retry_backoff
                        .checked_mul(2u32.saturating_pow(attempt))
                        .unwrap_or(Duration::MAX);
                    log::debug!("Retrying {url} in {delay:?} after {last}");
                    tokio::time::sleep(delay).await;
                    FetchState::Request {
                        attempt: attempt + 1,
                    }
                }
                FetchState::Finished(res) => return res,
            };
        }
    }

    /// Requests `url`, following redirects hop by hop so that a target
    /// already cached is served from the cache instead of the network.
    async fn request(&self, url: &Url, key: &str) -> FetchResult {
        let mut current = url.clone();
        for _ in 0..=MAX_REDIRECTS {
            let resp = match self
                .client
                .get(current.clone())
                .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,text/*;q=0.8")
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => return classify_error(&e),
            };

            let status = resp.status();
            if status.is_redirection() {
                let Some(next) = redirect_target(&current, &resp) else {
                    return FetchResult::HttpStatus(status.as_u16());
                };
                if let Some(page) = self.cache.get(&urls::normalize(&next)) {
                    log::debug!("Redirect {current} -> {next} served from cache");
                    let location = page.location.clone().unwrap_or_else(|| page.url.clone());
                    let alias = CachedPage {
                        url: key.to_string(),
                        location: Some(location),
                        ..page.as_ref().clone()
                    };
                    return self.store(key, alias);
                }
                self.limiter.wait(&urls::domain(&next)).await;
                current = next;
                continue;
            }
            if let Some(res) = classify_status(status) {
                return res;
            }
            return self.read_page(resp, key, &current).await;
        }
        FetchResult::NetworkError(format!("more than {MAX_REDIRECTS} redirects"))
    }

    async fn read_page(&self, resp: reqwest::Response, key: &str, location: &Url) -> FetchResult {
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(ct) = &content_type {
            if !is_textual(ct) {
                return FetchResult::NonHtml(ct.clone());
            }
        }

        let content = match resp.text().await {
            Ok(content) => content,
            Err(e) => return classify_error(&e),
        };

        let html_like = content_type.as_deref().map_or(true, is_html_type);
        if html_like && html::is_challenge_page(&content) {
            return FetchResult::Blocked(status.as_u16());
        }

        let page = CachedPage::new(key.to_string(), status.as_u16(), content_type, content)
            .with_location(location.as_str());

        // Later links to the final URL are cache hits
        let location_key = urls::normalize(location);
        if location_key != key {
            self.store(
                &location_key,
                CachedPage {
                    url: location_key.clone(),
                    ..page.clone()
                },
            );
        }
        self.store(key, page)
    }

    /// A failed cache write is logged, the page is still returned.
    fn store(&self, key: &str, page: CachedPage) -> FetchResult {
        let page = Arc::new(page);
        if let Err(e) = self.cache.put(key, page.clone()) {
            log::warn!("{e:#}");
        }
        FetchResult::Ok(page)
    }
}

#[async_trait]
impl Fetch for Fetcher {
    async fn fetch(&self, url: &Url) -> FetchResult {
        let key = urls::normalize(url);
        let cell = self.outcome_cell(&key);
        let res = cell
            .get_or_init(|| self.fetch_uncoalesced(url, &key))
            .await
            .clone();

        // Successful pages live in the cache, the memo only keeps what it can't
        if res.is_ok() {
            self.outcomes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        }

        match &res {
            FetchResult::Ok(_) => log::debug!("Fetched {url}"),
            FetchResult::NonHtml(_) => log::debug!("Skipping {url}: {res}"),
            _ => log::warn!("Couldn't fetch {url}: {res}"),
        }
        res
    }
}

fn redirect_target(current: &Url, resp: &reqwest::Response) -> Option<Url> {
    let location = resp.headers().get(LOCATION)?.to_str().ok()?;
    current.join(location).ok().filter(urls::is_http)
}

fn is_textual(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/") || is_html_type(&ct)
}

fn classify_status(status: StatusCode) -> Option<FetchResult> {
    match status.as_u16() {
        200..=299 => None,
        401 | 403 | 429 | 451 => Some(FetchResult::Blocked(status.as_u16())),
        code => Some(FetchResult::HttpStatus(code)),
    }
}

fn classify_error(e: &reqwest::Error) -> FetchResult {
    if e.is_timeout() {
        FetchResult::Timeout
    } else if let Some(status) = e.status() {
        classify_status(status).unwrap_or_else(|| FetchResult::NetworkError(e.to_string()))
    } else {
        FetchResult::NetworkError(e.to_string())
    }
}
