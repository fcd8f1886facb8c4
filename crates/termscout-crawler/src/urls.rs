//! URL canonicalization and the rules deciding which links a crawl follows.

use std::collections::HashSet;

use anyhow::Context;
use regex::{RegexSet, RegexSetBuilder};
use url::Url;

/// Canonical key of a URL: scheme and host lowercased, fragment and
/// trailing slash stripped, query preserved.
pub fn normalize(url: &Url) -> String {
    let mut key = format!("{}://", url.scheme().to_ascii_lowercase());
    if let Some(host) = url.host_str() {
        key.push_str(&host.to_ascii_lowercase());
    }
    if let Some(port) = url.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    key.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query() {
        key.push('?');
        key.push_str(query);
    }
    key
}

/// Parses then normalizes, `None` for strings that are not absolute URLs.
pub fn normalize_str(raw: &str) -> Option<String> {
    Url::parse(raw.trim()).ok().map(|u| normalize(&u))
}

/// Parses a roster or seed URL, adding `https://` when the scheme is missing.
pub fn parse_seed(raw: &str) -> anyhow::Result<Url> {
    let raw = raw.trim();
    anyhow::ensure!(!raw.is_empty(), "Empty URL");
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{raw}"))
            .with_context(|| format!("Invalid URL: {raw}"))?,
        Err(e) => return Err(e).with_context(|| format!("Invalid URL: {raw}")),
    };
    anyhow::ensure!(is_http(&url), "Unsupported URL: {raw}");
    Ok(url)
}

pub fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().map_or(false, |h| !h.is_empty())
}

/// The rate limiting key of a URL.
pub fn domain(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}

/// Decides which discovered links belong to a seed's site and are worth
/// queuing.
#[derive(Debug, Clone)]
pub struct LinkFilter {
    hosts: HashSet<String>,
    skip: RegexSet,
}

impl LinkFilter {
    pub fn new(seed: &Url, allowed_hosts: &[String], skip_patterns: &[String]) -> anyhow::Result<Self> {
        let mut hosts: HashSet<String> = allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        hosts.insert(domain(seed));
        let skip = RegexSetBuilder::new(skip_patterns)
            .case_insensitive(true)
            .build()
            .context("Invalid skip URL pattern")?;
        Ok(Self { hosts, skip })
    }

    pub fn same_site(&self, url: &Url) -> bool {
        self.hosts.contains(&domain(url))
    }

    pub fn skipped(&self, url: &Url) -> bool {
        self.skip.is_match(url.as_str())
    }

    pub fn accept(&self, url: &Url) -> bool {
        is_http(url) && self.same_site(url) && !self.skipped(url)
    }
}

/// Resolves an `href` against the page it was found on.
pub fn resolve(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if ["mailto:", "tel:", "javascript:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }
    let mut url = base.join(href).ok()?;
    url.set_fragment(None);
    is_http(&url).then_some(url)
}
