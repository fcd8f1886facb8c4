use lazy_static::lazy_static;
use scraper::{Html, Node, Selector};
use url::Url;

use crate::urls;

lazy_static! {
    static ref LINKS: Selector = Selector::parse("a[href], area[href]").unwrap();
    static ref BASE: Selector = Selector::parse("base[href]").unwrap();
}

const HIDDEN_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "header", "footer", "svg",
];

const CHALLENGE_MARKERS: &[&str] = &[
    "checking your browser",
    "cf-browser-verification",
    "challenge-platform",
    "ddos protection by",
    "enable javascript and cookies to continue",
    "please enable javascript to view",
    "client challenge",
];

/// Challenge pages are small, real pages mentioning a CDN are not.
const CHALLENGE_MAX_BYTES: usize = 32 * 1024;

/// What the crawler needs from one HTML document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub text: String,
    pub links: Vec<Url>,
}

/// Extracts visible text and absolute link targets from `content`.
///
/// Links are resolved against the document's `<base href>` when present,
/// else against `page_url`, and returned deduplicated in document order.
pub fn parse_page(content: &str, page_url: &Url) -> ParsedPage {
    let document = Html::parse_document(content);

    let base = document
        .select(&BASE)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| page_url.join(href).ok())
        .unwrap_or_else(|| page_url.clone());

    let mut seen = std::collections::HashSet::new();
    let links = document
        .select(&LINKS)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| urls::resolve(&base, href))
        .filter(|url| seen.insert(url.as_str().to_string()))
        .collect();

    ParsedPage {
        text: visible_text(&document),
        links,
    }
}

pub fn extract_text(content: &str) -> String {
    visible_text(&Html::parse_document(content))
}

fn visible_text(document: &Html) -> String {
    let mut chunks = Vec::new();
    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map_or(false, |el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            chunks.push(&**text);
        }
    }
    collapse_whitespace(&chunks.join(" "))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a 2xx body is an anti-bot interstitial rather than content.
pub fn is_challenge_page(content: &str) -> bool {
    if content.len() > CHALLENGE_MAX_BYTES {
        return false;
    }
    let lower = content.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
}
