use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A successfully fetched textual page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPage {
    /// Normalized URL, the cache key
    pub url: String,
    /// URL the content was served from after redirects
    #[serde(default)]
    pub location: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub status: u16,
    pub content_type: Option<String>,
    pub content: String,
    pub content_hash: String,
}

impl CachedPage {
    pub fn new(url: String, status: u16, content_type: Option<String>, content: String) -> Self {
        let content_hash = hex::encode(Sha256::digest(content.as_bytes()));
        Self {
            url,
            location: None,
            fetched_at: Utc::now(),
            status,
            content_type,
            content,
            content_hash,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn is_html(&self) -> bool {
        self.content_type.as_deref().map_or(true, is_html_type)
    }
}

pub(crate) fn is_html_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("text/html") || ct.contains("application/xhtml")
}

/// Page store keyed by normalized URL.
///
/// Without a directory every page lives in memory for the run. With one,
/// pages are only kept as one JSON file per URL and read back on each lookup,
/// so a long run doesn't hold every fetched page. Entries never expire.
#[derive(Debug)]
pub struct PageCache {
    store: Store,
}

#[derive(Debug)]
enum Store {
    Memory(RwLock<HashMap<String, Arc<CachedPage>>>),
    Disk(PathBuf),
}

impl Default for PageCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PageCache {
    pub fn in_memory() -> Self {
        Self {
            store: Store::Memory(RwLock::default()),
        }
    }

    pub fn on_disk(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(Self {
            store: Store::Disk(dir),
        })
    }

    pub fn get(&self, key: &str) -> Option<Arc<CachedPage>> {
        match &self.store {
            Store::Memory(pages) => pages.read().ok()?.get(key).cloned(),
            Store::Disk(dir) => {
                let path = entry_path(dir, key);
                match load_entry(&path) {
                    Ok(Some(page)) if page.url == key => Some(Arc::new(page)),
                    Ok(_) => None,
                    Err(e) => {
                        log::warn!("Ignoring unreadable cache entry {}: {e:#}", path.display());
                        None
                    }
                }
            }
        }
    }

    /// Stores `page` under `key`, replacing any previous entry.
    pub fn put(&self, key: &str, page: Arc<CachedPage>) -> anyhow::Result<()> {
        match &self.store {
            Store::Memory(pages) => {
                pages
                    .write()
                    .map_err(|_| anyhow::anyhow!("Page cache lock poisoned"))?
                    .insert(key.to_string(), page);
            }
            Store::Disk(dir) => {
                write_atomically(&entry_path(dir, key), &serde_json::to_vec(page.as_ref())?)
                    .with_context(|| format!("Couldn't write cache entry for {key}"))?;
            }
        }
        Ok(())
    }

    /// Number of stored entries, counted on disk for a directory cache.
    pub fn len(&self) -> usize {
        match &self.store {
            Store::Memory(pages) => pages.read().map(|p| p.len()).unwrap_or_default(),
            Store::Disk(dir) => fs_err::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
                        .count()
                })
                .unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    let name = hex::encode(Sha256::digest(key.as_bytes()));
    dir.join(format!("{name}.json"))
}

fn load_entry(path: &Path) -> anyhow::Result<Option<CachedPage>> {
    match fs_err::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes a sibling temp file, syncs it then renames it over `path`, so
/// readers see either the old or the new content.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs_err::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(key: &str, body: &str) -> Arc<CachedPage> {
        Arc::new(CachedPage::new(key.into(), 200, Some("text/html".into()), body.into()))
    }

    #[test]
    fn memory_cache_roundtrip() {
        let cache = PageCache::in_memory();
        assert!(cache.get("https://example.org").is_none());

        cache.put("https://example.org", page("https://example.org", "<p>hi</p>")).unwrap();
        let got = cache.get("https://example.org").unwrap();
        assert_eq!(got.content, "<p>hi</p>");
        assert_eq!(got.content_hash.len(), 64);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn disk_cache_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = "https://district.example.org/board?id=4";

        PageCache::on_disk(dir.path())
            .unwrap()
            .put(key, page(key, "board policies"))
            .unwrap();

        let reopened = PageCache::on_disk(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        let got = reopened.get(key).unwrap();
        assert_eq!(got.content, "board policies");
        assert_eq!(got.status, 200);
        assert!(reopened.get("https://district.example.org/board").is_none());
    }

    #[test]
    fn put_overwrites_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::on_disk(dir.path()).unwrap();
        let key = "https://example.org/a";

        cache.put(key, page(key, "old")).unwrap();
        cache.put(key, page(key, "new")).unwrap();

        assert_eq!(cache.get(key).unwrap().content, "new");
        let reopened = PageCache::on_disk(dir.path()).unwrap();
        assert_eq!(reopened.get(key).unwrap().content, "new");
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::on_disk(dir.path()).unwrap();
        let key = "https://example.org/broken";
        std::fs::write(entry_path(dir.path(), key), b"{not json").unwrap();

        assert!(cache.get(key).is_none());
    }

    #[test]
    fn disk_cache_reads_entries_back_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::on_disk(dir.path()).unwrap();
        let key = "https://example.org/handbook";

        cache.put(key, page(key, "student handbook")).unwrap();
        assert_eq!(cache.get(key).unwrap().content, "student handbook");

        // Nothing is held besides the file
        std::fs::remove_file(entry_path(dir.path(), key)).unwrap();
        assert!(cache.get(key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn content_type_detection() {
        assert!(page("k", "").is_html());
        let text = CachedPage::new("k".into(), 200, Some("text/plain".into()), String::new());
        assert!(!text.is_html());
        assert!(is_html_type("application/xhtml+xml; charset=utf-8"));
    }
}
