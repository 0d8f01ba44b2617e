//! Knowledge corpus cache
//!
//! Precomputed domain knowledge lives in one plain-text file per topic tag.
//! Each tag is read and normalized on first use, then kept for the process
//! lifetime. Concurrent first requests for a tag share a single read.

use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use regex_lite::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));
static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n[ \t]*\r?\n").expect("static regex"));

/// Normalized knowledge for one topic tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RagSnippetSet {
    pub domain_tag: String,
    pub text_blob: String,
    /// Number of paragraphs kept after normalization
    pub entries: usize,
}

/// Where raw corpus text comes from
#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// `None` when the tag has no backing resource
    async fn read(&self, domain_tag: &str) -> Result<Option<String>>;
}

/// Reads `<root>/<tag>.txt`
pub struct FileCorpusSource {
    root: PathBuf,
}

impl FileCorpusSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl CorpusSource for FileCorpusSource {
    async fn read(&self, domain_tag: &str) -> Result<Option<String>> {
        let path = self.root.join(format!("{}.txt", domain_tag));
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Storage {
                message: format!("Failed to read corpus {}: {}", path.display(), e),
            }),
        }
    }
}

/// Remove the reserved `|` and `?>` delimiters, collapse whitespace inside
/// each paragraph, drop empty paragraphs.
pub fn normalize_corpus(raw: &str) -> (String, usize) {
    let entries: Vec<String> = PARAGRAPH_BREAK
        .split(raw)
        .map(|paragraph| {
            let mut stripped = paragraph.replace('|', "");
            while stripped.contains("?>") {
                stripped = stripped.replace("?>", "");
            }
            WHITESPACE.replace_all(&stripped, " ").trim().to_string()
        })
        .filter(|entry| !entry.is_empty())
        .collect();

    let count = entries.len();
    (entries.join("\n\n"), count)
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 64
        && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

type Slot = Arc<OnceCell<Arc<RagSnippetSet>>>;

/// Process-lifetime cache of corpus snippets keyed by domain tag
pub struct KnowledgeCorpusCache {
    source: Arc<dyn CorpusSource>,
    slots: Mutex<HashMap<String, Slot>>,
    reads: AtomicUsize,
}

impl KnowledgeCorpusCache {
    pub fn new(source: Arc<dyn CorpusSource>) -> Self {
        Self {
            source,
            slots: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// Cache over `<root>/<tag>.txt` files
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileCorpusSource::new(root)))
    }

    /// Return the snippets for `domain_tag`, loading them on first use.
    /// Missing tags are not cached, so a file added later is picked up.
    pub async fn get(&self, domain_tag: &str) -> Result<Arc<RagSnippetSet>> {
        if !valid_tag(domain_tag) {
            return Err(AppError::CorpusNotFound {
                tag: domain_tag.to_string(),
            });
        }

        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(domain_tag.to_string()).or_default().clone()
        };

        if let Some(cached) = slot.get() {
            metrics::record_cache(true, "knowledge_corpus");
            debug!(tag = domain_tag, "Corpus cache hit");
            return Ok(cached.clone());
        }

        let loaded = match slot
            .get_or_try_init(|| async {
                metrics::record_cache(false, "knowledge_corpus");
                self.reads.fetch_add(1, Ordering::SeqCst);
                let raw = self.source.read(domain_tag).await?.ok_or_else(|| AppError::CorpusNotFound {
                    tag: domain_tag.to_string(),
                })?;
                let (text_blob, entries) = normalize_corpus(&raw);
                info!(tag = domain_tag, entries, bytes = text_blob.len(), "Knowledge corpus loaded");
                Ok::<_, AppError>(Arc::new(RagSnippetSet {
                    domain_tag: domain_tag.to_string(),
                    text_blob,
                    entries,
                }))
            })
            .await
        {
            Ok(loaded) => loaded,
            Err(e) => {
                self.evict_empty(domain_tag, &slot).await;
                return Err(e);
            }
        };

        Ok(loaded.clone())
    }

    /// Drop a slot whose load failed so misses do not accumulate
    async fn evict_empty(&self, domain_tag: &str, slot: &Slot) {
        let mut slots = self.slots.lock().await;
        let stale = slots
            .get(domain_tag)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if stale {
            slots.remove(domain_tag);
        }
    }

    /// Number of tags currently holding a cache slot
    pub async fn cached_tags(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Number of backing reads attempted so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Counts reads per tag and serves fixed text
    struct CountingSource {
        texts: HashMap<String, String>,
        reads: std::sync::Mutex<HashMap<String, usize>>,
        delay: Duration,
    }

    impl CountingSource {
        fn new(texts: &[(&str, &str)]) -> Self {
            Self {
                texts: texts.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                reads: Default::default(),
                delay: Duration::ZERO,
            }
        }

        fn reads_of(&self, tag: &str) -> usize {
            self.reads.lock().unwrap().get(tag).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl CorpusSource for CountingSource {
        async fn read(&self, tag: &str) -> Result<Option<String>> {
            *self.reads.lock().unwrap().entry(tag.to_string()).or_default() += 1;
            tokio::time::sleep(self.delay).await;
            Ok(self.texts.get(tag).cloned())
        }
    }

    #[test]
    fn test_normalize_strips_delimiters_and_collapses_whitespace() {
        let raw = "Taxa  pe clădiri |se plătește\tanual.?>\n\n\n   \n\nScutiri:\n  veterani |  persoane   cu handicap\n";
        let (blob, entries) = normalize_corpus(raw);

        assert_eq!(entries, 2);
        assert_eq!(
            blob,
            "Taxa pe clădiri se plătește anual.\n\nScutiri: veterani persoane cu handicap"
        );
        assert!(!blob.contains('|'));
        assert!(!blob.contains("?>"));

        for raw in ["cerere ?|> depusa", "cerere ??>> depusa", "cerere ?|?>> depusa"] {
            let (blob, _) = normalize_corpus(raw);
            assert_eq!(blob, "cerere depusa", "input {raw:?}");
        }
    }

    #[tokio::test]
    async fn test_get_is_idempotent_and_reads_once() {
        let source = Arc::new(CountingSource::new(&[("impozite", "Impozit  pe | locuință")]));
        let cache = KnowledgeCorpusCache::new(source.clone());

        let first = cache.get("impozite").await.unwrap();
        let second = cache.get("impozite").await.unwrap();

        assert_eq!(first.text_blob, second.text_blob);
        assert_eq!(first.text_blob, "Impozit pe locuință");
        assert_eq!(source.reads_of("impozite"), 1);
        assert_eq!(cache.reads(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_one_read() {
        let mut source = CountingSource::new(&[("transport", "Abonament STPT")]);
        source.delay = Duration::from_millis(20);
        let source = Arc::new(source);
        let cache = Arc::new(KnowledgeCorpusCache::new(source.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("transport").await.map(|s| s.text_blob.clone()) })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "Abonament STPT");
        }
        assert_eq!(source.reads_of("transport"), 1);
    }

    #[tokio::test]
    async fn test_missing_tag_is_corpus_not_found() {
        let cache = KnowledgeCorpusCache::new(Arc::new(CountingSource::new(&[])));

        let err = cache.get("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::CorpusNotFound { ref tag } if tag == "ghost"));

        let err = cache.get("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, AppError::CorpusNotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_tags_do_not_accumulate_slots() {
        let cache = KnowledgeCorpusCache::new(Arc::new(CountingSource::new(&[("impozite", "Taxe locale")])));

        for i in 0..200 {
            assert!(cache.get(&format!("missing{i}")).await.is_err());
        }
        assert_eq!(cache.cached_tags().await, 0);

        cache.get("impozite").await.unwrap();
        assert!(cache.get("missing0").await.is_err());
        assert_eq!(cache.cached_tags().await, 1);
    }

    #[tokio::test]
    async fn test_file_source_reads_tag_files() {
        let dir = std::env::temp_dir().join(format!("civica-rag-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("apa.txt"), "Aquatim |  contract\n\nFacturare lunară").unwrap();

        let cache = KnowledgeCorpusCache::from_dir(&dir);
        let set = cache.get("apa").await.unwrap();
        assert_eq!(set.entries, 2);
        assert_eq!(set.text_blob, "Aquatim contract\n\nFacturare lunară");

        std::fs::remove_dir_all(&dir).ok();
    }
}
