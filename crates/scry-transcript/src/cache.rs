use crate::view::{parse_transcript, TranscriptView};
use lru::LruCache;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Transcripts kept parsed at once; the least recently read is evicted first.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

#[derive(Clone)]
struct CacheEntry {
    modified: SystemTime,
    len: u64,
    view: Arc<TranscriptView>,
}

/// Parsed transcript views keyed by path, reused until the file's mtime or size changes.
pub struct TranscriptCache {
    entries: Mutex<LruCache<PathBuf, CacheEntry>>,
}

impl Default for TranscriptCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl TranscriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_parse(&self, path: impl AsRef<Path>) -> Option<Arc<TranscriptView>> {
        let path = path.as_ref();
        let Ok(metadata) = fs::metadata(path) else {
            self.forget(path);
            return None;
        };
        let modified = metadata.modified().ok()?;
        let len = metadata.len();

        if let Some(entry) = self.lock().get(path) {
            if entry.modified == modified && entry.len == len {
                return Some(Arc::clone(&entry.view));
            }
        }

        let view = Arc::new(parse_transcript(path)?);
        self.lock().put(
            path.to_path_buf(),
            CacheEntry {
                modified,
                len,
                view: Arc::clone(&view),
            },
        );
        Some(view)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, path: &Path) {
        self.lock().pop(path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<PathBuf, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
