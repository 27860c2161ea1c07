use crate::core::metrics::{ImageFacts, MetricName, MetricProvider};
use crate::error::CoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

pub const CACHE_FILE: &str = ".embedding_cache.json";

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    size: u64,
    modified_nanos: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regions: Option<Vec<Vec<f32>>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: BTreeMap<PathBuf, CacheEntry>,
}

/// File identity used to invalidate cached descriptors.
fn fingerprint(path: &Path) -> Option<(u64, u128)> {
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
    Some((metadata.len(), modified.as_nanos()))
}

/// Decorator persisting embeddings and region descriptors across runs,
/// keyed by path and invalidated when size or mtime changes.
pub struct CachedProvider {
    inner: Arc<dyn MetricProvider>,
    file: PathBuf,
    entries: Mutex<BTreeMap<PathBuf, CacheEntry>>,
    dirty: Mutex<bool>,
}

impl CachedProvider {
    /// Load `file` if it exists. An unreadable or outdated cache starts empty.
    pub fn open(inner: Arc<dyn MetricProvider>, file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let entries = match fs::read_to_string(&file) {
            Ok(text) => match serde_json::from_str::<CacheFile>(&text) {
                Ok(cache) if cache.version == CACHE_VERSION => {
                    log::debug!("Loaded {} cached descriptors", cache.entries.len());
                    cache.entries
                }
                Ok(_) => {
                    log::info!("Ignoring cache with old format at {}", file.display());
                    BTreeMap::new()
                }
                Err(e) => {
                    log::warn!("Ignoring corrupt cache {}: {}", file.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            inner,
            file,
            entries: Mutex::new(entries),
            dirty: Mutex::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn lookup<T>(&self, path: &Path, get: impl Fn(&CacheEntry) -> Option<T>) -> Option<T> {
        let (size, modified_nanos) = fingerprint(path)?;
        let entries = self.entries.lock();
        let entry = entries.get(path)?;
        if entry.size != size || entry.modified_nanos != modified_nanos {
            return None;
        }
        get(entry)
    }

    fn store(&self, path: &Path, update: impl FnOnce(&mut CacheEntry)) {
        let Some((size, modified_nanos)) = fingerprint(path) else {
            return;
        };
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(path.to_path_buf())
            .or_insert_with(|| CacheEntry {
                size,
                modified_nanos,
                embedding: None,
                regions: None,
            });
        if entry.size != size || entry.modified_nanos != modified_nanos {
            *entry = CacheEntry {
                size,
                modified_nanos,
                embedding: None,
                regions: None,
            };
        }
        update(entry);
        *self.dirty.lock() = true;
    }

    /// Write the cache if anything changed, through a temp file and rename.
    pub fn save(&self) -> anyhow::Result<()> {
        if !*self.dirty.lock() {
            return Ok(());
        }
        let cache = CacheFile {
            version: CACHE_VERSION,
            entries: self.entries.lock().clone(),
        };
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.file.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&cache)?)?;
        fs::rename(&tmp, &self.file)?;
        *self.dirty.lock() = false;
        log::debug!("Saved {} cached descriptors to {}", cache.entries.len(), self.file.display());
        Ok(())
    }
}

impl MetricProvider for CachedProvider {
    fn probe(&self, path: &Path) -> Result<ImageFacts, CoreError> {
        self.inner.probe(path)
    }

    fn measure(&self, path: &Path, metrics: &[MetricName]) -> Result<Vec<f64>, CoreError> {
        self.inner.measure(path, metrics)
    }

    fn embedding(&self, path: &Path) -> Result<Vec<f32>, CoreError> {
        if let Some(hit) = self.lookup(path, |e| e.embedding.clone()) {
            return Ok(hit);
        }
        let embedding = self.inner.embedding(path)?;
        self.store(path, |e| e.embedding = Some(embedding.clone()));
        Ok(embedding)
    }

    fn regions(&self, path: &Path, count: usize) -> Result<Vec<Vec<f32>>, CoreError> {
        let hit = self.lookup(path, |e| {
            e.regions
                .as_ref()
                .filter(|r| r.len() >= count)
                .map(|r| r[..count].to_vec())
        });
        if let Some(hit) = hit {
            return Ok(hit);
        }
        let regions = self.inner.regions(path, count)?;
        self.store(path, |e| e.regions = Some(regions.clone()));
        Ok(regions)
    }

    fn content_hash(&self, path: &Path) -> Result<String, CoreError> {
        self.inner.content_hash(path)
    }
}
