use crate::core::metrics::{ImageFacts, QualityVector};
use crate::core::similarity::Descriptor;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Index of an image in a [`RecordTable`]. Ids are assigned in path order, so
/// comparing ids compares paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageId(pub usize);

/// One discovered image and its memoized derived values.
///
/// Each derived value is computed at most once; the first result, success or
/// failure, is kept for the rest of the run.
#[derive(Debug)]
pub struct ImageRecord {
    pub id: ImageId,
    pub path: PathBuf,
    facts: OnceLock<Result<ImageFacts, CoreError>>,
    quality: OnceLock<Result<QualityVector, CoreError>>,
    embedding: OnceLock<Result<Arc<Vec<f32>>, CoreError>>,
    regions: OnceLock<Result<Arc<Vec<Vec<f32>>>, CoreError>>,
}

impl ImageRecord {
    fn new(id: ImageId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            facts: OnceLock::new(),
            quality: OnceLock::new(),
            embedding: OnceLock::new(),
            regions: OnceLock::new(),
        }
    }

    pub fn facts_or_init(
        &self,
        init: impl FnOnce() -> Result<ImageFacts, CoreError>,
    ) -> &Result<ImageFacts, CoreError> {
        self.facts.get_or_init(init)
    }

    pub fn quality_or_init(
        &self,
        init: impl FnOnce() -> Result<QualityVector, CoreError>,
    ) -> &Result<QualityVector, CoreError> {
        self.quality.get_or_init(init)
    }

    pub fn embedding_or_init(
        &self,
        init: impl FnOnce() -> Result<Vec<f32>, CoreError>,
    ) -> &Result<Arc<Vec<f32>>, CoreError> {
        self.embedding.get_or_init(|| init().map(Arc::new))
    }

    pub fn regions_or_init(
        &self,
        init: impl FnOnce() -> Result<Vec<Vec<f32>>, CoreError>,
    ) -> &Result<Arc<Vec<Vec<f32>>>, CoreError> {
        self.regions.get_or_init(|| init().map(Arc::new))
    }

    pub fn facts(&self) -> Option<&ImageFacts> {
        self.facts.get().and_then(|r| r.as_ref().ok())
    }

    pub fn quality(&self) -> Option<&QualityVector> {
        self.quality.get().and_then(|r| r.as_ref().ok())
    }

    /// Width and height, `(0, 0)` when the image could not be probed.
    pub fn dimensions(&self) -> (u32, u32) {
        self.facts().map_or((0, 0), |f| (f.width, f.height))
    }

    /// Similarity input, present only when facts and embedding are available.
    /// A failed region computation degrades to embedding-only comparison.
    pub fn descriptor(&self) -> Option<Descriptor> {
        let facts = self.facts()?;
        let embedding = self.embedding.get()?.as_ref().ok()?.clone();
        let regions = self.regions.get().and_then(|r| r.as_ref().ok()).cloned();
        Some(Descriptor {
            width: facts.width,
            height: facts.height,
            embedding,
            regions,
        })
    }

    /// Every failure recorded for this image, in evaluation order.
    pub fn failures(&self) -> Vec<CoreError> {
        let mut out = Vec::new();
        if let Some(Err(e)) = self.facts.get() {
            out.push(e.clone());
        }
        if let Some(Err(e)) = self.quality.get() {
            out.push(e.clone());
        }
        if let Some(Err(e)) = self.embedding.get() {
            out.push(e.clone());
        }
        if let Some(Err(e)) = self.regions.get() {
            out.push(e.clone());
        }
        out.dedup();
        out
    }
}

/// Path-sorted, deduplicated set of records for one run.
#[derive(Debug, Default)]
pub struct RecordTable {
    records: Vec<ImageRecord>,
}

impl RecordTable {
    /// Build the table; relative paths are made absolute against the current
    /// directory without touching the filesystem.
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut paths: Vec<PathBuf> = paths
            .into_iter()
            .map(|p| std::path::absolute(&p).unwrap_or(p))
            .collect();
        paths.sort();
        paths.dedup();

        let records = paths
            .into_iter()
            .enumerate()
            .map(|(i, p)| ImageRecord::new(ImageId(i), p))
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: ImageId) -> &ImageRecord {
        &self.records[id.0]
    }

    pub fn path(&self, id: ImageId) -> &Path {
        &self.records[id.0].path
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn ids(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.records.iter().map(|r| r.id)
    }

    pub fn find(&self, path: &Path) -> Option<ImageId> {
        self.records
            .binary_search_by(|r| r.path.as_path().cmp(path))
            .ok()
            .map(ImageId)
    }
}
