//! Pairwise image similarity from global embeddings and localized regions.
//!
//! Scores live in `[0, 1]`. The global embedding catches re-encodes, resizes
//! and light crops; region descriptors catch partial overlaps such as an image
//! composited into another one.

use crate::core::image::ImageId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Images with less area than this never match anything.
pub const MIN_AREA: u64 = 16;

/// Everything the engine needs to know about one image.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub width: u32,
    pub height: u32,
    pub embedding: Arc<Vec<f32>>,
    pub regions: Option<Arc<Vec<Vec<f32>>>>,
}

impl Descriptor {
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0 || (self.width as u64 * self.height as u64) < MIN_AREA
    }
}

/// How embedding and region scores combine into one score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum BlendRule {
    /// Either signal alone is enough evidence
    Max,
    /// `w * embedding + (1 - w) * region`
    Weighted { embedding_weight: f64 },
    EmbeddingOnly,
    RegionOnly,
}

impl Default for BlendRule {
    fn default() -> Self {
        BlendRule::Max
    }
}

impl fmt::Display for BlendRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlendRule::Max => f.write_str("max"),
            BlendRule::Weighted { embedding_weight } => write!(f, "weighted:{embedding_weight}"),
            BlendRule::EmbeddingOnly => f.write_str("embedding_only"),
            BlendRule::RegionOnly => f.write_str("region_only"),
        }
    }
}

impl FromStr for BlendRule {
    type Err = String;

    /// Accepts `max`, `embedding_only`, `region_only` and `weighted:<w>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "max" => Ok(BlendRule::Max),
            "embedding_only" => Ok(BlendRule::EmbeddingOnly),
            "region_only" => Ok(BlendRule::RegionOnly),
            other => {
                let weight = other
                    .strip_prefix("weighted:")
                    .ok_or_else(|| format!("unknown blend rule `{other}`"))?;
                let embedding_weight: f64 = weight
                    .parse()
                    .map_err(|_| format!("invalid blend weight `{weight}`"))?;
                Ok(BlendRule::Weighted { embedding_weight })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMethod {
    Embedding,
    Region,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub score: f64,
    pub method: SimilarityMethod,
}

/// Undirected edge; `a < b` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub a: ImageId,
    pub b: ImageId,
    pub score: f64,
    pub method: SimilarityMethod,
}

impl SimilarityEdge {
    pub fn new(x: ImageId, y: ImageId, similarity: Similarity) -> Self {
        let (a, b) = if x <= y { (x, y) } else { (y, x) };
        Self {
            a,
            b,
            score: similarity.score,
            method: similarity.method,
        }
    }
}

/// Cosine similarity clamped to `[0, 1]`; mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Mean over `from` of each region's best match in `to`.
fn directed_region_score(from: &[Vec<f32>], to: &[Vec<f32>]) -> f64 {
    let total: f64 = from
        .iter()
        .map(|r| {
            to.iter()
                .map(|s| cosine_similarity(r, s))
                .fold(0.0, f64::max)
        })
        .sum();
    total / from.len() as f64
}

/// Best-matching-region average, taken in whichever direction matches better
/// so the result does not depend on argument order.
pub fn region_similarity(a: &[Vec<f32>], b: &[Vec<f32>]) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some(directed_region_score(a, b).max(directed_region_score(b, a)))
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityEngine {
    blend: BlendRule,
}

impl SimilarityEngine {
    pub fn new(blend: BlendRule) -> Self {
        Self { blend }
    }

    pub fn blend(&self) -> BlendRule {
        self.blend
    }

    pub fn similarity(&self, a: &Descriptor, b: &Descriptor) -> Similarity {
        if a.is_degenerate() || b.is_degenerate() {
            return Similarity {
                score: 0.0,
                method: SimilarityMethod::Embedding,
            };
        }

        let embedding = cosine_similarity(&a.embedding, &b.embedding);
        let region = match (&a.regions, &b.regions) {
            (Some(ra), Some(rb)) => region_similarity(ra, rb),
            _ => None,
        };
        let Some(region) = region else {
            return Similarity {
                score: embedding,
                method: SimilarityMethod::Embedding,
            };
        };

        let (score, method) = match self.blend {
            BlendRule::Max if region > embedding => (region, SimilarityMethod::Region),
            BlendRule::Max => (embedding, SimilarityMethod::Embedding),
            BlendRule::Weighted { embedding_weight } => (
                embedding_weight * embedding + (1.0 - embedding_weight) * region,
                SimilarityMethod::Combined,
            ),
            BlendRule::EmbeddingOnly => (embedding, SimilarityMethod::Embedding),
            BlendRule::RegionOnly => (region, SimilarityMethod::Region),
        };
        Similarity {
            score: score.clamp(0.0, 1.0),
            method,
        }
    }

    /// Candidates scoring at or above `threshold`, in candidate order.
    pub fn find_neighbors(
        &self,
        image: &Descriptor,
        candidates: &[(ImageId, Descriptor)],
        threshold: f64,
    ) -> Vec<(ImageId, f64)> {
        candidates
            .iter()
            .filter_map(|(id, candidate)| {
                let s = self.similarity(image, candidate);
                (s.score >= threshold).then_some((*id, s.score))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(embedding: Vec<f32>, regions: Option<Vec<Vec<f32>>>) -> Descriptor {
        Descriptor {
            width: 100,
            height: 100,
            embedding: Arc::new(embedding),
            regions: regions.map(Arc::new),
        }
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_region_similarity_is_symmetric() {
        let inset = vec![vec![1.0, 0.0]];
        let composite = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.0, 1.0]];
        let ab = region_similarity(&inset, &composite).unwrap();
        let ba = region_similarity(&composite, &inset).unwrap();
        assert_eq!(ab, ba);
        assert!((ab - 1.0).abs() < 1e-12);
        assert_eq!(region_similarity(&[], &composite), None);
    }

    #[test]
    fn test_max_blend_picks_stronger_signal() {
        let engine = SimilarityEngine::new(BlendRule::Max);
        let a = descriptor(vec![1.0, 0.0], Some(vec![vec![0.0, 1.0]]));
        let b = descriptor(vec![0.0, 1.0], Some(vec![vec![0.0, 1.0]]));
        let s = engine.similarity(&a, &b);
        assert_eq!(s.method, SimilarityMethod::Region);
        assert!((s.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_blend() {
        let engine = SimilarityEngine::new(BlendRule::Weighted {
            embedding_weight: 0.25,
        });
        let a = descriptor(vec![1.0, 0.0], Some(vec![vec![0.0, 1.0]]));
        let b = descriptor(vec![0.0, 1.0], Some(vec![vec![0.0, 1.0]]));
        let s = engine.similarity(&a, &b);
        assert_eq!(s.method, SimilarityMethod::Combined);
        assert!((s.score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_missing_regions_fall_back_to_embedding() {
        let engine = SimilarityEngine::new(BlendRule::RegionOnly);
        let a = descriptor(vec![1.0, 0.0], None);
        let b = descriptor(vec![1.0, 0.0], Some(vec![vec![0.0, 1.0]]));
        let s = engine.similarity(&a, &b);
        assert_eq!(s.method, SimilarityMethod::Embedding);
        assert!((s.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_dimensions_score_zero() {
        let engine = SimilarityEngine::default();
        let mut a = descriptor(vec![1.0, 0.0], None);
        a.width = 0;
        let b = descriptor(vec![1.0, 0.0], None);
        assert_eq!(engine.similarity(&a, &b).score, 0.0);
    }

    #[test]
    fn test_find_neighbors_applies_threshold() {
        let engine = SimilarityEngine::default();
        let probe = descriptor(vec![1.0, 0.0], None);
        let candidates = vec![
            (ImageId(1), descriptor(vec![1.0, 0.1], None)),
            (ImageId(2), descriptor(vec![0.0, 1.0], None)),
        ];
        let neighbors = engine.find_neighbors(&probe, &candidates, 0.9);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, ImageId(1));
    }

    #[test]
    fn test_blend_rule_parsing() {
        assert_eq!("max".parse::<BlendRule>().unwrap(), BlendRule::Max);
        assert_eq!(
            "weighted:0.7".parse::<BlendRule>().unwrap(),
            BlendRule::Weighted {
                embedding_weight: 0.7
            }
        );
        assert!("average".parse::<BlendRule>().is_err());
    }
}
