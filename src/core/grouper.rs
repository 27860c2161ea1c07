//! Near-duplicate grouping: connected components over the similarity graph.

use crate::core::image::ImageId;
use crate::core::similarity::{Descriptor, SimilarityEdge, SimilarityEngine};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Bits per LSH band.
const BAND_BITS: usize = 8;

/// Images connected directly or transitively by edges at or above threshold.
/// Members are sorted by id, which is path order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub members: Vec<ImageId>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupingResult {
    pub groups: Vec<Group>,
    pub edges: Vec<SimilarityEdge>,
    /// Pairs actually scored; equals n(n-1)/2 without the pre-filter
    pub pairs_scored: usize,
}

/// Disjoint-set forest with path compression and union by rank.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = i;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, i: usize, j: usize) {
        let (pi, pj) = (self.find(i), self.find(j));
        if pi == pj {
            return;
        }
        if self.rank[pi] < self.rank[pj] {
            self.parent[pi] = pj;
        } else if self.rank[pi] > self.rank[pj] {
            self.parent[pj] = pi;
        } else {
            self.parent[pj] = pi;
            self.rank[pi] += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Grouper {
    engine: SimilarityEngine,
    threshold: f64,
    prefilter_min_images: usize,
}

impl Grouper {
    pub fn new(engine: SimilarityEngine, threshold: f64, prefilter_min_images: usize) -> Self {
        Self {
            engine,
            threshold,
            prefilter_min_images,
        }
    }

    /// Partition `images` into groups.
    ///
    /// Images without a descriptor (unreadable, timed out) never get an edge
    /// and end up as singletons. The result does not depend on input order.
    pub fn group(&self, images: &[(ImageId, Option<Descriptor>)]) -> GroupingResult {
        let mut images: Vec<&(ImageId, Option<Descriptor>)> = images.iter().collect();
        images.sort_by_key(|(id, _)| *id);
        images.dedup_by_key(|(id, _)| *id);

        let described: Vec<(usize, &Descriptor)> = images
            .iter()
            .enumerate()
            .filter_map(|(i, (_, d))| d.as_ref().map(|d| (i, d)))
            .collect();

        let pairs = if described.len() >= self.prefilter_min_images {
            candidate_pairs(&described)
        } else {
            all_pairs(described.len())
        };
        log::debug!(
            "Scoring {} candidate pairs among {} images",
            pairs.len(),
            described.len()
        );

        let edges: Vec<(usize, usize, SimilarityEdge)> = pairs
            .par_iter()
            .filter_map(|&(x, y)| {
                let (ix, dx) = described[x];
                let (iy, dy) = described[y];
                let similarity = self.engine.similarity(dx, dy);
                (similarity.score >= self.threshold).then(|| {
                    (
                        ix,
                        iy,
                        SimilarityEdge::new(images[ix].0, images[iy].0, similarity),
                    )
                })
            })
            .collect();

        let mut forest = UnionFind::new(images.len());
        for (ix, iy, _) in &edges {
            forest.union(*ix, *iy);
        }

        let mut components: BTreeMap<usize, Vec<ImageId>> = BTreeMap::new();
        for (i, (id, _)) in images.iter().enumerate() {
            components.entry(forest.find(i)).or_default().push(*id);
        }
        let mut groups: Vec<Group> = components
            .into_values()
            .map(|members| Group { members })
            .collect();
        groups.sort_by_key(|g| g.members[0]);

        GroupingResult {
            groups,
            edges: edges.into_iter().map(|(_, _, e)| e).collect(),
            pairs_scored: pairs.len(),
        }
    }
}

fn all_pairs(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|x| (x + 1..n).map(move |y| (x, y)))
        .collect()
}

/// Sign bits of `v` relative to its mean, packed into bands.
fn band_keys(v: &[f32]) -> Vec<u64> {
    if v.is_empty() {
        return Vec::new();
    }
    let mean = v.iter().map(|x| *x as f64).sum::<f64>() / v.len() as f64;
    v.chunks(BAND_BITS)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u64, |acc, (bit, x)| {
                    if *x as f64 > mean { acc | (1 << bit) } else { acc }
                })
        })
        .collect()
}

/// Pairs sharing at least one LSH bucket, on the embedding or any region.
fn candidate_pairs(described: &[(usize, &Descriptor)]) -> Vec<(usize, usize)> {
    // (source tag, band index, band bits) -> positions in `described`
    let mut buckets: BTreeMap<(u8, usize, u64), Vec<usize>> = BTreeMap::new();
    for (pos, (_, descriptor)) in described.iter().enumerate() {
        for (band, key) in band_keys(&descriptor.embedding).into_iter().enumerate() {
            buckets.entry((0, band, key)).or_default().push(pos);
        }
        if let Some(regions) = &descriptor.regions {
            for region in regions.iter() {
                for (band, key) in band_keys(region).into_iter().enumerate() {
                    buckets.entry((1, band, key)).or_default().push(pos);
                }
            }
        }
    }

    let mut pairs = BTreeSet::new();
    for members in buckets.values_mut() {
        members.dedup();
        for (i, &x) in members.iter().enumerate() {
            for &y in &members[i + 1..] {
                pairs.insert((x.min(y), x.max(y)));
            }
        }
    }
    pairs.into_iter().collect()
}
