//! Total ordering of group members by quality.
//!
//! Primary metrics are compared in priority order and the first difference
//! beyond epsilon decides. When every primary value ties, the weighted
//! secondary score decides, and after that the path.

use crate::core::grouper::Group;
use crate::core::image::{ImageId, RecordTable};
use crate::core::metrics::{MetricName, QualityVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What happens to members whose quality vector could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailablePolicy {
    #[default]
    RankLast,
    Exclude,
}

/// Why the winner of a group beat the runner-up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Decision {
    Sole,
    Primary { metric: MetricName },
    Secondary,
    PathOrder,
    /// No member had a quality vector
    Unscored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedGroup {
    /// Winner first, then candidates in rank order
    pub order: Vec<ImageId>,
    /// Members dropped by [`UnavailablePolicy::Exclude`]
    pub excluded: Vec<ImageId>,
    pub decision: Option<Decision>,
}

impl RankedGroup {
    pub fn winner(&self) -> Option<ImageId> {
        self.order.first().copied()
    }

    pub fn candidates(&self) -> &[ImageId] {
        self.order.get(1..).unwrap_or(&[])
    }

    pub fn is_singleton(&self) -> bool {
        self.order.len() + self.excluded.len() == 1
    }
}

/// `|a - b| <= epsilon * max(|a|, |b|, 1)`
pub fn nearly_equal(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() <= epsilon * a.abs().max(b.abs()).max(1.0)
}

#[derive(Debug, Clone)]
pub struct Ranker {
    epsilon: f64,
    policy: UnavailablePolicy,
}

impl Ranker {
    pub fn new(epsilon: f64, policy: UnavailablePolicy) -> Self {
        Self { epsilon, policy }
    }

    /// Primary comparison of `a` against `b`, with the deciding metric.
    fn compare_primary(
        &self,
        a: &QualityVector,
        b: &QualityVector,
    ) -> (Ordering, Option<MetricName>) {
        for (x, y) in a.primary.iter().zip(&b.primary) {
            if !nearly_equal(x.value, y.value, self.epsilon) {
                let ord = x.value.partial_cmp(&y.value).unwrap_or(Ordering::Equal);
                return (ord, Some(x.metric));
            }
        }
        (Ordering::Equal, None)
    }

    /// Weighted secondary score of each tied member, each metric min-max
    /// normalized over the tied set. Metrics with no spread contribute 0.
    fn secondary_scores(&self, tied: &[(ImageId, &QualityVector)]) -> Vec<f64> {
        let mut scores = vec![0.0; tied.len()];
        let Some((_, first)) = tied.first() else {
            return scores;
        };
        for (k, weighted) in first.secondary.iter().enumerate() {
            let values: Vec<f64> = tied
                .iter()
                .map(|(_, q)| q.secondary.get(k).map_or(0.0, |w| w.value))
                .collect();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let spread = max - min;
            if spread <= 0.0 || !spread.is_finite() {
                continue;
            }
            for (score, value) in scores.iter_mut().zip(&values) {
                *score += weighted.weight * (value - min) / spread;
            }
        }
        scores
    }

    /// Pick the best of `remaining` and the reason it won.
    fn select_best(
        &self,
        remaining: &[(ImageId, &QualityVector)],
        table: &RecordTable,
    ) -> (usize, Decision) {
        let mut best = 0;
        for (i, (_, q)) in remaining.iter().enumerate().skip(1) {
            if self.compare_primary(q, remaining[best].1).0 == Ordering::Greater {
                best = i;
            }
        }

        let tied: Vec<usize> = (0..remaining.len())
            .filter(|&i| self.compare_primary(remaining[i].1, remaining[best].1).0 == Ordering::Equal)
            .collect();
        if tied.len() == 1 {
            let metric = (0..remaining.len())
                .filter(|&i| i != best)
                .filter_map(|i| self.compare_primary(remaining[best].1, remaining[i].1).1)
                .next();
            return match metric {
                Some(metric) => (best, Decision::Primary { metric }),
                None => (best, Decision::Sole),
            };
        }

        let tied_entries: Vec<(ImageId, &QualityVector)> =
            tied.iter().map(|&i| remaining[i]).collect();
        let scores = self.secondary_scores(&tied_entries);
        let top = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let leaders: Vec<usize> = tied
            .iter()
            .zip(&scores)
            .filter(|(_, s)| nearly_equal(**s, top, self.epsilon))
            .map(|(i, _)| *i)
            .collect();
        let decision = if leaders.len() == 1 {
            Decision::Secondary
        } else {
            Decision::PathOrder
        };
        let winner = leaders
            .into_iter()
            .min_by(|&x, &y| table.path(remaining[x].0).cmp(table.path(remaining[y].0)))
            .unwrap_or(best);
        (winner, decision)
    }

    pub fn rank(&self, group: &Group, table: &RecordTable) -> RankedGroup {
        let mut scored: Vec<(ImageId, &QualityVector)> = Vec::new();
        let mut unscored: Vec<ImageId> = Vec::new();
        for id in &group.members {
            match table.get(*id).quality() {
                Some(q) => scored.push((*id, q)),
                None => unscored.push(*id),
            }
        }
        scored.sort_by(|a, b| table.path(a.0).cmp(table.path(b.0)));
        unscored.sort_by(|a, b| table.path(*a).cmp(table.path(*b)));

        let mut order = Vec::with_capacity(group.members.len());
        let mut decision = None;
        while !scored.is_empty() {
            let (i, why) = self.select_best(&scored, table);
            if order.is_empty() {
                decision = Some(why);
            }
            order.push(scored.remove(i).0);
        }
        if order.len() == 1 && unscored.is_empty() {
            decision = Some(Decision::Sole);
        }

        let excluded = match self.policy {
            UnavailablePolicy::RankLast => {
                if order.is_empty() && !unscored.is_empty() {
                    decision = Some(Decision::Unscored);
                }
                order.extend(unscored);
                Vec::new()
            }
            UnavailablePolicy::Exclude => unscored,
        };

        RankedGroup {
            order,
            excluded,
            decision,
        }
    }

    /// Rank every group in parallel; output order matches `groups`.
    pub fn rank_all(&self, groups: &[Group], table: &RecordTable) -> Vec<RankedGroup> {
        groups.par_iter().map(|g| self.rank(g, table)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metrics::{MetricValue, WeightedValue};
    use crate::error::CoreError;
    use std::path::PathBuf;

    fn quality(primary: &[(MetricName, f64)], secondary: &[(MetricName, f64, f64)]) -> QualityVector {
        QualityVector {
            primary: primary
                .iter()
                .map(|&(metric, value)| MetricValue { metric, value })
                .collect(),
            secondary: secondary
                .iter()
                .map(|&(metric, value, weight)| WeightedValue {
                    metric,
                    value,
                    weight,
                })
                .collect(),
        }
    }

    fn table(entries: Vec<(&str, Option<QualityVector>)>) -> (RecordTable, Group) {
        let table = RecordTable::new(entries.iter().map(|(p, _)| PathBuf::from(p)));
        for (path, q) in entries {
            let id = table.find(&PathBuf::from(path)).unwrap();
            table.get(id).quality_or_init(|| {
                q.ok_or_else(|| CoreError::metric_unavailable(path, "timed out"))
            });
        }
        let group = Group {
            members: table.ids().collect(),
        };
        (table, group)
    }

    #[test]
    fn test_highest_resolution_wins() {
        let (table, group) = table(vec![
            ("/in/a.jpg", Some(quality(&[(MetricName::Resolution, 1920.0 * 1080.0)], &[]))),
            ("/in/b.jpg", Some(quality(&[(MetricName::Resolution, 3840.0 * 2160.0)], &[]))),
            ("/in/c.jpg", Some(quality(&[(MetricName::Resolution, 1920.0 * 1080.0)], &[]))),
        ]);
        let ranked = Ranker::new(1e-9, UnavailablePolicy::RankLast).rank(&group, &table);
        assert_eq!(table.path(ranked.winner().unwrap()), PathBuf::from("/in/b.jpg"));
        assert_eq!(
            ranked.decision,
            Some(Decision::Primary {
                metric: MetricName::Resolution
            })
        );
        // a and c tie: path order
        assert_eq!(ranked.candidates(), &[ImageId(0), ImageId(2)]);
    }

    #[test]
    fn test_lower_priority_metric_cannot_override() {
        let (table, group) = table(vec![
            (
                "/in/a.jpg",
                Some(quality(
                    &[(MetricName::Dimensions, 2000.0), (MetricName::Filesize, 1.0)],
                    &[],
                )),
            ),
            (
                "/in/b.jpg",
                Some(quality(
                    &[(MetricName::Dimensions, 1000.0), (MetricName::Filesize, 1e12)],
                    &[],
                )),
            ),
        ]);
        let ranked = Ranker::new(1e-9, UnavailablePolicy::RankLast).rank(&group, &table);
        assert_eq!(ranked.winner(), Some(ImageId(0)));
    }

    #[test]
    fn test_secondary_breaks_primary_tie() {
        let (table, group) = table(vec![
            (
                "/in/a.jpg",
                Some(quality(
                    &[(MetricName::Dimensions, 1000.0)],
                    &[(MetricName::Sharpness, 0.2, 1.0), (MetricName::Noise, 0.9, 0.1)],
                )),
            ),
            (
                "/in/b.jpg",
                Some(quality(
                    &[(MetricName::Dimensions, 1000.0 + 1e-10)],
                    &[(MetricName::Sharpness, 0.8, 1.0), (MetricName::Noise, 0.1, 0.1)],
                )),
            ),
        ]);
        let ranked = Ranker::new(1e-9, UnavailablePolicy::RankLast).rank(&group, &table);
        assert_eq!(ranked.winner(), Some(ImageId(1)));
        assert_eq!(ranked.decision, Some(Decision::Secondary));
    }

    #[test]
    fn test_full_tie_falls_back_to_path() {
        let q = quality(&[(MetricName::Resolution, 100.0)], &[(MetricName::Sharpness, 0.5, 1.0)]);
        let (table, group) = table(vec![
            ("/in/z.jpg", Some(q.clone())),
            ("/in/m.jpg", Some(q.clone())),
            ("/in/a.jpg", Some(q)),
        ]);
        let ranker = Ranker::new(1e-9, UnavailablePolicy::RankLast);
        let first = ranker.rank(&group, &table);
        assert_eq!(table.path(first.winner().unwrap()), PathBuf::from("/in/a.jpg"));
        assert_eq!(first.decision, Some(Decision::PathOrder));
        assert_eq!(first, ranker.rank(&group, &table));
    }

    #[test]
    fn test_unavailable_policies() {
        let entries = || {
            vec![
                ("/in/a.jpg", None),
                ("/in/b.jpg", Some(quality(&[(MetricName::Resolution, 1.0)], &[]))),
            ]
        };
        let (table_a, group_a) = table(entries());
        let ranked = Ranker::new(1e-9, UnavailablePolicy::RankLast).rank(&group_a, &table_a);
        assert_eq!(ranked.order, vec![ImageId(1), ImageId(0)]);
        assert!(ranked.excluded.is_empty());

        let (table_b, group_b) = table(entries());
        let ranked = Ranker::new(1e-9, UnavailablePolicy::Exclude).rank(&group_b, &table_b);
        assert_eq!(ranked.order, vec![ImageId(1)]);
        assert_eq!(ranked.excluded, vec![ImageId(0)]);
    }

    #[test]
    fn test_singleton_group() {
        let (table, group) = table(vec![(
            "/in/a.jpg",
            Some(quality(&[(MetricName::Resolution, 1.0)], &[])),
        )]);
        let ranked = Ranker::new(1e-9, UnavailablePolicy::RankLast).rank(&group, &table);
        assert_eq!(ranked.winner(), Some(ImageId(0)));
        assert!(ranked.candidates().is_empty());
        assert_eq!(ranked.decision, Some(Decision::Sole));
    }

    #[test]
    fn test_nearly_equal_is_relative() {
        assert!(nearly_equal(1e12, 1e12 + 1.0, 1e-9));
        assert!(!nearly_equal(1.0, 1.1, 1e-9));
        assert!(nearly_equal(0.0, 1e-10, 1e-9));
    }
}
