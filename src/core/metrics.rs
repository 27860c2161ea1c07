//! Quality metrics and the evaluator that turns them into a quality vector.
//!
//! Raw metric values come from a `MetricProvider`; the evaluator only decides
//! which values are requested, in which role, and applies date preferences.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    /// Shorter side in pixels
    Dimensions,
    /// Total pixel count
    Resolution,
    Filesize,
    FormatQuality,
    ModifiedDate,
    CreatedDate,
    Sharpness,
    Exposure,
    /// Inverse noise estimate, higher means cleaner
    Noise,
}

impl MetricName {
    pub const ALL: [MetricName; 9] = [
        MetricName::Dimensions,
        MetricName::Resolution,
        MetricName::Filesize,
        MetricName::FormatQuality,
        MetricName::ModifiedDate,
        MetricName::CreatedDate,
        MetricName::Sharpness,
        MetricName::Exposure,
        MetricName::Noise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Dimensions => "dimensions",
            MetricName::Resolution => "resolution",
            MetricName::Filesize => "filesize",
            MetricName::FormatQuality => "format_quality",
            MetricName::ModifiedDate => "modified_date",
            MetricName::CreatedDate => "created_date",
            MetricName::Sharpness => "sharpness",
            MetricName::Exposure => "exposure",
            MetricName::Noise => "noise",
        }
    }

    pub fn is_date(&self) -> bool {
        matches!(self, MetricName::ModifiedDate | MetricName::CreatedDate)
    }

    /// Metrics that need decoded pixels rather than file facts.
    pub fn needs_pixels(&self) -> bool {
        matches!(
            self,
            MetricName::Sharpness | MetricName::Exposure | MetricName::Noise
        )
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePreference {
    #[default]
    Newest,
    Oldest,
}

/// Cheap file facts every image gets before any pixel work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFacts {
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub modified: SystemTime,
    pub created: Option<SystemTime>,
}

impl ImageFacts {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Source of every per-image number the core consumes.
///
/// Implementations may be backed by any decoder or model runtime. Values must
/// be finite; embeddings and region descriptors of one provider must share a
/// fixed length.
pub trait MetricProvider: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ImageFacts, CoreError>;

    /// Values for pixel-based metrics, in the order requested.
    fn measure(&self, path: &Path, metrics: &[MetricName]) -> Result<Vec<f64>, CoreError>;

    fn embedding(&self, path: &Path) -> Result<Vec<f32>, CoreError>;

    /// Descriptors for the first `count` regions of the image.
    fn regions(&self, path: &Path, count: usize) -> Result<Vec<Vec<f32>>, CoreError>;

    /// Short content hash used to disambiguate colliding filenames.
    fn content_hash(&self, path: &Path) -> Result<String, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub metric: MetricName,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedValue {
    pub metric: MetricName,
    pub value: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityVector {
    /// Compared element-wise in priority order
    pub primary: Vec<MetricValue>,
    /// Combined by weight, only consulted when every primary value ties
    pub secondary: Vec<WeightedValue>,
}

/// File-extension ranking used by `format_quality`.
pub fn format_quality(path: &Path) -> f64 {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => 100.0,
        "tiff" | "tif" => 95.0,
        "bmp" => 90.0,
        "webp" => 85.0,
        "jp2" => 80.0,
        "heif" | "heic" => 77.0,
        "jpg" | "jpeg" => 75.0,
        "gif" => 60.0,
        _ => 0.0,
    }
}

fn epoch_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Value of a metric derivable from file facts alone, before date preference.
pub fn fact_value(metric: MetricName, path: &Path, facts: &ImageFacts) -> Option<f64> {
    match metric {
        MetricName::Dimensions => Some(facts.width.min(facts.height) as f64),
        MetricName::Resolution => Some(facts.area() as f64),
        MetricName::Filesize => Some(facts.size_bytes as f64),
        MetricName::FormatQuality => Some(format_quality(path)),
        MetricName::ModifiedDate => Some(epoch_seconds(facts.modified)),
        MetricName::CreatedDate => {
            let created = facts.created.map_or(facts.modified, |c| c.min(facts.modified));
            Some(epoch_seconds(created))
        }
        MetricName::Sharpness | MetricName::Exposure | MetricName::Noise => None,
    }
}

/// Builds quality vectors with a fixed shape for one run.
#[derive(Debug, Clone)]
pub struct MetricEvaluator {
    primary: Vec<MetricName>,
    secondary: Vec<(MetricName, f64)>,
    date_preference: DatePreference,
    date_overrides: BTreeMap<MetricName, DatePreference>,
}

impl MetricEvaluator {
    pub fn new(primary: Vec<MetricName>, weights: &BTreeMap<MetricName, f64>) -> Self {
        Self {
            primary,
            secondary: weights.iter().map(|(m, w)| (*m, *w)).collect(),
            date_preference: DatePreference::Newest,
            date_overrides: BTreeMap::new(),
        }
    }

    pub fn with_date_preference(
        mut self,
        preference: DatePreference,
        overrides: BTreeMap<MetricName, DatePreference>,
    ) -> Self {
        self.date_preference = preference;
        self.date_overrides = overrides;
        self
    }

    pub fn secondary_metrics(&self) -> impl Iterator<Item = MetricName> + '_ {
        self.secondary.iter().map(|(m, _)| *m)
    }

    fn preference_for(&self, metric: MetricName) -> DatePreference {
        self.date_overrides
            .get(&metric)
            .copied()
            .unwrap_or(self.date_preference)
    }

    /// Evaluate every configured metric for one image.
    ///
    /// Fails with `MetricUnavailable` if any requested value cannot be
    /// produced or is not finite.
    pub fn evaluate(
        &self,
        provider: &dyn MetricProvider,
        path: &Path,
        facts: &ImageFacts,
    ) -> Result<QualityVector, CoreError> {
        let requested: Vec<MetricName> = self
            .primary
            .iter()
            .copied()
            .chain(self.secondary_metrics())
            .collect();

        let pixel_metrics: Vec<MetricName> = requested
            .iter()
            .copied()
            .filter(MetricName::needs_pixels)
            .collect();
        let measured = if pixel_metrics.is_empty() {
            Vec::new()
        } else {
            let values = provider.measure(path, &pixel_metrics)?;
            if values.len() != pixel_metrics.len() {
                return Err(CoreError::metric_unavailable(
                    path,
                    format!(
                        "provider returned {} values for {} metrics",
                        values.len(),
                        pixel_metrics.len()
                    ),
                ));
            }
            values
        };

        let value_of = |metric: MetricName| -> Result<f64, CoreError> {
            let raw = match fact_value(metric, path, facts) {
                Some(v) => v,
                None => pixel_metrics
                    .iter()
                    .position(|m| *m == metric)
                    .map(|i| measured[i])
                    .ok_or_else(|| CoreError::metric_unavailable(path, format!("{metric} not measured")))?,
            };
            if !raw.is_finite() {
                return Err(CoreError::metric_unavailable(
                    path,
                    format!("{metric} is not a finite number"),
                ));
            }
            if metric.is_date() && self.preference_for(metric) == DatePreference::Oldest {
                Ok(-raw)
            } else {
                Ok(raw)
            }
        };

        let primary = self
            .primary
            .iter()
            .map(|&metric| value_of(metric).map(|value| MetricValue { metric, value }))
            .collect::<Result<Vec<_>, _>>()?;
        let secondary = self
            .secondary
            .iter()
            .map(|&(metric, weight)| {
                value_of(metric).map(|value| WeightedValue {
                    metric,
                    value,
                    weight,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QualityVector { primary, secondary })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    /// Provider with fixed answers, shared by tests across the crate.
    pub(crate) struct FixedProvider {
        pub pixel_value: f64,
    }

    impl MetricProvider for FixedProvider {
        fn probe(&self, _path: &Path) -> Result<ImageFacts, CoreError> {
            Ok(facts(1920, 1080, 100))
        }

        fn measure(&self, _path: &Path, metrics: &[MetricName]) -> Result<Vec<f64>, CoreError> {
            Ok(vec![self.pixel_value; metrics.len()])
        }

        fn embedding(&self, _path: &Path) -> Result<Vec<f32>, CoreError> {
            Ok(vec![1.0, 0.0])
        }

        fn regions(&self, _path: &Path, count: usize) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(vec![vec![1.0, 0.0]; count])
        }

        fn content_hash(&self, _path: &Path) -> Result<String, CoreError> {
            Ok("deadbeef".to_string())
        }
    }

    pub(crate) fn facts(width: u32, height: u32, modified_secs: u64) -> ImageFacts {
        ImageFacts {
            width,
            height,
            size_bytes: width as u64 * height as u64 / 10,
            modified: UNIX_EPOCH + Duration::from_secs(modified_secs),
            created: None,
        }
    }

    #[test]
    fn test_fact_metrics() {
        let f = facts(3840, 2160, 50);
        let path = Path::new("/in/a.png");
        assert_eq!(fact_value(MetricName::Dimensions, path, &f), Some(2160.0));
        assert_eq!(fact_value(MetricName::Resolution, path, &f), Some(3840.0 * 2160.0));
        assert_eq!(fact_value(MetricName::FormatQuality, path, &f), Some(100.0));
        assert_eq!(fact_value(MetricName::ModifiedDate, path, &f), Some(50.0));
        assert_eq!(fact_value(MetricName::Sharpness, path, &f), None);
    }

    #[test]
    fn test_created_date_uses_earlier_timestamp() {
        let mut f = facts(10, 10, 100);
        f.created = Some(UNIX_EPOCH + Duration::from_secs(200));
        assert_eq!(fact_value(MetricName::CreatedDate, Path::new("a.jpg"), &f), Some(100.0));
        f.created = Some(UNIX_EPOCH + Duration::from_secs(40));
        assert_eq!(fact_value(MetricName::CreatedDate, Path::new("a.jpg"), &f), Some(40.0));
    }

    #[test]
    fn test_evaluate_shape_and_roles() {
        let mut weights = BTreeMap::new();
        weights.insert(MetricName::Sharpness, 0.5);
        let evaluator = MetricEvaluator::new(
            vec![MetricName::Resolution, MetricName::ModifiedDate],
            &weights,
        );
        let provider = FixedProvider { pixel_value: 0.75 };
        let q = evaluator
            .evaluate(&provider, Path::new("/in/a.jpg"), &facts(4, 2, 7))
            .unwrap();

        assert_eq!(q.primary.len(), 2);
        assert_eq!(q.primary[0].metric, MetricName::Resolution);
        assert_eq!(q.primary[0].value, 8.0);
        assert_eq!(q.primary[1].value, 7.0);
        assert_eq!(q.secondary.len(), 1);
        assert_eq!(q.secondary[0].value, 0.75);
        assert_eq!(q.secondary[0].weight, 0.5);
    }

    #[test]
    fn test_oldest_preference_inverts_dates() {
        let mut overrides = BTreeMap::new();
        overrides.insert(MetricName::CreatedDate, DatePreference::Newest);
        let evaluator = MetricEvaluator::new(
            vec![MetricName::ModifiedDate, MetricName::CreatedDate],
            &BTreeMap::new(),
        )
        .with_date_preference(DatePreference::Oldest, overrides);
        let provider = FixedProvider { pixel_value: 0.0 };
        let q = evaluator
            .evaluate(&provider, Path::new("a.jpg"), &facts(1, 1, 30))
            .unwrap();
        assert_eq!(q.primary[0].value, -30.0);
        assert_eq!(q.primary[1].value, 30.0);
    }

    #[test]
    fn test_non_finite_metric_is_unavailable() {
        let evaluator = MetricEvaluator::new(vec![MetricName::Noise], &BTreeMap::new());
        let provider = FixedProvider {
            pixel_value: f64::NAN,
        };
        let err = evaluator
            .evaluate(&provider, Path::new("a.jpg"), &facts(1, 1, 1))
            .unwrap_err();
        assert_eq!(err.kind(), "metric_unavailable");
    }
}
