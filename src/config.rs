use crate::core::execute::OperationKind;
use crate::core::metrics::{DatePreference, MetricEvaluator, MetricName};
use crate::core::placement::{
    render_pattern, CollisionStrategy, Layout, PlacementOptions, NAMING_PLACEHOLDERS,
};
use crate::core::ranker::{Ranker, UnavailablePolicy};
use crate::core::similarity::{BlendRule, SimilarityEngine};
use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";
pub const APP_DIR: &str = "bestpick";

/// Named similarity levels; each maps to a fixed threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityPreset {
    Same,
    AlmostSame,
    VerySimilar,
    Similar,
    NotSameSameLocation,
    NotSameVerySimilarLocation,
    NotSameSimilarLocation,
    Dissimilar,
}

impl SimilarityPreset {
    pub fn threshold(&self) -> f64 {
        match self {
            SimilarityPreset::Same => 0.989,
            SimilarityPreset::AlmostSame => 0.978,
            SimilarityPreset::VerySimilar => 0.96,
            SimilarityPreset::Similar => 0.94,
            SimilarityPreset::NotSameSameLocation => 0.90,
            SimilarityPreset::NotSameVerySimilarLocation => 0.80,
            SimilarityPreset::NotSameSimilarLocation => 0.70,
            SimilarityPreset::Dissimilar => 0.60,
        }
    }
}

/// Every option of a run. Loaded once, validated once, then read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // ranking
    pub primary_metrics: Vec<MetricName>,
    pub metric_weights: BTreeMap<MetricName, f64>,
    pub date_preference: DatePreference,
    pub date_overrides: BTreeMap<MetricName, DatePreference>,
    pub tie_epsilon: f64,
    pub unavailable_policy: UnavailablePolicy,

    // grouping
    pub similarity_threshold: f64,
    pub similarity_preset: Option<SimilarityPreset>,
    pub blend: BlendRule,
    pub region_count: usize,
    pub prefilter_min_images: usize,

    // placement
    pub collision_strategy: CollisionStrategy,
    pub max_collision_attempts: u32,
    pub layout: Layout,
    pub naming_pattern: String,
    pub retain_candidates: bool,
    pub collect_results: bool,
    pub collection_dir: PathBuf,
    pub include_singletons: bool,
    pub singletons_dir: Option<PathBuf>,
    pub max_path_length: Option<usize>,

    // execution
    pub operation: OperationKind,
    /// Overrides `operation` for winners, e.g. copy the best while moving the rest
    pub best_operation: Option<OperationKind>,
    pub collection_operation: OperationKind,
    pub create_backlinks: bool,
    pub force: bool,
    pub dry_run: bool,

    // resources
    pub metric_timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary_metrics: vec![
                MetricName::Dimensions,
                MetricName::FormatQuality,
                MetricName::Filesize,
                MetricName::ModifiedDate,
            ],
            metric_weights: BTreeMap::new(),
            date_preference: DatePreference::Newest,
            date_overrides: BTreeMap::new(),
            tie_epsilon: 1e-9,
            unavailable_policy: UnavailablePolicy::RankLast,
            similarity_threshold: 0.96,
            similarity_preset: None,
            blend: BlendRule::Max,
            region_count: 0,
            prefilter_min_images: 2000,
            collision_strategy: CollisionStrategy::Hierarchical,
            max_collision_attempts: 10_000,
            layout: Layout::Mirror,
            naming_pattern: "{filename}_{width}x{height}".to_string(),
            retain_candidates: true,
            collect_results: false,
            collection_dir: PathBuf::from("best_collection"),
            include_singletons: true,
            singletons_dir: None,
            max_path_length: Some(250),
            operation: OperationKind::Symlink,
            best_operation: None,
            collection_operation: OperationKind::Copy,
            create_backlinks: false,
            force: false,
            dry_run: false,
            metric_timeout_ms: 30_000,
            batch_size: 16,
        }
    }
}

/// Parse a snake_case enum name the same way the config file spells it.
pub fn parse_name<T: DeserializeOwned>(name: &str) -> Result<T, ConfigError> {
    Ok(serde_json::from_value(serde_json::Value::String(name.to_string()))?)
}

fn check_relative_dir(field: &'static str, dir: &Path) -> Result<(), ConfigError> {
    if dir.as_os_str().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    let escapes = dir
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ConfigError::invalid(
            field,
            format!("{:?} must be a relative path inside the output directory", dir),
        ));
    }
    Ok(())
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// `<config dir>/bestpick/config.json`, when the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Explicit file if given, else the per-user file if present, else
    /// defaults.
    pub fn load_layered(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Threshold after applying the preset, if any.
    pub fn threshold(&self) -> f64 {
        self.similarity_preset
            .map_or(self.similarity_threshold, |p| p.threshold())
    }

    /// `None` when the timeout is disabled.
    pub fn metric_timeout(&self) -> Option<Duration> {
        (self.metric_timeout_ms > 0).then(|| Duration::from_millis(self.metric_timeout_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.threshold();
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::invalid(
                "similarity_threshold",
                format!("{threshold} is outside [0, 1]"),
            ));
        }
        if self.primary_metrics.is_empty() && self.metric_weights.is_empty() {
            return Err(ConfigError::invalid("primary_metrics", "no metrics configured"));
        }
        let mut seen = BTreeSet::new();
        for metric in &self.primary_metrics {
            if !seen.insert(*metric) {
                return Err(ConfigError::invalid(
                    "primary_metrics",
                    format!("{metric} is listed twice"),
                ));
            }
        }
        for (metric, weight) in &self.metric_weights {
            if seen.contains(metric) {
                return Err(ConfigError::conflict(format!(
                    "{metric} is both a primary metric and a weighted secondary metric"
                )));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ConfigError::invalid(
                    "metric_weights",
                    format!("weight {weight} for {metric} must be finite and non-negative"),
                ));
            }
        }
        if let Some(metric) = self.date_overrides.keys().find(|m| !m.is_date()) {
            return Err(ConfigError::invalid(
                "date_overrides",
                format!("{metric} is not a date metric"),
            ));
        }
        if !self.tie_epsilon.is_finite() || self.tie_epsilon < 0.0 {
            return Err(ConfigError::invalid(
                "tie_epsilon",
                format!("{} must be finite and non-negative", self.tie_epsilon),
            ));
        }
        if let BlendRule::Weighted { embedding_weight } = self.blend {
            if !(0.0..=1.0).contains(&embedding_weight) {
                return Err(ConfigError::invalid(
                    "blend",
                    format!("embedding weight {embedding_weight} is outside [0, 1]"),
                ));
            }
        }
        if self.region_count > 5 {
            return Err(ConfigError::invalid(
                "region_count",
                format!("{} is more than the 5 available regions", self.region_count),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.max_collision_attempts == 0 {
            return Err(ConfigError::invalid("max_collision_attempts", "must be at least 1"));
        }
        if self.create_backlinks && !self.moves_files() {
            return Err(ConfigError::conflict(format!(
                "create_backlinks requires operation `move`, got `{}`",
                self.operation
            )));
        }
        if self.collection_operation == OperationKind::Move {
            return Err(ConfigError::invalid(
                "collection_operation",
                "must be `symlink` or `copy`; a move would take the file out of best/",
            ));
        }
        render_pattern(&self.naming_pattern, |name| {
            NAMING_PLACEHOLDERS.contains(&name).then(String::new)
        })
        .map_err(|e| ConfigError::invalid("naming_pattern", e))?;
        if self.naming_pattern.trim().is_empty() {
            return Err(ConfigError::invalid("naming_pattern", "must not be empty"));
        }
        if self.naming_pattern.contains(['/', '\\']) || matches!(self.naming_pattern.trim(), "." | "..") {
            return Err(ConfigError::invalid(
                "naming_pattern",
                "must render to a single directory name inside candidates/",
            ));
        }
        check_relative_dir("collection_dir", &self.collection_dir)?;
        if let Some(dir) = &self.singletons_dir {
            check_relative_dir("singletons_dir", dir)?;
        }
        if let Some(max) = self.max_path_length {
            if max < 32 {
                return Err(ConfigError::invalid(
                    "max_path_length",
                    format!("{max} is too short to hold any target"),
                ));
            }
        }
        Ok(())
    }

    /// True when any placement takes a file away from its source.
    pub fn moves_files(&self) -> bool {
        self.operation == OperationKind::Move || self.best_operation == Some(OperationKind::Move)
    }

    pub fn evaluator(&self) -> MetricEvaluator {
        MetricEvaluator::new(self.primary_metrics.clone(), &self.metric_weights)
            .with_date_preference(self.date_preference, self.date_overrides.clone())
    }

    pub fn similarity_engine(&self) -> SimilarityEngine {
        SimilarityEngine::new(self.blend)
    }

    pub fn ranker(&self) -> Ranker {
        Ranker::new(self.tie_epsilon, self.unavailable_policy)
    }

    pub fn placement_options(&self, output_root: &Path, input_roots: &[PathBuf]) -> PlacementOptions {
        PlacementOptions {
            output_root: output_root.to_path_buf(),
            input_roots: input_roots.to_vec(),
            strategy: self.collision_strategy,
            layout: self.layout,
            naming_pattern: self.naming_pattern.clone(),
            retain_candidates: self.retain_candidates,
            collect_results: self.collect_results,
            collection_dir: self.collection_dir.clone(),
            include_singletons: self.include_singletons,
            singletons_dir: self.singletons_dir.clone(),
            max_path_length: self.max_path_length,
            max_collision_attempts: self.max_collision_attempts,
        }
    }
}
