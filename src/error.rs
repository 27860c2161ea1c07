use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Per-image and per-operation failures raised inside the pipeline.
///
/// None of these abort a run: they are collected at image/group granularity
/// and surfaced in the end-of-run report. The type is `Clone` so memoized
/// derived values can hold a failed result.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreError {
    #[error("Metric unavailable for {path}: {reason}")]
    MetricUnavailable { path: PathBuf, reason: String },

    #[error("Unsupported image format {path}: {reason}")]
    UnsupportedImageFormat { path: PathBuf, reason: String },

    #[error("No free target for {path} near {target} after {attempts} attempts")]
    PlacementExhausted {
        path: PathBuf,
        target: PathBuf,
        attempts: u32,
    },

    #[error("Filesystem error on {path}: {message}")]
    FilesystemError { path: PathBuf, message: String },
}

impl CoreError {
    pub fn metric_unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CoreError::MetricUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CoreError::UnsupportedImageFormat {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, err: impl ToString) -> Self {
        CoreError::FilesystemError {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Report category name, matching the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::MetricUnavailable { .. } => "metric_unavailable",
            CoreError::UnsupportedImageFormat { .. } => "unsupported_image_format",
            CoreError::PlacementExhausted { .. } => "placement_exhausted",
            CoreError::FilesystemError { .. } => "filesystem_error",
        }
    }

    pub fn path(&self) -> &PathBuf {
        match self {
            CoreError::MetricUnavailable { path, .. }
            | CoreError::UnsupportedImageFormat { path, .. }
            | CoreError::PlacementExhausted { path, .. }
            | CoreError::FilesystemError { path, .. } => path,
        }
    }
}

/// Raised while loading or validating a [`crate::config::Config`], before the
/// pipeline starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Conflicting options: {message}")]
    Conflict { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        ConfigError::Conflict {
            message: message.into(),
        }
    }
}
