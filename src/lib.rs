//! Group visually similar photos, rank every group by configurable quality
//! metrics and lay the winners out under `best/` without ever overwriting a
//! file the run does not own.

pub mod config;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod services;

pub use config::Config;
pub use error::{ConfigError, CoreError};
pub use pipeline::{Pipeline, RunReport, StopHandle};
