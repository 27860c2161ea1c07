pub mod analyzer;
pub mod cache;
pub mod discovery;
pub mod fs;
pub mod history;

pub use analyzer::ImageAnalyzer;
pub use cache::CachedProvider;
pub use discovery::{DiscoveryOptions, DiscoveryService};
pub use fs::LocalFileOps;
pub use history::{HistoryRecord, HistoryService, RestoreSelection};
