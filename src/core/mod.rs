pub mod execute;
pub mod grouper;
pub mod image;
pub mod metrics;
pub mod placement;
pub mod ranker;
pub mod similarity;
