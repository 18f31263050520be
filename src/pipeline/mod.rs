pub mod calibrate;
pub mod equalize;
pub mod error;
pub mod features;
pub mod sort;

pub use calibrate::{CalibrationProfile, ZeroBias};
pub use equalize::equalize;
pub use error::PipelineError;
pub use features::{FeatureExtractor, FeatureVector};
pub use sort::sort_columns;
