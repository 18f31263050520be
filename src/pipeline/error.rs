use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no sensors in batch")]
    EmptyBatch,
    #[error("sensor {0} contributed no samples")]
    EmptySensor(usize),
    #[error("per-sensor series lengths differ; equalize before reshaping")]
    Unequalized,
    #[error("matrix has {got} columns, expected {expected}")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("calibration profile {path}: {reason}")]
    BadProfile { path: String, reason: String },
    #[error("calibration slope for sensor {sensor} axis {axis} is zero")]
    ZeroSlope { sensor: usize, axis: char },
    #[error("log does not start at a cycle boundary (sensor 1 time != 0)")]
    MissingBoundary,
    #[error("log is empty")]
    EmptyLog,
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
