use ndarray::Array2;

use crate::pipeline::error::PipelineError;
use crate::protocol::SensorSample;

/// Reshapes equalized per-sensor series into the aligned matrix: one
/// four-column block `(X, Y, Z, Time)` per sensor, blocks in ascending
/// sensor-id order, one row per retained sample index.
pub fn sort_columns(per_sensor: &[Vec<SensorSample>]) -> Result<Array2<f64>, PipelineError> {
    if per_sensor.is_empty() {
        return Err(PipelineError::EmptyBatch);
    }
    let rows = per_sensor[0].len();
    if rows == 0 {
        return Err(PipelineError::EmptySensor(1));
    }
    for (index, series) in per_sensor.iter().enumerate() {
        if series.len() != rows {
            if series.is_empty() {
                return Err(PipelineError::EmptySensor(index + 1));
            }
            return Err(PipelineError::Unequalized);
        }
    }

    let mut matrix = Array2::<f64>::zeros((rows, per_sensor.len() * 4));
    for (k, series) in per_sensor.iter().enumerate() {
        let base = k * 4;
        for (row, sample) in series.iter().enumerate() {
            matrix[[row, base]] = sample.x as f64;
            matrix[[row, base + 1]] = sample.y as f64;
            matrix[[row, base + 2]] = sample.z as f64;
            matrix[[row, base + 3]] = sample.time_ms;
        }
    }
    Ok(matrix)
}
