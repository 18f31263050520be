use std::fs;
use std::io::Write;
use std::path::Path;

use log::info;
use ndarray::Array2;

use crate::pipeline::error::PipelineError;

const AXIS_NAMES: [char; 3] = ['X', 'Y', 'Z'];

/// Per-sensor affine ADC-to-g transform: `g = adc / slope + intercept`,
/// applied per axis. Loaded once, immutable for the run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationProfile {
    /// `[slope_x, slope_y, slope_z]` per sensor.
    slopes: Vec<[f64; 3]>,
    /// `[intercept_x, intercept_y, intercept_z]` per sensor.
    intercepts: Vec<[f64; 3]>,
}

impl CalibrationProfile {
    /// Builds a profile from one persisted row: six values per sensor,
    /// slopes then intercepts.
    pub fn from_row(values: &[f64]) -> Result<Self, PipelineError> {
        if values.is_empty() || values.len() % 6 != 0 {
            return Err(PipelineError::BadProfile {
                path: "<row>".to_string(),
                reason: format!("expected a multiple of 6 values, got {}", values.len()),
            });
        }
        let mut slopes = Vec::with_capacity(values.len() / 6);
        let mut intercepts = Vec::with_capacity(values.len() / 6);
        for (sensor, chunk) in values.chunks_exact(6).enumerate() {
            let slope = [chunk[0], chunk[1], chunk[2]];
            for (axis, &value) in slope.iter().enumerate() {
                if value == 0.0 {
                    return Err(PipelineError::ZeroSlope {
                        sensor: sensor + 1,
                        axis: AXIS_NAMES[axis],
                    });
                }
            }
            slopes.push(slope);
            intercepts.push([chunk[3], chunk[4], chunk[5]]);
        }
        Ok(Self { slopes, intercepts })
    }

    /// Loads and validates the persisted profile. Missing or malformed files
    /// are fatal; calibrating against silent defaults would scale garbage.
    pub fn load(path: &Path, sensor_count: usize) -> Result<Self, PipelineError> {
        let values = read_value_row(path)?;
        if values.len() != sensor_count * 6 {
            return Err(PipelineError::BadProfile {
                path: path.display().to_string(),
                reason: format!(
                    "expected {} values for {sensor_count} sensors, got {}",
                    sensor_count * 6,
                    values.len()
                ),
            });
        }
        let profile = Self::from_row(&values).map_err(|err| match err {
            PipelineError::BadProfile { reason, .. } => PipelineError::BadProfile {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })?;
        info!("loaded calibration profile for {sensor_count} sensors from {}", path.display());
        Ok(profile)
    }

    pub fn sensor_count(&self) -> usize {
        self.slopes.len()
    }

    /// Applies the affine transform to every axis column, leaving the time
    /// columns untouched. Pure; the input matrix is not mutated.
    pub fn apply(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, PipelineError> {
        let expected = self.sensor_count() * 4;
        if matrix.ncols() != expected {
            return Err(PipelineError::ShapeMismatch {
                expected,
                got: matrix.ncols(),
            });
        }
        let mut out = matrix.clone();
        for (sensor, (slopes, intercepts)) in
            self.slopes.iter().zip(&self.intercepts).enumerate()
        {
            for axis in 0..3 {
                let column = axis + sensor * 4;
                out.column_mut(column)
                    .mapv_inplace(|v| v / slopes[axis] + intercepts[axis]);
            }
        }
        Ok(out)
    }
}

/// Residual per-axis offset measured from a stationary capture, subtracted
/// after the affine transform to re-zero each axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ZeroBias {
    /// Three values per sensor, X/Y/Z order.
    per_axis: Vec<f64>,
}

impl ZeroBias {
    /// Learns the bias from an already-calibrated stationary capture: the
    /// mean of every axis column is what a motionless vehicle should not be
    /// reading.
    pub fn from_stationary(matrix: &Array2<f64>, sensor_count: usize) -> Result<Self, PipelineError> {
        if matrix.ncols() != sensor_count * 4 {
            return Err(PipelineError::ShapeMismatch {
                expected: sensor_count * 4,
                got: matrix.ncols(),
            });
        }
        if matrix.nrows() == 0 {
            return Err(PipelineError::EmptyLog);
        }
        let mut per_axis = Vec::with_capacity(sensor_count * 3);
        for sensor in 0..sensor_count {
            for axis in 0..3 {
                let column = matrix.column(axis + sensor * 4);
                per_axis.push(column.mean().unwrap_or(0.0));
            }
        }
        Ok(Self { per_axis })
    }

    pub fn from_row(values: &[f64]) -> Result<Self, PipelineError> {
        if values.is_empty() || values.len() % 3 != 0 {
            return Err(PipelineError::BadProfile {
                path: "<row>".to_string(),
                reason: format!("expected a multiple of 3 values, got {}", values.len()),
            });
        }
        Ok(Self {
            per_axis: values.to_vec(),
        })
    }

    pub fn load(path: &Path, sensor_count: usize) -> Result<Self, PipelineError> {
        let values = read_value_row(path)?;
        if values.len() != sensor_count * 3 {
            return Err(PipelineError::BadProfile {
                path: path.display().to_string(),
                reason: format!(
                    "expected {} bias values for {sensor_count} sensors, got {}",
                    sensor_count * 3,
                    values.len()
                ),
            });
        }
        Self::from_row(&values)
    }

    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        write_value_row(path, &self.per_axis)
    }

    pub fn sensor_count(&self) -> usize {
        self.per_axis.len() / 3
    }

    /// Subtracts the learned offsets from the axis columns. Pure.
    pub fn apply(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, PipelineError> {
        let expected = self.sensor_count() * 4;
        if matrix.ncols() != expected {
            return Err(PipelineError::ShapeMismatch {
                expected,
                got: matrix.ncols(),
            });
        }
        let mut out = matrix.clone();
        for sensor in 0..self.sensor_count() {
            for axis in 0..3 {
                let bias = self.per_axis[axis + sensor * 3];
                out.column_mut(axis + sensor * 4).mapv_inplace(|v| v - bias);
            }
        }
        Ok(out)
    }
}

/// Reads one comma-separated row of floats, the persisted form shared by the
/// profile and the bias.
fn read_value_row(path: &Path) -> Result<Vec<f64>, PipelineError> {
    let text = fs::read_to_string(path).map_err(|err| PipelineError::BadProfile {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::BadProfile {
            path: path.display().to_string(),
            reason: "file is empty".to_string(),
        });
    }
    trimmed
        .split(',')
        .map(|field| {
            field.trim().parse::<f64>().map_err(|_| PipelineError::BadProfile {
                path: path.display().to_string(),
                reason: format!("non-numeric field {field:?}"),
            })
        })
        .collect()
}

fn write_value_row(path: &Path, values: &[f64]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::File::create(path)?;
    let row = values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    writeln!(file, "{row}")?;
    Ok(())
}
