use log::debug;
use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::pipeline::error::PipelineError;

/// One instance's flattened magnitude spectrum plus its class label.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub values: Vec<f64>,
    pub label: i64,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Splits a multi-cycle calibrated log into per-cycle instances and turns
/// each into a labeled spectral feature vector.
///
/// Per instance of R rows: magnitude of the DFT of every axis column,
/// truncated to the first `R/2` bins (the Nyquist band), time columns
/// discarded, flattened column-major — all bins of sensor 1 X, then Y, then
/// Z, then sensor 2, and so on.
pub struct FeatureExtractor {
    sensor_count: usize,
    planner: FftPlanner<f64>,
}

impl FeatureExtractor {
    pub fn new(sensor_count: usize) -> Self {
        Self {
            sensor_count,
            planner: FftPlanner::new(),
        }
    }

    /// Instance boundaries: rows where sensor 1's time column resets to
    /// zero. The first row must be a boundary or the log is not a
    /// concatenation of whole cycles.
    pub fn instance_bounds(&self, log: &Array2<f64>) -> Result<Vec<(usize, usize)>, PipelineError> {
        self.check_shape(log)?;
        if log.nrows() == 0 {
            return Err(PipelineError::EmptyLog);
        }
        let time = log.column(3);
        let starts: Vec<usize> = time
            .iter()
            .enumerate()
            .filter_map(|(row, &t)| (t == 0.0).then_some(row))
            .collect();
        if starts.first() != Some(&0) {
            return Err(PipelineError::MissingBoundary);
        }
        let mut bounds = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(log.nrows());
            bounds.push((start, end));
        }
        Ok(bounds)
    }

    /// Extracts one feature vector per instance, all tagged with `label`.
    pub fn extract(
        &mut self,
        log: &Array2<f64>,
        label: i64,
    ) -> Result<Vec<FeatureVector>, PipelineError> {
        let bounds = self.instance_bounds(log)?;
        debug!("extracting {} instances of label {label}", bounds.len());
        let mut vectors = Vec::with_capacity(bounds.len());
        for (start, end) in bounds {
            let rows = end - start;
            let bins = rows / 2;
            let mut values = Vec::with_capacity(bins * 3 * self.sensor_count);
            for sensor in 0..self.sensor_count {
                for axis in 0..3 {
                    let column = axis + sensor * 4;
                    let series: Vec<f64> = (start..end).map(|row| log[[row, column]]).collect();
                    values.extend(self.spectrum(&series, bins));
                }
            }
            vectors.push(FeatureVector { values, label });
        }
        Ok(vectors)
    }

    /// Magnitude spectrum of one axis series, truncated to `bins` entries.
    /// Magnitudes are unnormalized, matching the convention the downstream
    /// trainer was fitted against.
    fn spectrum(&mut self, series: &[f64], bins: usize) -> Vec<f64> {
        let fft = self.planner.plan_fft_forward(series.len());
        let mut buffer: Vec<Complex<f64>> = series
            .iter()
            .map(|&v| Complex::new(v, 0.0))
            .collect();
        fft.process(&mut buffer);
        buffer.iter().take(bins).map(|c| c.norm()).collect()
    }

    fn check_shape(&self, log: &Array2<f64>) -> Result<(), PipelineError> {
        let expected = self.sensor_count * 4;
        if log.ncols() != expected {
            return Err(PipelineError::ShapeMismatch {
                expected,
                got: log.ncols(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Log of `cycles` concatenated instances, `rows` rows each, with the
    /// time columns restarting at zero per instance.
    fn synthetic_log(sensor_count: usize, cycles: usize, rows: usize) -> Array2<f64> {
        let mut log = Array2::<f64>::zeros((cycles * rows, sensor_count * 4));
        for cycle in 0..cycles {
            for row in 0..rows {
                for sensor in 0..sensor_count {
                    let base = sensor * 4;
                    log[[cycle * rows + row, base]] = 1.0;
                    log[[cycle * rows + row, base + 1]] = 2.0;
                    log[[cycle * rows + row, base + 2]] = 3.0;
                    log[[cycle * rows + row, base + 3]] = row as f64 * 10.0;
                }
            }
        }
        log
    }

    #[test]
    fn boundaries_partition_the_log_into_cycles() {
        let extractor = FeatureExtractor::new(2);
        let log = synthetic_log(2, 3, 4);
        let bounds = extractor.instance_bounds(&log).unwrap();
        assert_eq!(bounds, vec![(0, 4), (4, 8), (8, 12)]);
    }

    #[test]
    fn log_not_starting_at_zero_time_is_refused() {
        let extractor = FeatureExtractor::new(1);
        let mut log = synthetic_log(1, 1, 4);
        log[[0, 3]] = 5.0;
        assert!(matches!(
            extractor.instance_bounds(&log),
            Err(PipelineError::MissingBoundary)
        ));
    }

    #[test]
    fn feature_length_is_half_rows_by_axes_by_sensors() {
        let mut extractor = FeatureExtractor::new(2);
        let log = synthetic_log(2, 2, 8);
        let vectors = extractor.extract(&log, 1).unwrap();
        assert_eq!(vectors.len(), 2);
        // R/2 * 3 axes * 2 sensors = 4 * 3 * 2.
        assert!(vectors.iter().all(|v| v.len() == 24));
        assert!(vectors.iter().all(|v| v.label == 1));
    }

    #[test]
    fn constant_series_concentrates_in_the_dc_bin() {
        let mut extractor = FeatureExtractor::new(1);
        let log = synthetic_log(1, 1, 8);
        let vectors = extractor.extract(&log, 0).unwrap();
        let v = &vectors[0];
        // Sensor 1 X is a constant 1.0 over 8 rows: DC bin 8.0, rest ~0.
        assert!((v.values[0] - 8.0).abs() < 1e-9);
        for &bin in &v.values[1..4] {
            assert!(bin.abs() < 1e-9);
        }
        // Y block starts at bin 4 with DC 2.0 * 8.
        assert!((v.values[4] - 16.0).abs() < 1e-9);
    }

    #[test]
    fn time_columns_never_reach_the_feature_vector() {
        let mut extractor = FeatureExtractor::new(1);
        let mut log = synthetic_log(1, 1, 4);
        // Poison the time column; features must not change shape or pick
        // these up as magnitudes.
        log[[1, 3]] = 1e12;
        log[[2, 3]] = 1e12;
        log[[3, 3]] = 1e12;
        let vectors = extractor.extract(&log, 0).unwrap();
        assert_eq!(vectors[0].len(), 6);
        assert!(vectors[0].values.iter().all(|&v| v < 1e6));
    }

    #[test]
    fn wrong_column_count_is_refused() {
        let extractor = FeatureExtractor::new(2);
        let log = Array2::<f64>::zeros((4, 4));
        assert!(matches!(
            extractor.instance_bounds(&log),
            Err(PipelineError::ShapeMismatch { expected: 8, got: 4 })
        ));
    }
}
