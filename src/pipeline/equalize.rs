use crate::pipeline::error::PipelineError;
use crate::protocol::SensorSample;

/// Trims every sensor's series down to the smallest per-sensor count so all
/// sensors contribute an equal-length series.
///
/// Excess samples are dropped from the tail of the affected series: the
/// earliest samples are the most temporally contiguous across sensors, and
/// the newest are the ones a lossy link leaves least certain. Relative order
/// is preserved.
pub fn equalize(
    mut per_sensor: Vec<Vec<SensorSample>>,
) -> Result<Vec<Vec<SensorSample>>, PipelineError> {
    if per_sensor.is_empty() {
        return Err(PipelineError::EmptyBatch);
    }
    for (index, series) in per_sensor.iter().enumerate() {
        if series.is_empty() {
            return Err(PipelineError::EmptySensor(index + 1));
        }
    }

    let target = per_sensor
        .iter()
        .map(Vec::len)
        .min()
        .unwrap_or(0);
    for series in &mut per_sensor {
        series.truncate(target);
    }
    Ok(per_sensor)
}
