use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::RunConfig;
use crate::link::{LinkError, SensorLink};

/// First occurrence starts sampling on the device, second occurrence stops it.
pub const START_STOP_BYTE: u8 = b'S';
/// Previous frame accepted.
pub const ACK_ACCEPT: u8 = b'T';
/// Previous frame rejected; the device resends.
pub const ACK_REJECT: u8 = b'F';

/// Pause between polls while the inbound buffer is empty.
const IDLE_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("rejected {0} frames in one cycle; aborting acquisition")]
    TooManyRejects(u32),
    #[error("end-of-cycle frame malformed and no fallback duration configured")]
    MissingEndTime,
}

/// Why a received line was rejected. Both variants get the same treatment:
/// count it, ack `'F'`, keep sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("wrong field count or empty/non-numeric field")]
    Malformed,
    #[error("frame bytes are not valid text")]
    Undecodable,
}

/// One reading from one accelerometer node, with its reconstructed timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    /// 1-based node id, matching the slot order on the wire.
    pub sensor_id: usize,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Synthetic, derived from the cycle's elapsed time; the device reports
    /// no per-sample clock.
    pub time_ms: f64,
}

/// All accepted samples of one acquisition cycle, grouped per accepted frame.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    sensor_count: usize,
    groups: Vec<Vec<SensorSample>>,
}

impl SampleBatch {
    fn new(sensor_count: usize) -> Self {
        Self {
            sensor_count,
            groups: Vec::new(),
        }
    }

    /// Accepted frames in this batch, one group per frame.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Flattens the batch into one series per sensor id, preserving arrival
    /// order. Sensors that never appeared yield empty series, which the
    /// equalizer rejects loudly.
    pub fn into_per_sensor(self) -> Vec<Vec<SensorSample>> {
        let mut per_sensor: Vec<Vec<SensorSample>> = vec![Vec::new(); self.sensor_count];
        for group in self.groups {
            for sample in group {
                if sample.sensor_id >= 1 && sample.sensor_id <= self.sensor_count {
                    per_sensor[sample.sensor_id - 1].push(sample);
                }
            }
        }
        per_sensor
    }
}

/// Result of one completed acquisition cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    pub batch: SampleBatch,
    pub accepted: u32,
    pub rejected: u32,
    pub elapsed_ms: u64,
    /// `elapsed_ms / (samples_per_cycle * sensor_count)`.
    pub sampling_period_ms: f64,
}

/// Handshake state machine for one acquisition cycle.
///
/// The device sends one sample frame per accepted line and waits for this
/// side's `'T'`/`'F'` ack before sending the next, so acking exactly once per
/// received line is what keeps the two ends synchronized even across garbled
/// frames.
pub struct AcquisitionProtocol {
    sensor_count: usize,
    samples_per_cycle: u32,
    fallback_cycle_ms: Option<u64>,
    max_rejected_frames: Option<u32>,
}

enum CycleState {
    Sampling,
    AwaitEndTime,
}

impl AcquisitionProtocol {
    pub fn new(
        sensor_count: usize,
        samples_per_cycle: u32,
        fallback_cycle_ms: Option<u64>,
        max_rejected_frames: Option<u32>,
    ) -> Self {
        Self {
            sensor_count,
            samples_per_cycle,
            fallback_cycle_ms,
            max_rejected_frames,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config.sensor_count,
            config.samples_per_cycle,
            config.fallback_cycle_ms,
            config.max_rejected_frames,
        )
    }

    /// Runs one full start-to-stop cycle on the given link.
    ///
    /// Writes the start byte, accepts frames until the target count is
    /// reached, reads the end-of-cycle frame, writes the stop byte and
    /// reconstructs per-sample timestamps from the reported elapsed time.
    pub fn run_cycle<L: SensorLink>(&self, link: &mut L) -> Result<CycleOutcome, ProtocolError> {
        link.write_byte(START_STOP_BYTE)?;

        let mut state = CycleState::Sampling;
        let mut accepted: u32 = 0;
        let mut rejected: u32 = 0;
        let mut rows: Vec<Vec<[i32; 3]>> = Vec::with_capacity(self.samples_per_cycle as usize);
        let elapsed_ms;

        loop {
            if !link.has_data()? {
                thread::sleep(IDLE_POLL);
                continue;
            }
            let raw = link.read_line()?;

            match state {
                CycleState::Sampling => {
                    match parse_sample_frame(&raw, self.sensor_count) {
                        Ok(slots) => {
                            rows.push(slots);
                            link.write_byte(ACK_ACCEPT)?;
                            accepted += 1;
                            debug!("frame accepted ({accepted}/{})", self.samples_per_cycle);
                        }
                        Err(err) => {
                            link.write_byte(ACK_REJECT)?;
                            rejected += 1;
                            warn!("frame rejected ({err}); {rejected} lost so far");
                            if let Some(cap) = self.max_rejected_frames {
                                if rejected >= cap {
                                    return Err(ProtocolError::TooManyRejects(rejected));
                                }
                            }
                        }
                    }
                    if accepted == self.samples_per_cycle {
                        state = CycleState::AwaitEndTime;
                    }
                }
                CycleState::AwaitEndTime => {
                    elapsed_ms = match parse_end_frame(&raw) {
                        Ok(ms) => ms,
                        Err(err) => match self.fallback_cycle_ms {
                            Some(fallback) => {
                                warn!("end-of-cycle frame unusable ({err}); assuming {fallback} ms");
                                fallback
                            }
                            None => return Err(ProtocolError::MissingEndTime),
                        },
                    };
                    break;
                }
            }
        }

        link.write_byte(START_STOP_BYTE)?;

        let slots_per_cycle = self.samples_per_cycle as f64 * self.sensor_count as f64;
        let sampling_period_ms = elapsed_ms as f64 / slots_per_cycle;

        let batch = self.stamp(rows, sampling_period_ms);
        info!(
            "cycle complete: accepted={accepted} rejected={rejected} \
             elapsed={elapsed_ms}ms period={sampling_period_ms:.3}ms"
        );

        Ok(CycleOutcome {
            batch,
            accepted,
            rejected,
            elapsed_ms,
            sampling_period_ms,
        })
    }

    /// Assigns timestamps that grow by one sampling period per sensor slot,
    /// across frame boundaries, so the last slot of the cycle lands one
    /// period short of the reported elapsed time.
    fn stamp(&self, rows: Vec<Vec<[i32; 3]>>, period_ms: f64) -> SampleBatch {
        let mut batch = SampleBatch::new(self.sensor_count);
        let mut slot = 0u64;
        for row in rows {
            let mut group = Vec::with_capacity(self.sensor_count);
            for (k, [x, y, z]) in row.into_iter().enumerate() {
                group.push(SensorSample {
                    sensor_id: k + 1,
                    x,
                    y,
                    z,
                    time_ms: slot as f64 * period_ms,
                });
                slot += 1;
            }
            batch.groups.push(group);
        }
        batch
    }
}

/// Parses one sample frame: exactly `3 * sensor_count + 1` space-separated
/// integer fields, the last being the desync/continuation marker. The axis
/// values come back grouped per sensor slot; the marker is validated and
/// dropped.
fn parse_sample_frame(raw: &[u8], sensor_count: usize) -> Result<Vec<[i32; 3]>, FrameError> {
    let text = std::str::from_utf8(raw).map_err(|_| FrameError::Undecodable)?;
    let expected_fields = sensor_count * 3 + 1;

    let fields: Vec<&str> = text
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .split(' ')
        .collect();
    if fields.len() != expected_fields || fields.iter().any(|f| f.is_empty()) {
        return Err(FrameError::Malformed);
    }
    // Marker must at least be numeric; its value is the device's business.
    fields[expected_fields - 1]
        .parse::<i64>()
        .map_err(|_| FrameError::Malformed)?;

    let mut slots = Vec::with_capacity(sensor_count);
    for chunk in fields[..expected_fields - 1].chunks_exact(3) {
        let x = chunk[0].parse().map_err(|_| FrameError::Malformed)?;
        let y = chunk[1].parse().map_err(|_| FrameError::Malformed)?;
        let z = chunk[2].parse().map_err(|_| FrameError::Malformed)?;
        slots.push([x, y, z]);
    }
    Ok(slots)
}

/// Parses the end-of-cycle frame: elapsed milliseconds plus one trailing
/// field.
fn parse_end_frame(raw: &[u8]) -> Result<u64, FrameError> {
    let text = std::str::from_utf8(raw).map_err(|_| FrameError::Undecodable)?;
    let fields: Vec<&str> = text
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .split(' ')
        .collect();
    if fields.len() != 2 || fields.iter().any(|f| f.is_empty()) {
        return Err(FrameError::Malformed);
    }
    fields[0].parse::<u64>().map_err(|_| FrameError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ScriptedLink;

    fn sample_line(sensor_count: usize, base: i32) -> String {
        let mut fields = Vec::new();
        for k in 0..sensor_count {
            let v = base + k as i32 * 10;
            fields.push(format!("{} {} {}", v, v + 1, v + 2));
        }
        fields.push("0".to_string());
        format!("{}\r\n", fields.join(" "))
    }

    #[test]
    fn well_formed_frame_parses_into_slots() {
        let slots = parse_sample_frame(b"100 101 102 200 201 202 0\r\n", 2).unwrap();
        assert_eq!(slots, vec![[100, 101, 102], [200, 201, 202]]);
    }

    #[test]
    fn short_and_non_numeric_frames_are_malformed() {
        assert_eq!(
            parse_sample_frame(b"100 101 102 0\n", 2),
            Err(FrameError::Malformed)
        );
        assert_eq!(
            parse_sample_frame(b"100 abc 102 200 201 202 0\n", 2),
            Err(FrameError::Malformed)
        );
        // Double space produces an empty field, which the device side treats
        // as a desync symptom.
        assert_eq!(
            parse_sample_frame(b"100 101 102 200 201  202 0\n", 2),
            Err(FrameError::Malformed)
        );
    }

    #[test]
    fn non_utf8_frame_is_undecodable() {
        assert_eq!(
            parse_sample_frame(&[0xff, 0xfe, b'\n'], 2),
            Err(FrameError::Undecodable)
        );
    }

    #[test]
    fn each_frame_gets_exactly_one_ack() {
        let lines = vec![
            sample_line(2, 100),
            "garbage\r\n".to_string(),
            sample_line(2, 110),
            "140 0\r\n".to_string(),
        ];
        let mut link = ScriptedLink::new(lines);
        let protocol = AcquisitionProtocol::new(2, 2, Some(783), None);
        let outcome = protocol.run_cycle(&mut link).unwrap();

        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.accepted + outcome.rejected, 3);
        // Start, ack, reject-ack, ack, stop.
        assert_eq!(link.sent, vec![b'S', b'T', b'F', b'T', b'S']);
    }

    #[test]
    fn undecodable_bytes_are_rejected_like_any_bad_frame() {
        let mut lines: Vec<Vec<u8>> = vec![vec![0xff, 0x00, b'\n']];
        lines.push(sample_line(2, 100).into_bytes());
        lines.push(b"60 0\r\n".to_vec());
        let mut link = ScriptedLink::new(lines);
        let protocol = AcquisitionProtocol::new(2, 1, Some(783), None);
        let outcome = protocol.run_cycle(&mut link).unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn malformed_end_frame_falls_back_to_configured_duration() {
        let lines = vec![sample_line(2, 100), "\r\n".to_string()];
        let mut link = ScriptedLink::new(lines);
        let protocol = AcquisitionProtocol::new(2, 1, Some(783), None);
        let outcome = protocol.run_cycle(&mut link).unwrap();
        assert_eq!(outcome.elapsed_ms, 783);
    }

    #[test]
    fn malformed_end_frame_fails_hard_without_fallback() {
        let lines = vec![sample_line(2, 100), "nonsense\r\n".to_string()];
        let mut link = ScriptedLink::new(lines);
        let protocol = AcquisitionProtocol::new(2, 1, None, None);
        assert!(matches!(
            protocol.run_cycle(&mut link),
            Err(ProtocolError::MissingEndTime)
        ));
    }

    #[test]
    fn reject_cap_aborts_a_hopeless_cycle() {
        let lines = vec!["x\r\n".to_string(), "x\r\n".to_string(), "x\r\n".to_string()];
        let mut link = ScriptedLink::new(lines);
        let protocol = AcquisitionProtocol::new(2, 1, Some(783), Some(2));
        assert!(matches!(
            protocol.run_cycle(&mut link),
            Err(ProtocolError::TooManyRejects(2))
        ));
    }

    #[test]
    fn timestamps_step_once_per_sensor_slot() {
        // Five sensors, three samples, 900 ms reported: period 60 ms.
        let lines = vec![
            sample_line(5, 100),
            sample_line(5, 200),
            sample_line(5, 300),
            "900 0\r\n".to_string(),
        ];
        let mut link = ScriptedLink::new(lines);
        let protocol = AcquisitionProtocol::new(5, 3, Some(783), None);
        let outcome = protocol.run_cycle(&mut link).unwrap();

        assert_eq!(outcome.sampling_period_ms, 60.0);
        let per_sensor = outcome.batch.into_per_sensor();
        let sensor0_times: Vec<f64> = per_sensor[0].iter().map(|s| s.time_ms).collect();
        assert_eq!(sensor0_times, vec![0.0, 300.0, 600.0]);
        // Last slot of the cycle sits one period short of the elapsed time.
        let last = per_sensor[4].last().unwrap();
        assert_eq!(last.time_ms, 900.0 - 60.0);
    }
}
