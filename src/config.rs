use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Operating mode, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Stream cycles from the sensor array and export a calibrated log.
    Collect,
    /// Stationary capture used to learn the per-axis zero bias.
    Calibrate,
    /// Turn previously saved logs into a training-ready feature table.
    Extract,
}

impl Mode {
    pub fn from_arg(arg: &str) -> Result<Self> {
        match arg {
            "collect" => Ok(Mode::Collect),
            "calibrate" => Ok(Mode::Calibrate),
            "extract" => Ok(Mode::Extract),
            other => bail!("unknown mode {other:?} (expected collect, calibrate or extract)"),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Collect => "collect",
            Mode::Calibrate => "calibrate",
            Mode::Extract => "extract",
        };
        f.write_str(name)
    }
}

/// One saved log feeding the feature table, tagged with its class label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSource {
    pub path: PathBuf,
    pub label: i64,
}

/// Everything a run needs, loaded once from a JSON file.
///
/// Defaults mirror the deployed rig: five XBee-linked accelerometer nodes at
/// 115200 baud, 220 samples per cycle, 25 cycles per capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub port: String,
    pub baud: u32,
    pub timeout_ms: u64,
    pub sensor_count: usize,
    pub samples_per_cycle: u32,
    pub cycles: u32,
    /// Substituted when the end-of-cycle frame is garbled; `None` makes a
    /// garbled end frame abort the cycle instead.
    pub fallback_cycle_ms: Option<u64>,
    /// Reject cap per cycle. `None` keeps polling a noisy link forever.
    pub max_rejected_frames: Option<u32>,
    pub profile_path: PathBuf,
    pub bias_path: PathBuf,
    pub output_path: PathBuf,
    pub feature_table_path: PathBuf,
    pub training_sources: Vec<TrainingSource>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            timeout_ms: 5_000,
            sensor_count: 5,
            samples_per_cycle: 220,
            cycles: 25,
            fallback_cycle_ms: Some(783),
            max_rejected_frames: None,
            profile_path: PathBuf::from("calibration/profile.csv"),
            bias_path: PathBuf::from("calibration/zero_bias.csv"),
            output_path: PathBuf::from("capture.csv"),
            feature_table_path: PathBuf::from("training_data.csv"),
            training_sources: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: RunConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sensor_count == 0 {
            bail!("sensor_count must be at least 1");
        }
        if self.samples_per_cycle == 0 {
            bail!("samples_per_cycle must be at least 1");
        }
        if self.cycles == 0 {
            bail!("cycles must be at least 1");
        }
        Ok(())
    }

    /// Field count of a well-formed sample frame: three axes per sensor plus
    /// the trailing desync marker.
    pub fn fields_per_frame(&self) -> usize {
        self.sensor_count * 3 + 1
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
