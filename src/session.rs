use anyhow::{Context, Result};
use log::{debug, info, warn};
use ndarray::{concatenate, Array2, Axis};

use crate::config::RunConfig;
use crate::link::{SensorLink, SerialSensorLink};
use crate::pipeline::{equalize, sort_columns, CalibrationProfile, FeatureExtractor, ZeroBias};
use crate::protocol::AcquisitionProtocol;
use crate::storage;

/// Per-cycle bookkeeping surfaced to the caller after a run.
#[derive(Debug, Clone, Copy)]
pub struct CycleStats {
    pub accepted: u32,
    pub rejected: u32,
    pub elapsed_ms: u64,
    pub sampling_period_ms: f64,
}

/// A finished capture: the raw ADC matrix (rows from all cycles stacked, the
/// time column restarting at zero per cycle) plus the per-cycle stats.
pub struct RunData {
    pub matrix: Array2<f64>,
    pub stats: Vec<CycleStats>,
}

impl RunData {
    pub fn total_rejected(&self) -> u32 {
        self.stats.iter().map(|s| s.rejected).sum()
    }
}

/// All per-run state: the link, the protocol and the cycle log. Nothing
/// ambient; drop the session and the port handle goes with it.
pub struct AcquisitionSession<L: SensorLink> {
    link: L,
    protocol: AcquisitionProtocol,
    cycles: u32,
}

impl<L: SensorLink> AcquisitionSession<L> {
    pub fn new(link: L, config: &RunConfig) -> Self {
        Self {
            link,
            protocol: AcquisitionProtocol::from_config(config),
            cycles: config.cycles,
        }
    }

    /// Runs the configured number of acquisition cycles and stacks the
    /// per-cycle aligned matrices into one log. Each cycle is equalized and
    /// reshaped on its own so its timestamps start at zero, which is what
    /// later marks the instance boundaries.
    pub fn collect(&mut self) -> Result<RunData> {
        let mut cycle_matrices = Vec::with_capacity(self.cycles as usize);
        let mut stats = Vec::with_capacity(self.cycles as usize);

        for cycle in 1..=self.cycles {
            info!("starting cycle {cycle}/{}", self.cycles);
            let outcome = self
                .protocol
                .run_cycle(&mut self.link)
                .with_context(|| format!("cycle {cycle} failed"))?;
            stats.push(CycleStats {
                accepted: outcome.accepted,
                rejected: outcome.rejected,
                elapsed_ms: outcome.elapsed_ms,
                sampling_period_ms: outcome.sampling_period_ms,
            });
            debug!(
                "cycle {cycle} yielded {} frame groups",
                outcome.batch.group_count()
            );
            let per_sensor = outcome.batch.into_per_sensor();
            let equalized = equalize(per_sensor)?;
            cycle_matrices.push(sort_columns(&equalized)?);
        }

        let views: Vec<_> = cycle_matrices.iter().map(|m| m.view()).collect();
        let matrix = concatenate(Axis(0), &views).context("failed to stack cycle matrices")?;

        let lost = stats.iter().map(|s| s.rejected).sum::<u32>();
        if lost > 0 {
            warn!("run finished with {lost} lost frames across {} cycles", stats.len());
        }
        Ok(RunData { matrix, stats })
    }
}

fn open_link(config: &RunConfig) -> Result<SerialSensorLink> {
    let mut link = SerialSensorLink::open(&config.port, config.baud, config.read_timeout())
        .with_context(|| format!("cannot connect to sensor array on {}", config.port))?;
    link.clear_buffers()?;
    info!("connected to {} at {} baud", config.port, config.baud);
    Ok(link)
}

/// `collect` mode: capture, calibrate, re-zero if a bias file is present,
/// export the aligned log.
pub fn run_collect(config: &RunConfig) -> Result<()> {
    let profile = CalibrationProfile::load(&config.profile_path, config.sensor_count)?;

    let link = open_link(config)?;
    let mut session = AcquisitionSession::new(link, config);
    let run = session.collect()?;
    info!(
        "captured {} rows, {} frames lost",
        run.matrix.nrows(),
        run.total_rejected()
    );

    let calibrated = profile.apply(&run.matrix)?;
    let output = match ZeroBias::load(&config.bias_path, config.sensor_count) {
        Ok(bias) => bias.apply(&calibrated)?,
        Err(err) => {
            warn!("zero-bias correction skipped: {err}");
            calibrated
        }
    };
    storage::write_aligned_csv(&config.output_path, &output, config.sensor_count)
}

/// `calibrate` mode: stationary capture; the mean of every calibrated axis
/// becomes the bias subtracted on later runs.
pub fn run_calibrate(config: &RunConfig) -> Result<()> {
    let profile = CalibrationProfile::load(&config.profile_path, config.sensor_count)?;

    let link = open_link(config)?;
    let mut session = AcquisitionSession::new(link, config);
    let run = session.collect()?;

    let calibrated = profile.apply(&run.matrix)?;
    let bias = ZeroBias::from_stationary(&calibrated, config.sensor_count)?;
    bias.save(&config.bias_path)?;
    info!("zero bias saved to {}", config.bias_path.display());
    Ok(())
}

/// `extract` mode: turn saved aligned logs into one labeled feature table.
pub fn run_extract(config: &RunConfig) -> Result<()> {
    if config.training_sources.is_empty() {
        anyhow::bail!("extract mode needs at least one training source in the config");
    }
    let mut extractor = FeatureExtractor::new(config.sensor_count);
    let mut table = Vec::new();
    for source in &config.training_sources {
        let log = storage::read_aligned_csv(&source.path)?;
        let vectors = extractor
            .extract(&log, source.label)
            .with_context(|| format!("feature extraction failed for {}", source.path.display()))?;
        info!(
            "{}: {} instances, label {}",
            source.path.display(),
            vectors.len(),
            source.label
        );
        table.extend(vectors);
    }
    storage::write_feature_csv(&config.feature_table_path, &table)
}
