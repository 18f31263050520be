mod config;
mod link;
mod pipeline;
mod protocol;
mod session;
mod storage;

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;

use crate::config::{Mode, RunConfig};

const USAGE: &str = "usage: vibrascope <collect|calibrate|extract> [config.json]";

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mode_arg = args.next().context(USAGE)?;
    let mode = Mode::from_arg(&mode_arg)?;

    let config = match args.next() {
        Some(path) => RunConfig::load(&PathBuf::from(path))?,
        None => RunConfig::default(),
    };
    info!(
        "mode {mode}: {} sensors ({} fields/frame), {} samples/cycle, {} cycles",
        config.sensor_count,
        config.fields_per_frame(),
        config.samples_per_cycle,
        config.cycles
    );

    match mode {
        Mode::Collect => session::run_collect(&config),
        Mode::Calibrate => session::run_calibrate(&config),
        Mode::Extract => session::run_extract(&config),
    }
}
