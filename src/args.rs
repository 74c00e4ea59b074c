// Commandline argument parser using clap for the array-calibration tool

use crate::speaker_table::Geometry;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct CalArgs {
    #[command(subcommand, long_about)]
    /// Which task to perform, calibration or table inspection
    pub command: CommandTask,

    /// Array geometry to operate on
    #[arg(short = 'g', long = "geometry", value_enum)]
    pub geometry: Geometry,

    /// Directory holding the speaker tables and calibration artifacts
    #[arg(short = 'd', long = "data", default_value = "data")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Measure every speaker and write a fresh calibration bank
    #[command(about)]
    Calibrate(CalibrateCommand),

    /// Print the routing table and calibration status for a geometry
    #[command(about)]
    Inspect(InspectCommand),
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct CalibrateCommand {
    /// Bypass threshold in dB; quieter measurements get a flat filter
    #[arg(short = 't', long = "thresh", default_value_t = 80.0)]
    pub threshold: f64,

    /// Lower edge of the analysis band, in Hz
    #[arg(long = "low", default_value_t = 50.0)]
    pub low_freq: f64,

    /// Upper edge of the analysis band, in Hz
    #[arg(long = "high", default_value_t = 16000.0)]
    pub high_freq: f64,

    /// Microphone-to-speaker distance, in meters
    #[arg(long = "dist", default_value_t = 1.6)]
    pub distance: f64,

    /// Directory to dump per-speaker recordings into, as WAV
    #[arg(long = "diag")]
    pub diagnostics_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct InspectCommand {
    /// Only list speakers with an indicator LED fitted
    #[arg(short = 'i', long = "indicators")]
    pub indicators_only: bool,
}
