//! Inverse-filter design and the persisted per-speaker filter bank.
//!
//! The designer is purely numerical: given the probe that was played and
//! the signal that came back, it compares their spectra and builds a
//! frequency-domain correction whose gain at each analysis bin is the
//! negative of the measured amplitude difference. It touches no
//! hardware, and identical inputs produce identical outputs.
//!
//! The bank maps every speaker id to its correction filter and is
//! persisted as a versioned [ron] document; the calibration engine
//! archives the previous artifact and renames a freshly written temp
//! file into place so a crash mid-write can never corrupt the active
//! calibration.

use crate::signal::Signal;

use num_complex::Complex32;
use rustfft::{num_traits::Zero, FftPlanner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Correction gains are clamped to this magnitude so that a bin with
/// barely any recorded energy cannot demand unbounded boost.
pub const MAX_CORRECTION_DB: f32 = 20.0;

/// Spectral bins this far below the probe's peak magnitude are treated
/// as unexcited and get no correction.
const MAGNITUDE_FLOOR_RATIO: f32 = 1e-4;

/// Current on-disk format of [CalibrationBank].
pub const BANK_VERSION: u32 = 1;

fn forward_fft(samples: &[f32], n: usize) -> Vec<Complex32> {
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer: Vec<Complex32> = samples
        .iter()
        .map(|&value| Complex32::new(value, 0.0))
        .collect();
    buffer.resize(n, Complex32::zero());
    fft.process(&mut buffer);
    buffer
}

/// Errors from filter design or application.
#[derive(Debug, PartialEq)]
pub enum FilterError {
    /// Probe and recording must be the same length.
    LengthMismatch { probe: usize, recorded: usize },

    /// Probe and recording must share a sample rate.
    RateMismatch { probe: f64, recorded: f64 },

    /// The analysis band must be non-empty and below Nyquist.
    InvalidBand { low: f64, high: f64 },

    /// A filter only applies to signals of the length it was designed
    /// for.
    WrongSignalLength { expected: usize, found: usize },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::LengthMismatch { probe, recorded } => {
                write!(f, "probe has {} samples but recording has {}", probe, recorded)
            }
            FilterError::RateMismatch { probe, recorded } => {
                write!(f, "probe rate {} differs from recording rate {}", probe, recorded)
            }
            FilterError::InvalidBand { low, high } => {
                write!(f, "analysis band {}..{} Hz is invalid", low, high)
            }
            FilterError::WrongSignalLength { expected, found } => {
                write!(f, "filter designed for {} samples, signal has {}", expected, found)
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// A per-speaker frequency-domain correction: one gain in dB per FFT bin
/// up to Nyquist, for signals of the probe's length. The identity filter
/// (all zeros) passes a signal through unchanged and marks a bypassed
/// speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFilter {
    nsamples: usize,
    samplerate: f64,
    gains_db: Vec<f32>,
}

impl CalibrationFilter {
    /// The flat, no-op filter for signals of `nsamples` length.
    pub fn identity(nsamples: usize, samplerate: f64) -> Self {
        Self {
            nsamples,
            samplerate,
            gains_db: vec![0.0; nsamples / 2 + 1],
        }
    }

    /// True for a flat filter, i.e. a bypassed speaker.
    pub fn is_identity(&self) -> bool {
        self.gains_db.iter().all(|&g| g == 0.0)
    }

    /// Signal length this filter was designed for.
    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Gains in dB, one per bin from DC to Nyquist.
    pub fn gains_db(&self) -> &[f32] {
        &self.gains_db
    }

    /// Filters a signal in the frequency domain: forward FFT, per-bin
    /// gain (mirrored onto the negative frequencies), inverse FFT.
    pub fn apply(&self, signal: &Signal) -> Result<Signal, FilterError> {
        let n = signal.nsamples();
        if n != self.nsamples {
            return Err(FilterError::WrongSignalLength {
                expected: self.nsamples,
                found: n,
            });
        }

        let mut spectrum = forward_fft(signal.samples(), n);
        for (k, bin) in spectrum.iter_mut().enumerate() {
            let mirrored = if k <= n / 2 { k } else { n - k };
            let gain = 10f32.powf(self.gains_db[mirrored] / 20.0);
            *bin *= gain;
        }

        let mut planner = FftPlanner::new();
        let inverse = planner.plan_fft_inverse(n);
        inverse.process(&mut spectrum);

        let scale = 1.0 / n as f32;
        let samples = spectrum.iter().map(|c| c.re * scale).collect();
        Ok(Signal::new(samples, signal.samplerate()))
    }
}

/// Output of [design]: the correction filter plus the diagnostic
/// amplitude-difference curve over the analysis band.
#[derive(Debug, Clone)]
pub struct FilterDesign {
    /// The inverse filter to store for the speaker
    pub filter: CalibrationFilter,
    /// Measured amplitude difference (recorded minus probe) in dB, one
    /// value per analysis bin
    pub amplitude_diff_db: Vec<f32>,
    /// Center frequency of each analysis bin, in Hz
    pub frequencies: Vec<f64>,
}

/// Designs the inverse filter for one speaker from a played probe and
/// the recording that came back, restricted to the `low..high` Hz
/// analysis band. Bins outside the band, and bins where either spectrum
/// falls below the excitation floor, get no correction.
pub fn design(
    probe: &Signal,
    recorded: &Signal,
    low: f64,
    high: f64,
) -> Result<FilterDesign, FilterError> {
    let n = probe.nsamples();
    if recorded.nsamples() != n {
        return Err(FilterError::LengthMismatch {
            probe: n,
            recorded: recorded.nsamples(),
        });
    }
    if probe.samplerate() != recorded.samplerate() {
        return Err(FilterError::RateMismatch {
            probe: probe.samplerate(),
            recorded: recorded.samplerate(),
        });
    }
    let samplerate = probe.samplerate();
    let nyquist = samplerate / 2.0;
    if low < 0.0 || low >= high || high > nyquist {
        return Err(FilterError::InvalidBand { low, high });
    }

    let probe_spectrum = forward_fft(probe.samples(), n);
    let recorded_spectrum = forward_fft(recorded.samples(), n);

    let probe_peak = probe_spectrum
        .iter()
        .take(n / 2 + 1)
        .map(|c| c.norm())
        .fold(0.0f32, f32::max);
    let floor = probe_peak * MAGNITUDE_FLOOR_RATIO;

    let mut gains_db = vec![0.0f32; n / 2 + 1];
    let mut amplitude_diff_db = Vec::new();
    let mut frequencies = Vec::new();

    for k in 0..=n / 2 {
        let freq = k as f64 * samplerate / n as f64;
        if freq < low || freq > high {
            continue;
        }
        let p = probe_spectrum[k].norm();
        let r = recorded_spectrum[k].norm();
        let diff = 20.0 * (r.max(floor) / p.max(floor)).log10();
        amplitude_diff_db.push(diff);
        frequencies.push(freq);
        // an unexcited or dead bin cannot be corrected, only left alone
        if p > floor && r > floor {
            gains_db[k] = (-diff).clamp(-MAX_CORRECTION_DB, MAX_CORRECTION_DB);
        }
    }

    Ok(FilterDesign {
        filter: CalibrationFilter {
            nsamples: n,
            samplerate,
            gains_db,
        },
        amplitude_diff_db,
        frequencies,
    })
}

/// Errors from reading or writing a persisted bank.
#[derive(Debug)]
pub enum BankError {
    /// File could not be read or written.
    Io(std::io::Error),

    /// Serialization of the bank failed.
    Ron(ron::Error),

    /// Deserialization of the bank failed.
    RonSpanned(ron::de::SpannedError),

    /// The artifact was written by an incompatible version.
    Version { found: u32 },
}

impl fmt::Display for BankError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankError::Io(error) => write!(f, "io error: {}", error),
            BankError::Ron(error) => write!(f, "ron error: {}", error),
            BankError::RonSpanned(error) => write!(f, "ron error: {}", error),
            BankError::Version { found } => {
                write!(f, "bank version {} is not {}", found, BANK_VERSION)
            }
        }
    }
}

impl std::error::Error for BankError {}

impl From<std::io::Error> for BankError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// The complete set of per-speaker correction filters for one geometry,
/// keyed by speaker id. Built by a full calibration run and persisted as
/// a versioned artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBank {
    version: u32,
    geometry: String,
    samplerate: f64,
    filters: BTreeMap<u32, CalibrationFilter>,
}

impl CalibrationBank {
    /// An empty bank for a geometry.
    pub fn new(geometry: &str, samplerate: f64) -> Self {
        Self {
            version: BANK_VERSION,
            geometry: geometry.to_string(),
            samplerate,
            filters: BTreeMap::new(),
        }
    }

    /// Stores the filter for a speaker, replacing any previous one.
    pub fn insert(&mut self, speaker_id: u32, filter: CalibrationFilter) {
        self.filters.insert(speaker_id, filter);
    }

    /// The stored filter for a speaker, if the bank covers it.
    pub fn filter(&self, speaker_id: u32) -> Option<&CalibrationFilter> {
        self.filters.get(&speaker_id)
    }

    /// Number of speakers covered.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True when no filters are stored yet.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Geometry this bank was measured for.
    pub fn geometry(&self) -> &str {
        &self.geometry
    }

    /// Speaker ids covered, ascending.
    pub fn speaker_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.filters.keys().copied()
    }

    /// Reads a bank from disk, rejecting artifacts from an incompatible
    /// format version.
    pub fn from_path(path: &Path) -> Result<Self, BankError> {
        let raw = fs::read_to_string(path)?;
        let bank: CalibrationBank =
            ron::from_str(&raw).map_err(BankError::RonSpanned)?;
        if bank.version != BANK_VERSION {
            return Err(BankError::Version {
                found: bank.version,
            });
        }
        Ok(bank)
    }

    /// Serializes the bank to `path`. Plain write; the calibration
    /// engine layers its write-temp-then-rename protocol on top so the
    /// active artifact is replaced atomically.
    pub fn to_path(&self, path: &Path) -> Result<(), BankError> {
        let serialized = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(BankError::Ron)?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::HARDWARE_SAMPLERATE;

    fn probe() -> Signal {
        Signal::chirp(0.05, 50.0, 16000.0, HARDWARE_SAMPLERATE)
    }

    #[test]
    fn identity_filter_passes_signal_through() {
        let probe = probe();
        let filter = CalibrationFilter::identity(probe.nsamples(), probe.samplerate());
        assert!(filter.is_identity());

        let out = filter.apply(&probe).unwrap();
        for (a, b) in probe.samples().iter().zip(out.samples()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn equal_signals_design_a_flat_filter() {
        let probe = probe();
        let recorded = probe.clone();
        let design = design(&probe, &recorded, 50.0, 16000.0).unwrap();
        let max_gain = design
            .filter
            .gains_db()
            .iter()
            .fold(0.0f32, |acc, g| acc.max(g.abs()));
        assert!(max_gain < 0.01);
    }

    #[test]
    fn attenuated_recording_gets_boosted() {
        let probe = probe();
        let recorded = Signal::new(
            probe.samples().iter().map(|s| s * 0.5).collect(),
            probe.samplerate(),
        );
        let design = design(&probe, &recorded, 50.0, 16000.0).unwrap();

        // -6.02 dB across the band wants +6.02 dB of correction
        let n = probe.nsamples();
        let bin_hz = probe.samplerate() / n as f64;
        let mid = (1000.0 / bin_hz) as usize;
        assert!((design.filter.gains_db()[mid] - 6.02).abs() < 0.5);

        // out-of-band bins are untouched
        assert_eq!(design.filter.gains_db()[0], 0.0);
        let top = design.filter.gains_db().len() - 1;
        assert_eq!(design.filter.gains_db()[top], 0.0);
    }

    #[test]
    fn dead_recording_never_demands_unbounded_gain() {
        let probe = probe();
        let recorded = Signal::new(vec![0.0; probe.nsamples()], probe.samplerate());
        let design = design(&probe, &recorded, 50.0, 16000.0).unwrap();
        assert!(design.filter.is_identity());
    }

    #[test]
    fn gains_are_clamped() {
        let probe = probe();
        // barely-above-floor recording: a huge but finite deficit
        let recorded = Signal::new(
            probe.samples().iter().map(|s| s * 1e-3).collect(),
            probe.samplerate(),
        );
        let design = design(&probe, &recorded, 50.0, 16000.0).unwrap();
        for &gain in design.filter.gains_db() {
            assert!(gain.abs() <= MAX_CORRECTION_DB);
        }
    }

    #[test]
    fn design_is_deterministic() {
        let probe = probe();
        let recorded = Signal::new(
            probe.samples().iter().map(|s| s * 0.7).collect(),
            probe.samplerate(),
        );
        let first = design(&probe, &recorded, 50.0, 16000.0).unwrap();
        let second = design(&probe, &recorded, 50.0, 16000.0).unwrap();
        assert_eq!(first.filter, second.filter);
        assert_eq!(first.amplitude_diff_db, second.amplitude_diff_db);
    }

    #[test]
    fn design_rejects_bad_inputs() {
        let probe = probe();
        let short = Signal::new(vec![0.0; 10], probe.samplerate());
        assert!(matches!(
            design(&probe, &short, 50.0, 16000.0),
            Err(FilterError::LengthMismatch { .. })
        ));
        assert!(matches!(
            design(&probe, &probe.clone(), 16000.0, 50.0),
            Err(FilterError::InvalidBand { .. })
        ));
        assert!(matches!(
            design(&probe, &probe.clone(), 50.0, 1e6),
            Err(FilterError::InvalidBand { .. })
        ));
    }

    #[test]
    fn bank_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration_arc.ron");

        let mut bank = CalibrationBank::new("arc", HARDWARE_SAMPLERATE);
        bank.insert(1, CalibrationFilter::identity(64, HARDWARE_SAMPLERATE));
        let probe = Signal::chirp(0.01, 100.0, 8000.0, HARDWARE_SAMPLERATE);
        let recorded = Signal::new(
            probe.samples().iter().map(|s| s * 0.5).collect(),
            probe.samplerate(),
        );
        bank.insert(2, design(&probe, &recorded, 100.0, 8000.0).unwrap().filter);

        bank.to_path(&path).unwrap();
        let read = CalibrationBank::from_path(&path).unwrap();
        assert_eq!(bank, read);
        assert_eq!(read.speaker_ids().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn bank_rejects_foreign_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration_arc.ron");
        let mut bank = CalibrationBank::new("arc", HARDWARE_SAMPLERATE);
        bank.version = BANK_VERSION + 1;
        bank.to_path(&path).unwrap();

        assert!(matches!(
            CalibrationBank::from_path(&path),
            Err(BankError::Version { .. })
        ));
    }
}
